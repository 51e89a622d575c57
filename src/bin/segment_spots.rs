// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use clap::Parser;
use env_logger;
use image::{DynamicImage, ImageBuffer, ImageReader, Luma, Rgb};
use imageproc::drawing;
use log::{info, warn};

use spot_segmenter::{ArrayImage, Image, Spot, SpotSegmenter};

/// Example program for running the SpotSegmenter on a 2D image or a 3D
/// stack of slices.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Image file to process. With --stack, a directory whose image files
    /// are the z slices of a volume, in file name order.
    #[arg(short, long)]
    input: String,

    /// Directory where the annotated image is written. 2D inputs only.
    #[arg(short, long)]
    output: Option<String>,

    /// Expected spot diameter, in physical units.
    #[arg(short, long, default_value_t = 10.0)]
    diameter: f32,

    /// Physical pixel size along each axis. Repeat once per axis; defaults
    /// to 1 for every axis.
    #[arg(long)]
    calibration: Vec<f32>,

    /// Whether a median filter should be applied to suppress impulse noise.
    #[arg(short, long, default_value_t = false)]
    median_filter: std::primitive::bool,

    /// Whether spots touching the image border are reported.
    #[arg(short, long, default_value_t = false)]
    allow_edge_extrema: std::primitive::bool,

    /// Treat the input as a directory of slices forming a 3D volume.
    #[arg(short, long, default_value_t = false)]
    stack: std::primitive::bool,

    /// Output list of spot coordinates.
    #[arg(short, long, default_value_t = false)]
    coords: std::primitive::bool,
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Some(output) = &args.output {
        let output_metadata = fs::metadata(output).unwrap_or_else(|e| {
            panic!("Output dir '{}' does not exist? {:?}", output, e);
        });
        assert!(output_metadata.is_dir(), "Output '{}' must be a directory", output);
    }

    if args.stack {
        let volume = load_stack(&args.input);
        segment(&volume, &args);
        if args.output.is_some() {
            warn!("Annotated output is only written for 2D inputs");
        }
    } else {
        let input_path = PathBuf::from(&args.input);
        let Some(img) = load_slice(&input_path) else {
            process::exit(1);
        };
        let image = ArrayImage::from(&img.to_luma16());
        let spots = segment(&image, &args);
        if let Some(output) = &args.output {
            annotate(img, &spots, &calibration_for(&args, 2), &input_path, output,
                     args.diameter);
        }
    }
}

fn calibration_for(args: &Args, num_dimensions: usize) -> Vec<f32> {
    if args.calibration.is_empty() {
        vec![1.0; num_dimensions]
    } else {
        args.calibration.clone()
    }
}

fn load_slice(path: &Path) -> Option<DynamicImage> {
    let reader = match ImageReader::open(path) {
        Ok(reader) => reader,
        Err(e) => {
            warn!("Cannot open {:?}: {:?}", path, e);
            return None;
        },
    };
    match reader.decode() {
        Ok(img) => Some(img),
        Err(e) => {
            warn!("Skipping {:?} due to: {:?}", path, e);
            None
        },
    }
}

// Stacks the decodable images of a directory along z.
fn load_stack(dir: &str) -> ArrayImage {
    let entries = fs::read_dir(dir).unwrap_or_else(|e| {
        panic!("Input dir '{}' does not exist? {:?}", dir, e);
    });
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    paths.sort();
    let slices: Vec<ImageBuffer<Luma<u16>, Vec<u16>>> = paths.iter()
        .filter_map(|path| load_slice(path))
        .map(|img| img.to_luma16())
        .collect();
    if slices.is_empty() {
        panic!("No images found in '{}'", dir);
    }
    let (width, height) = slices[0].dimensions();
    for (index, slice) in slices.iter().enumerate() {
        assert_eq!(slice.dimensions(), (width, height),
                   "Slice {} differs in size from the first slice", index);
    }
    info!("Loaded {} slices of {}x{}", slices.len(), width, height);
    ArrayImage::from_fn(&[width as usize, height as usize, slices.len()], |p| {
        slices[p[2]].get_pixel(p[0] as u32, p[1] as u32).0[0] as f64
    })
}

fn segment(image: &ArrayImage, args: &Args) -> Vec<Spot> {
    let calibration = calibration_for(args, image.num_dimensions());
    let mut segmenter = SpotSegmenter::new(
        image, args.diameter, calibration, args.median_filter, args.allow_edge_extrema);
    let segmentation_start = Instant::now();
    let spots = match segmenter.process() {
        Ok(spots) => spots.to_vec(),
        Err(e) => {
            warn!("{}", e);
            process::exit(1);
        },
    };
    let elapsed = segmentation_start.elapsed();
    let dimensions = image.dimensions();
    info!("Segmentation of {:?} found {} spots in {:?}",
          dimensions, spots.len(), elapsed);
    info!("{}ms per megapixel\n",
          elapsed.as_secs_f64() * 1000.0
          / (dimensions.iter().product::<usize>() as f64 / 1000000.0));

    if args.coords {
        let mut coords_str = String::new();
        coords_str.push_str(format!("# dimensions {:?}\n", dimensions).as_str());
        coords_str.push_str("# name: (x, y[, z])\n");
        for spot in &spots {
            coords_str.push_str(format!("{}: {:?},\n", spot.name, spot.coordinates).as_str());
        }
        info!("{}", coords_str);
    }
    spots
}

// Scribble circles into the image showing where we found spots.
fn annotate(img: DynamicImage, spots: &[Spot], calibration: &[f32],
            input_path: &Path, output: &str, diameter: f32) {
    let mut output_path = PathBuf::from(output);
    output_path.push(input_path.file_name().unwrap_or_default());
    output_path.set_extension("bmp");

    let radius = i32::max(2, (diameter / (2.0 * calibration[0])).round() as i32);
    let mut img_color = img.into_rgb8();
    for spot in spots {
        let x = spot.coordinates[0] / calibration[0];
        let y = spot.coordinates[1] / calibration[1];
        drawing::draw_hollow_circle_mut(
            &mut img_color, (x.round() as i32, y.round() as i32), radius,
            Rgb::<u8>([255, 0, 0]));
    }
    match img_color.save(&output_path) {
        Ok(()) => info!("Wrote {:?}", output_path),
        Err(e) => warn!("Could not write {:?}: {:?}", output_path, e),
    }
}
