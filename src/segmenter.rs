// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::time::Instant;

use log::{debug, info, warn};
use thiserror::Error;

use crate::downsample::DownSample;
use crate::extrema::{ExtremumKind, RegionalExtremaFinder};
use crate::fourier_convolution::FourierConvolution;
use crate::image_funcs::{ArrayImage, Image};
use crate::kernels::KernelCache;
use crate::median_filter::MedianFilter;
use crate::pipeline::{Pipeline, PipelineError, Stage};

/// Objects are down-sampled until they span at most this many pixels. Larger
/// values improve localization at the cost of slower convolutions.
pub const GOAL_DOWNSAMPLED_BLOB_DIAMETER: f32 = 10.0;

/// Smoothing assumed in the source image and wanted in the down-sampled
/// image, in pixels of each.
pub const DOWNSAMPLE_SIGMA: f64 = 0.5;

/// Filter responses within this fraction of the source image's peak absolute
/// intensity are treated as equal, and responses below it as background.
pub const EXTREMA_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SegmenterError {
    #[error("SpotSegmenter: Image is not set")]
    NoImage,

    #[error("SpotSegmenter: Only 2D and 3D images are supported, got {0}D")]
    UnsupportedDimensionality(usize),

    #[error("SpotSegmenter: Diameter must be positive, got {0}")]
    InvalidDiameter(f32),

    #[error("SpotSegmenter: Calibration is not set")]
    NoCalibration,

    #[error("SpotSegmenter: Calibration has {actual} entries for a {expected}D image")]
    CalibrationMismatch { expected: usize, actual: usize },

    #[error("SpotSegmenter: Calibration entries must be positive, got {0:?}")]
    InvalidCalibration(Vec<f32>),

    #[error("SpotSegmenter: {0}")]
    Stage(#[from] PipelineError),
}

/// Parameters of a segmentation run.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmenterConfig {
    /// Expected object diameter, in physical units.
    pub diameter: f32,

    /// Physical size of a pixel along each axis.
    pub calibration: Option<Vec<f32>>,

    /// Apply a median filter after down-sampling. Helps with
    /// salt-and-pepper noise.
    pub use_median_filter: bool,

    /// Report extrema whose plateau touches the image border.
    pub allow_edge_extrema: bool,
}

impl SegmenterConfig {
    pub fn new(diameter: f32, calibration: Vec<f32>) -> SegmenterConfig {
        SegmenterConfig{diameter, calibration: Some(calibration),
                        use_median_filter: false, allow_edge_extrema: false}
    }
}

/// A detected object.
#[derive(Clone, Debug, PartialEq)]
pub struct Spot {
    /// Position in physical units, one entry per image axis.
    pub coordinates: Vec<f32>,

    /// "Spot 0", "Spot 1", ... in detection order.
    pub name: String,
}

impl fmt::Display for Spot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {:?}", self.name, self.coordinates)
    }
}

/// Per-axis shrink factor applied before filtering: objects larger than
/// [GOAL_DOWNSAMPLED_BLOB_DIAMETER] pixels are reduced to that size. Never
/// less than 1.
pub fn downsample_factors(calibration: &[f32], diameter: f32) -> Vec<f32> {
    calibration.iter().map(|&c| {
        let pixel_diameter = diameter / c;
        if pixel_diameter > GOAL_DOWNSAMPLED_BLOB_DIAMETER {
            pixel_diameter / GOAL_DOWNSAMPLED_BLOB_DIAMETER
        } else {
            1.0
        }
    }).collect()
}

/// Extent of the down-sampled image: `floor(extent / factor)` per axis.
pub fn downsampled_dimensions(dimensions: &[usize], factors: &[f32]) -> Vec<usize> {
    dimensions.iter().zip(factors)
        .map(|(&n, &f)| (n as f32 / f).floor() as usize)
        .collect()
}

/// Maps pixel centroids of the down-sampled image to physical coordinates of
/// the source image, naming the spots in order.
pub fn convert_to_spots(centroids: &[Vec<f64>], calibration: &[f32],
                        factors: &[f32]) -> Vec<Spot> {
    centroids.iter().enumerate().map(|(i, centroid)| {
        let coordinates = centroid.iter().enumerate()
            .map(|(axis, &p)| (p * calibration[axis] as f64 * factors[axis] as f64) as f32)
            .collect();
        Spot{coordinates, name: format!("Spot {}", i)}
    }).collect()
}

/// Finds roughly round bright objects of a given physical size in 2D images
/// and 3D volumes.
///
/// The image is down-sampled so objects span about
/// [GOAL_DOWNSAMPLED_BLOB_DIAMETER] pixels, optionally median filtered, then
/// convolved with a Gaussian and a Laplacian (together approximating a
/// Laplacian-of-Gaussian blob detector). Regional maxima of the response are
/// the spots.
///
/// Kernels depend on the image only through its dimensionality. They are
/// built when the first image is bound and rebuilt only when an image of a
/// different dimensionality replaces it.
///
/// A failed [SpotSegmenter::process()] clears the published spots and
/// filtered image, so stale results from an earlier run are never returned
/// alongside an error.
pub struct SpotSegmenter<'a, I: Image> {
    image: Option<&'a I>,
    config: SegmenterConfig,

    kernels: Option<KernelCache>,
    kernel_builds: usize,

    // Caller-supplied stages, run after the Laplacian convolution.
    extra_stages: Vec<Box<dyn Stage + 'a>>,

    spots: Vec<Spot>,
    filtered_image: Option<ArrayImage>,
    error_message: Option<String>,
}

impl<'a, I: Image> SpotSegmenter<'a, I> {
    pub fn new(image: &'a I, diameter: f32, calibration: Vec<f32>,
               use_median_filter: bool, allow_edge_extrema: bool) -> SpotSegmenter<'a, I> {
        let config = SegmenterConfig{diameter, calibration: Some(calibration),
                                     use_median_filter, allow_edge_extrema};
        SpotSegmenter::from_config(Some(image), config)
    }

    /// Median filter and edge extrema off.
    pub fn with_calibration(image: &'a I, diameter: f32, calibration: Vec<f32>)
                            -> SpotSegmenter<'a, I> {
        SpotSegmenter::new(image, diameter, calibration, false, false)
    }

    /// Calibration taken from the image. If the image has none,
    /// [SpotSegmenter::check_input()] reports it.
    pub fn with_image_calibration(image: &'a I, diameter: f32) -> SpotSegmenter<'a, I> {
        let config = SegmenterConfig{diameter, calibration: image.calibration(),
                                     use_median_filter: false,
                                     allow_edge_extrema: false};
        SpotSegmenter::from_config(Some(image), config)
    }

    /// A segmenter without an image can be configured, but fails validation
    /// until [SpotSegmenter::set_image()] is called.
    pub fn from_config(image: Option<&'a I>, config: SegmenterConfig) -> SpotSegmenter<'a, I> {
        let mut segmenter = SpotSegmenter{
            image: None, config, kernels: None, kernel_builds: 0,
            extra_stages: Vec::new(), spots: Vec::new(),
            filtered_image: None, error_message: None};
        if let Some(image) = image {
            segmenter.set_image(image);
        }
        segmenter
    }

    /// Binds a new image. Published spots and the filtered image are cleared.
    /// Kernels are kept if `image` has the same dimensionality as the image
    /// they were built for.
    pub fn set_image(&mut self, image: &'a I) {
        let num_dimensions = image.num_dimensions();
        let reusable = self.kernels.as_ref().is_some_and(|k| k.serves(num_dimensions));
        if !reusable {
            self.kernels = Some(KernelCache::build(
                num_dimensions, self.config.diameter, self.config.calibration.as_deref(),
                GOAL_DOWNSAMPLED_BLOB_DIAMETER));
            self.kernel_builds += 1;
        } else {
            debug!("Reusing {}D kernels", num_dimensions);
        }
        self.spots.clear();
        self.filtered_image = None;
        self.image = Some(image);
    }

    pub fn set_use_median_filter(&mut self, use_median_filter: bool) {
        self.config.use_median_filter = use_median_filter;
    }

    pub fn set_allow_edge_extrema(&mut self, allow_edge_extrema: bool) {
        self.config.allow_edge_extrema = allow_edge_extrema;
    }

    /// Appends a stage that runs on the Laplacian response before extrema
    /// detection. Stages run in the order they were added.
    pub fn add_stage(&mut self, stage: Box<dyn Stage + 'a>) {
        self.extra_stages.push(stage);
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    pub fn kernels(&self) -> Option<&KernelCache> {
        self.kernels.as_ref()
    }

    /// Number of times the kernels have been built.
    pub fn kernel_builds(&self) -> usize {
        self.kernel_builds
    }

    /// Gaussian width in physical units, `diameter / sqrt(N)`, once an image
    /// is bound.
    pub fn sigma(&self) -> Option<f32> {
        self.kernels.as_ref().map(|k| k.sigma())
    }

    /// Validates the image and configuration. Has no side effects.
    pub fn check_input(&self) -> Result<(), SegmenterError> {
        let Some(image) = self.image else {
            return Err(SegmenterError::NoImage);
        };
        let num_dimensions = image.num_dimensions();
        if num_dimensions != 2 && num_dimensions != 3 {
            return Err(SegmenterError::UnsupportedDimensionality(num_dimensions));
        }
        let diameter = self.config.diameter;
        if !(diameter > 0.0) || !diameter.is_finite() {
            return Err(SegmenterError::InvalidDiameter(diameter));
        }
        let Some(calibration) = &self.config.calibration else {
            return Err(SegmenterError::NoCalibration);
        };
        if calibration.len() != num_dimensions {
            return Err(SegmenterError::CalibrationMismatch{
                expected: num_dimensions, actual: calibration.len()});
        }
        if calibration.iter().any(|&c| !(c > 0.0) || !c.is_finite()) {
            return Err(SegmenterError::InvalidCalibration(calibration.clone()));
        }
        Ok(())
    }

    /// Runs the segmentation and publishes its spots and filtered image. On
    /// failure both are cleared and [SpotSegmenter::error_message()] holds
    /// the reason.
    pub fn process(&mut self) -> Result<&[Spot], SegmenterError> {
        let process_start = Instant::now();
        match self.run() {
            Ok((filtered, spots)) => {
                info!("Found {} spots in {:?}", spots.len(), process_start.elapsed());
                for spot in &spots {
                    debug!("{}", spot);
                }
                self.spots = spots;
                self.filtered_image = Some(filtered);
                self.error_message = None;
                Ok(&self.spots)
            },
            Err(e) => {
                warn!("{}", e);
                self.spots.clear();
                self.filtered_image = None;
                self.error_message = Some(e.to_string());
                Err(e)
            },
        }
    }

    /// Spots from the last successful [SpotSegmenter::process()], in
    /// physical units. Empty after an image change or a failed run.
    pub fn result(&self) -> &[Spot] {
        &self.spots
    }

    /// The filter response the spots were detected in, in down-sampled
    /// pixels.
    pub fn filtered_image(&self) -> Option<&ArrayImage> {
        self.filtered_image.as_ref()
    }

    /// Why the last [SpotSegmenter::process()] failed. None if it succeeded.
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    fn run(&self) -> Result<(ArrayImage, Vec<Spot>), SegmenterError> {
        self.check_input()?;
        let (Some(image), Some(kernels)) = (self.image, self.kernels.as_ref()) else {
            return Err(SegmenterError::NoImage);
        };
        let Some(calibration) = self.config.calibration.as_deref() else {
            return Err(SegmenterError::NoCalibration);
        };

        let source = ArrayImage::from_image(image);
        let tolerance = EXTREMA_TOLERANCE * source.max_abs();
        let factors = downsample_factors(calibration, self.config.diameter);
        let target = downsampled_dimensions(&source.dimensions(), &factors);
        debug!("Down-sampling {:?} by {:?} to {:?}",
               source.dimensions(), factors, target);

        let mut pipeline = Pipeline::new();
        pipeline.push(Box::new(DownSample::new(target, DOWNSAMPLE_SIGMA, DOWNSAMPLE_SIGMA)));
        if self.config.use_median_filter {
            pipeline.push(Box::new(MedianFilter::new(kernels.structuring_element())));
        }
        pipeline.push(Box::new(FourierConvolution::new(
            kernels.gaussian(), "Gaussian convolution")));
        pipeline.push(Box::new(FourierConvolution::new(
            kernels.laplacian(), "Laplacian convolution")));
        for stage in &self.extra_stages {
            pipeline.push(Box::new(stage.as_ref()));
        }
        let filter_start = Instant::now();
        let filtered = pipeline.run(source)?;
        info!("Filtered to {:?} in {:?}", filtered.dimensions(), filter_start.elapsed());

        let finder = RegionalExtremaFinder::new(
            ExtremumKind::Maxima, self.config.allow_edge_extrema, tolerance);
        let centroids = finder.find(&filtered).map_err(|source| {
            PipelineError{stage: "Extrema detection".to_string(), source}
        })?;
        Ok((filtered, convert_to_spots(&centroids, calibration, &factors)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use approx::assert_abs_diff_eq;
    use image::{GrayImage, Luma};
    use imageproc::drawing::draw_filled_circle_mut;
    use crate::pipeline::StageError;
    use crate::roi_image::RoiImage;
    use super::*;

    // A bright disc of radius 10 on a flat background.
    fn disc_image(width: u32, height: u32, center: (i32, i32)) -> ArrayImage {
        let mut image = GrayImage::from_pixel(width, height, Luma([10]));
        draw_filled_circle_mut(&mut image, center, 10, Luma([200]));
        ArrayImage::from(&image)
    }

    fn ball_volume(dimensions: &[usize], center: &[f64], radii: &[f64]) -> ArrayImage {
        ArrayImage::from_fn(dimensions, |p| {
            let r: f64 = p.iter().enumerate()
                .map(|(axis, &i)| ((i as f64 - center[axis]) / radii[axis]).powi(2))
                .sum();
            if r <= 1.0 { 200.0 } else { 10.0 }
        })
    }

    fn assert_spot_near(spot: &Spot, expected: &[f32], epsilon: f32) {
        assert_eq!(spot.coordinates.len(), expected.len());
        for (&c, &e) in spot.coordinates.iter().zip(expected) {
            assert_abs_diff_eq!(c, e, epsilon = epsilon);
        }
    }

    struct FailingStage;

    impl Stage for FailingStage {
        fn name(&self) -> &str {
            "Failing stage"
        }

        fn check_input(&self, _input: &ArrayImage) -> Result<(), StageError> {
            Ok(())
        }

        fn process(&self, _input: &ArrayImage) -> Result<ArrayImage, StageError> {
            Err(StageError::ProcessingFailed("out of luck".to_string()))
        }
    }

    #[test]
    fn test_single_disc() {
        let image = disc_image(64, 64, (32, 32));
        let mut segmenter = SpotSegmenter::with_calibration(&image, 20.0, vec![1.0, 1.0]);
        let spots = segmenter.process().unwrap();
        assert_eq!(spots.len(), 1);
        assert_eq!(spots[0].name, "Spot 0");
        assert_spot_near(&spots[0], &[32.0, 32.0], 1.0);
        // Filtered image is in down-sampled pixels.
        assert_eq!(segmenter.filtered_image().unwrap().dimensions(), vec![32, 32]);
        assert_eq!(segmenter.error_message(), None);
    }

    #[test]
    fn test_single_disc_with_median_filter() {
        let image = disc_image(64, 64, (32, 32));
        let mut segmenter = SpotSegmenter::new(&image, 20.0, vec![1.0, 1.0], true, false);
        let spots = segmenter.process().unwrap();
        assert_eq!(spots.len(), 1);
        assert_spot_near(&spots[0], &[32.0, 32.0], 1.0);
    }

    #[test]
    fn test_flat_image_has_no_spots() {
        let image = ArrayImage::from_elem(&[48, 40], 10.0);
        let mut segmenter = SpotSegmenter::with_calibration(&image, 20.0, vec![1.0, 1.0]);
        assert!(segmenter.process().unwrap().is_empty());
        segmenter.set_allow_edge_extrema(true);
        assert!(segmenter.config().allow_edge_extrema);
        assert!(!segmenter.config().use_median_filter);
        assert!(segmenter.process().unwrap().is_empty());
        assert!(segmenter.filtered_image().is_some());
    }

    #[test]
    fn test_calibrated_coordinates() {
        // 10 units at 0.5 units/pixel is a 20 pixel disc; coordinates come
        // back in physical units.
        let image = disc_image(80, 80, (30, 44)).with_calibration(vec![0.5, 0.5]);
        let mut segmenter = SpotSegmenter::with_image_calibration(&image, 10.0);
        let spots = segmenter.process().unwrap();
        assert_eq!(spots.len(), 1);
        assert_spot_near(&spots[0], &[15.0, 22.0], 1.0);
    }

    #[test]
    fn test_two_discs_in_detection_order() {
        let mut image = GrayImage::from_pixel(96, 64, Luma([10]));
        draw_filled_circle_mut(&mut image, (68, 32), 8, Luma([200]));
        draw_filled_circle_mut(&mut image, (28, 32), 8, Luma([200]));
        let image = ArrayImage::from(&image);
        let mut segmenter = SpotSegmenter::with_calibration(&image, 16.0, vec![1.0, 1.0]);
        let spots = segmenter.process().unwrap();
        assert_eq!(spots.len(), 2);
        assert_eq!(spots[0].name, "Spot 0");
        assert_eq!(spots[1].name, "Spot 1");
        assert_spot_near(&spots[0], &[28.0, 32.0], 1.5);
        assert_spot_near(&spots[1], &[68.0, 32.0], 1.5);
    }

    #[test]
    fn test_3d_ball() {
        let volume = ball_volume(&[24, 24, 24], &[12.0, 12.0, 12.0], &[4.0, 4.0, 4.0]);
        let mut segmenter = SpotSegmenter::with_calibration(&volume, 8.0, vec![1.0, 1.0, 1.0]);
        let spots = segmenter.process().unwrap();
        assert_eq!(spots.len(), 1);
        assert_spot_near(&spots[0], &[12.0, 12.0, 12.0], 1.0);
        assert_abs_diff_eq!(segmenter.sigma().unwrap(), 8.0 / 3.0_f32.sqrt(), epsilon = 1e-5);
    }

    #[test]
    fn test_3d_anisotropic_calibration() {
        // z voxels are twice as deep, so the ball spans half as many of them.
        let volume = ball_volume(&[24, 24, 12], &[12.0, 12.0, 6.0], &[4.0, 4.0, 2.0]);
        let mut segmenter = SpotSegmenter::with_calibration(&volume, 8.0, vec![1.0, 1.0, 2.0]);
        let spots = segmenter.process().unwrap();
        assert_eq!(spots.len(), 1);
        assert_spot_near(&spots[0], &[12.0, 12.0, 12.0], 1.0);
    }

    #[test]
    fn test_region_of_interest_input() {
        let canvas = disc_image(100, 100, (50, 60));
        let roi = RoiImage::new(&canvas, &[18, 28], &[64, 64]).unwrap();
        let mut segmenter = SpotSegmenter::with_calibration(&roi, 20.0, vec![1.0, 1.0]);
        let spots = segmenter.process().unwrap();
        assert_eq!(spots.len(), 1);
        // Relative to the region's origin.
        assert_spot_near(&spots[0], &[32.0, 32.0], 1.0);
    }

    #[test]
    fn test_set_image_reuses_kernels() {
        let first = disc_image(64, 64, (32, 32));
        let second = disc_image(64, 48, (20, 24));
        let volume = ArrayImage::from_elem(&[8, 8, 8], 10.0);
        let mut segmenter = SpotSegmenter::with_calibration(&first, 20.0, vec![1.0, 1.0]);
        assert_eq!(segmenter.kernel_builds(), 1);
        assert_eq!(segmenter.process().unwrap().len(), 1);
        assert!(segmenter.filtered_image().is_some());

        // Same dimensionality: kernels kept, results cleared.
        segmenter.set_image(&second);
        assert_eq!(segmenter.kernel_builds(), 1);
        assert!(segmenter.result().is_empty());
        assert!(segmenter.filtered_image().is_none());

        // New dimensionality: kernels rebuilt.
        segmenter.set_image(&volume);
        assert_eq!(segmenter.kernel_builds(), 2);
        assert_eq!(segmenter.kernels().unwrap().num_dimensions(), 3);
        // The 2D calibration no longer fits.
        assert_eq!(segmenter.check_input(),
                   Err(SegmenterError::CalibrationMismatch{expected: 3, actual: 2}));
    }

    #[test]
    fn test_sigma() {
        let image = ArrayImage::zeros(&[16, 16]);
        let segmenter = SpotSegmenter::with_calibration(&image, 20.0, vec![1.0, 1.0]);
        assert_abs_diff_eq!(segmenter.sigma().unwrap(), 14.142, epsilon = 1e-3);
        let volume = ArrayImage::zeros(&[8, 8, 8]);
        let segmenter = SpotSegmenter::with_calibration(&volume, 20.0, vec![1.0, 1.0, 1.0]);
        assert_abs_diff_eq!(segmenter.sigma().unwrap(), 11.547, epsilon = 1e-3);
    }

    #[test]
    fn test_check_input_errors_are_distinct() {
        let image = ArrayImage::zeros(&[16, 16]);
        let line = ArrayImage::zeros(&[16]);
        let valid = SegmenterConfig::new(20.0, vec![1.0, 1.0]);
        let no_calibration = SegmenterConfig{calibration: None, ..valid.clone()};

        let cases = vec![
            (SpotSegmenter::from_config(None, valid.clone()), SegmenterError::NoImage),
            (SpotSegmenter::from_config(Some(&line), SegmenterConfig::new(20.0, vec![1.0])),
             SegmenterError::UnsupportedDimensionality(1)),
            (SpotSegmenter::from_config(Some(&image), SegmenterConfig::new(0.0, vec![1.0, 1.0])),
             SegmenterError::InvalidDiameter(0.0)),
            (SpotSegmenter::from_config(Some(&image), no_calibration),
             SegmenterError::NoCalibration),
            (SpotSegmenter::from_config(Some(&image), SegmenterConfig::new(20.0, vec![1.0])),
             SegmenterError::CalibrationMismatch{expected: 2, actual: 1}),
            (SpotSegmenter::from_config(Some(&image), SegmenterConfig::new(20.0, vec![1.0, 0.0])),
             SegmenterError::InvalidCalibration(vec![1.0, 0.0])),
        ];
        let mut messages = HashSet::new();
        for (segmenter, expected) in &cases {
            let error = segmenter.check_input().unwrap_err();
            assert_eq!(&error, expected);
            // Repeatable and side-effect free.
            assert_eq!(segmenter.check_input().unwrap_err(), error);
            assert_eq!(segmenter.error_message(), None);
            let message = error.to_string();
            assert!(message.starts_with("SpotSegmenter: "));
            messages.insert(message);
        }
        assert_eq!(messages.len(), cases.len());
    }

    #[test]
    fn test_check_input_rejects_non_finite_values() {
        let image = ArrayImage::zeros(&[16, 16]);
        for &diameter in &[f32::NAN, f32::INFINITY] {
            let segmenter = SpotSegmenter::with_calibration(&image, diameter, vec![1.0, 1.0]);
            assert!(matches!(segmenter.check_input(),
                             Err(SegmenterError::InvalidDiameter(d)) if !d.is_finite()));
        }
        let segmenter = SpotSegmenter::with_calibration(&image, 20.0, vec![1.0, f32::INFINITY]);
        assert_eq!(segmenter.check_input(),
                   Err(SegmenterError::InvalidCalibration(vec![1.0, f32::INFINITY])));
        let segmenter = SpotSegmenter::with_calibration(&image, 20.0, vec![f32::NAN, 1.0]);
        assert!(matches!(segmenter.check_input(),
                         Err(SegmenterError::InvalidCalibration(_))));
    }

    #[test]
    fn test_process_validates_first() {
        let image = ArrayImage::zeros(&[16, 16]);
        let mut segmenter = SpotSegmenter::with_calibration(&image, -1.0, vec![1.0, 1.0]);
        assert_eq!(segmenter.process(), Err(SegmenterError::InvalidDiameter(-1.0)));
        assert_eq!(segmenter.error_message(),
                   Some("SpotSegmenter: Diameter must be positive, got -1"));
    }

    #[test]
    fn test_stage_failure_clears_results() {
        let image = disc_image(64, 64, (32, 32));
        let mut segmenter = SpotSegmenter::with_calibration(&image, 20.0, vec![1.0, 1.0]);
        assert_eq!(segmenter.process().unwrap().len(), 1);

        segmenter.add_stage(Box::new(FailingStage));
        let error = segmenter.process().unwrap_err();
        assert_eq!(error.to_string(),
                   "SpotSegmenter: Failing stage failed:\nProcessing failed: out of luck");
        assert!(segmenter.result().is_empty());
        assert!(segmenter.filtered_image().is_none());
        assert_eq!(segmenter.error_message(), Some(error.to_string().as_str()));
    }

    #[test]
    fn test_downsampling_failure() {
        // A 100 unit object shrinks a 4x4 image to nothing.
        let image = ArrayImage::from_elem(&[4, 4], 1.0);
        let mut segmenter = SpotSegmenter::with_calibration(&image, 100.0, vec![1.0, 1.0]);
        assert!(segmenter.check_input().is_ok());
        let error = segmenter.process().unwrap_err();
        match &error {
            SegmenterError::Stage(e) => assert_eq!(e.stage, "Down-sampling"),
            _ => panic!("unexpected error {:?}", error),
        }
        assert!(segmenter.error_message().unwrap()
                .starts_with("SpotSegmenter: Down-sampling failed:\nInvalid input: "));
    }

    #[test]
    fn test_added_stage_sees_laplacian_response() {
        struct Negate;
        impl Stage for Negate {
            fn name(&self) -> &str {
                "Negate"
            }
            fn check_input(&self, _input: &ArrayImage) -> Result<(), StageError> {
                Ok(())
            }
            fn process(&self, input: &ArrayImage) -> Result<ArrayImage, StageError> {
                Ok(ArrayImage::new(input.data().mapv(|v| -v)))
            }
        }
        // Negating the response turns the disc center into a minimum, so no
        // maxima remain inside it.
        let image = disc_image(64, 64, (32, 32));
        let mut segmenter = SpotSegmenter::with_calibration(&image, 20.0, vec![1.0, 1.0]);
        segmenter.add_stage(Box::new(Negate));
        let spots = segmenter.process().unwrap();
        assert!(spots.iter().all(|s| {
            (s.coordinates[0] - 32.0).abs() > 2.0 || (s.coordinates[1] - 32.0).abs() > 2.0
        }));
    }

    #[test]
    fn test_downsample_factors() {
        for &diameter in &[0.5_f32, 5.0, 10.0, 20.0, 37.5, 400.0] {
            for &calibration in &[0.1_f32, 0.5, 1.0, 3.0] {
                let factors = downsample_factors(&[calibration, 1.0], diameter);
                let expected = f32::max(1.0, diameter / calibration / 10.0);
                assert_abs_diff_eq!(factors[0], expected, epsilon = 1e-5);
                assert!(factors[0] >= 1.0);
            }
        }
        assert_eq!(downsample_factors(&[1.0, 2.0, 0.5], 20.0), vec![2.0, 1.0, 4.0]);
        assert_eq!(downsampled_dimensions(&[64, 33, 10], &[2.0, 1.0, 4.0]), vec![32, 33, 2]);
    }

    #[test]
    fn test_coordinate_round_trip() {
        let calibration = [0.3_f32, 2.0, 0.75];
        let factors = [1.7_f32, 1.0, 3.2];
        let centroids = vec![vec![3.25, 7.5, 0.0], vec![11.0, 0.5, 4.125]];
        let spots = convert_to_spots(&centroids, &calibration, &factors);
        assert_eq!(spots.len(), 2);
        assert_eq!(spots[1].name, "Spot 1");
        for (spot, centroid) in spots.iter().zip(&centroids) {
            for axis in 0..3 {
                let pixel = spot.coordinates[axis] as f64
                    / calibration[axis] as f64 / factors[axis] as f64;
                assert_abs_diff_eq!(pixel, centroid[axis], epsilon = 1e-5);
            }
        }
        assert_eq!(spots[0].to_string(), format!("Spot 0 at {:?}", spots[0].coordinates));
    }
}
