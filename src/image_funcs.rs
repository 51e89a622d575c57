// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use image::{ImageBuffer, Luma, Primitive};
use ndarray::{ArrayD, Dimension, IxDyn};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ImageError {
    #[error("Expected a {expected}D position, got {actual}D")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Region at offset {offset:?} with size {size:?} exceeds image dimensions {dimensions:?}")]
    RegionOutOfBounds {
        offset: Vec<usize>,
        size: Vec<usize>,
        dimensions: Vec<usize>,
    },

    #[error("Position {0:?} has non-finite coordinates")]
    NonFinitePosition(Vec<f64>),

    #[error("{0} is not supported by this image")]
    Unsupported(&'static str),
}

/// Read access to an N-dimensional scalar image. Axis 0 is x, axis 1 is y and
/// (for volumes) axis 2 is z.
///
/// Implementors only need to provide [Image::dimensions()] and [Image::get()];
/// iteration is built on top of those by [Cursor].
pub trait Image {
    /// Extent of the image along each axis.
    fn dimensions(&self) -> Vec<usize>;

    /// Sample at `position`, or None if the position lies outside the image.
    fn get(&self, position: &[usize]) -> Option<f64>;

    fn num_dimensions(&self) -> usize {
        self.dimensions().len()
    }

    /// Physical size of a pixel along each axis, if the image carries one.
    fn calibration(&self) -> Option<Vec<f32>> {
        None
    }

    /// Sample at a fractional position. Only owned raster containers support
    /// this; views must be materialized first.
    fn interpolate(&self, _position: &[f64]) -> Result<f64, ImageError> {
        Err(ImageError::Unsupported("interpolation"))
    }

    /// Enumerates every pixel in raster order (last axis fastest).
    fn cursor(&self) -> Cursor<'_, Self> where Self: Sized {
        Cursor::new(self)
    }
}

// An iterator over all pixels of an image. Yields (position, value) in raster
// scan order.
pub struct Cursor<'a, I: Image> {
    image: &'a I,
    dimensions: Vec<usize>,

    // Identifies the next pixel to be yielded; None once the iteration is
    // finished.
    position: Option<Vec<usize>>,
}

impl<'a, I: Image> Cursor<'a, I> {
    pub fn new(image: &'a I) -> Cursor<'a, I> {
        let dimensions = image.dimensions();
        let empty = dimensions.is_empty() || dimensions.iter().any(|&d| d == 0);
        let position = if empty { None } else { Some(vec![0; dimensions.len()]) };
        Cursor{image, dimensions, position}
    }
}

impl<'a, I: Image> Iterator for Cursor<'a, I> {
    type Item = (Vec<usize>, f64);

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.position.take()?;
        let value = self.image.get(&current)?;
        // Advance, carrying into slower axes.
        let mut next = current.clone();
        let mut axis = next.len();
        loop {
            if axis == 0 {
                break;  // Wrapped past the first axis; iteration finished.
            }
            axis -= 1;
            next[axis] += 1;
            if next[axis] < self.dimensions[axis] {
                self.position = Some(next);
                break;
            }
            next[axis] = 0;
        }
        Some((current, value))
    }
}

/// Maps a possibly out-of-range index into `0..n` by whole-sample mirroring:
/// `d c b | a b c d | c b a`.
pub fn mirror_index(index: isize, n: usize) -> usize {
    if n <= 1 {
        return 0;
    }
    let period = 2 * (n as isize - 1);
    let wrapped = index.rem_euclid(period);
    if wrapped < n as isize {
        wrapped as usize
    } else {
        (period - wrapped) as usize
    }
}

/// Owned raster image. This is the container every pipeline stage consumes
/// and produces.
#[derive(Clone, Debug, PartialEq)]
pub struct ArrayImage {
    data: ArrayD<f64>,
    calibration: Option<Vec<f32>>,
}

impl ArrayImage {
    pub fn new(data: ArrayD<f64>) -> ArrayImage {
        ArrayImage{data, calibration: None}
    }

    pub fn zeros(dimensions: &[usize]) -> ArrayImage {
        ArrayImage::new(ArrayD::zeros(IxDyn(dimensions)))
    }

    pub fn from_elem(dimensions: &[usize], value: f64) -> ArrayImage {
        ArrayImage::new(ArrayD::from_elem(IxDyn(dimensions), value))
    }

    /// Builds an image by evaluating `f` at every position.
    pub fn from_fn<F>(dimensions: &[usize], mut f: F) -> ArrayImage
    where F: FnMut(&[usize]) -> f64 {
        ArrayImage::new(ArrayD::from_shape_fn(IxDyn(dimensions),
                                              |index: IxDyn| f(index.slice())))
    }

    /// Copies any [Image] into an owned raster, keeping its calibration.
    pub fn from_image<I: Image>(image: &I) -> ArrayImage {
        let mut data = ArrayD::zeros(IxDyn(&image.dimensions()));
        for (position, value) in image.cursor() {
            data[position.as_slice()] = value;
        }
        ArrayImage{data, calibration: image.calibration()}
    }

    pub fn with_calibration(mut self, calibration: Vec<f32>) -> ArrayImage {
        self.calibration = Some(calibration);
        self
    }

    pub fn data(&self) -> &ArrayD<f64> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ArrayD<f64> {
        &mut self.data
    }

    pub fn into_data(self) -> ArrayD<f64> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Largest absolute sample value; 0 for an empty image.
    pub fn max_abs(&self) -> f64 {
        self.data.iter().fold(0.0_f64, |acc, v| f64::max(acc, v.abs()))
    }
}

impl Image for ArrayImage {
    fn dimensions(&self) -> Vec<usize> {
        self.data.shape().to_vec()
    }

    fn num_dimensions(&self) -> usize {
        self.data.ndim()
    }

    fn get(&self, position: &[usize]) -> Option<f64> {
        if position.len() != self.data.ndim() {
            return None;
        }
        self.data.get(position).copied()
    }

    fn calibration(&self) -> Option<Vec<f32>> {
        self.calibration.clone()
    }

    // N-linear interpolation. Positions are clamped to the image extent.
    fn interpolate(&self, position: &[f64]) -> Result<f64, ImageError> {
        let ndim = self.data.ndim();
        if position.len() != ndim {
            return Err(ImageError::DimensionMismatch{expected: ndim,
                                                     actual: position.len()});
        }
        if position.iter().any(|p| !p.is_finite()) {
            return Err(ImageError::NonFinitePosition(position.to_vec()));
        }
        if self.data.is_empty() {
            return Err(ImageError::Unsupported("interpolation of an empty image"));
        }
        let shape = self.data.shape();
        let mut lower = Vec::with_capacity(ndim);
        let mut fraction = Vec::with_capacity(ndim);
        for (axis, &p) in position.iter().enumerate() {
            let clamped = p.clamp(0.0, (shape[axis] - 1) as f64);
            let floor = clamped.floor();
            lower.push(floor as usize);
            fraction.push(clamped - floor);
        }
        // Visit the 2^N corners of the enclosing cell.
        let mut value = 0.0;
        let mut corner = vec![0_usize; ndim];
        for bits in 0..(1_usize << ndim) {
            let mut weight = 1.0;
            for axis in 0..ndim {
                let upper = (bits >> axis) & 1 == 1;
                weight *= if upper { fraction[axis] } else { 1.0 - fraction[axis] };
                corner[axis] = if upper {
                    usize::min(lower[axis] + 1, shape[axis] - 1)
                } else {
                    lower[axis]
                };
            }
            if weight != 0.0 {
                value += weight * self.data[corner.as_slice()];
            }
        }
        Ok(value)
    }
}

// Luma buffers are indexed as (x, y), so the raster is stored with x as axis 0.
impl<T> From<&ImageBuffer<Luma<T>, Vec<T>>> for ArrayImage
where T: Primitive + Into<f64> {
    fn from(buffer: &ImageBuffer<Luma<T>, Vec<T>>) -> ArrayImage {
        let (width, height) = buffer.dimensions();
        ArrayImage::from_fn(&[width as usize, height as usize], |position| {
            buffer.get_pixel(position[0] as u32, position[1] as u32).0[0].into()
        })
    }
}
