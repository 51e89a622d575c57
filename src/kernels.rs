// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::cmp;

use log::debug;
use ndarray::{ArrayD, Dimension, IxDyn};

use crate::image_funcs::ArrayImage;

/// Discrete Laplacian with a positive center: 1 at the center, and the
/// neighbor weights sum to -1. In 2D all 8 neighbors weigh -1/8; in 3D the 18
/// face and edge neighbors weigh -1/18 and the 8 corners are 0.
///
/// Filtering a blob with this kernel yields a positive response at its
/// center. Only 2D and 3D kernels are defined; other dimensionalities get a
/// 1-voxel identity kernel.
pub fn laplacian_kernel(num_dimensions: usize) -> ArrayImage {
    let neighbor_weight = match num_dimensions {
        2 => -1.0 / 8.0,
        3 => -1.0 / 18.0,
        _ => return identity_kernel(num_dimensions),
    };
    let mut kernel = ArrayImage::zeros(&vec![3; num_dimensions]);
    for (index, weight) in kernel.data_mut().indexed_iter_mut() {
        let off_center = index.slice().iter().filter(|&&i| i != 1).count();
        *weight = match off_center {
            0 => 1.0,
            // 3D corners do not participate.
            3 => 0.0,
            _ => neighbor_weight,
        };
    }
    kernel
}

/// Normalized 1D Gaussian sampled over `max(3, 2*round(3*sigma)+1)` taps.
/// A non-positive or non-finite sigma yields the single tap [1.0].
pub fn gaussian_kernel_1d(sigma: f64) -> Vec<f64> {
    if !(sigma > 0.0) || !sigma.is_finite() {
        return vec![1.0];
    }
    let size = cmp::max(3, 2 * (3.0 * sigma).round() as usize + 1);
    let center = (size / 2) as f64;
    let two_sigma_sq = 2.0 * sigma * sigma;
    let mut taps: Vec<f64> = (0..size)
        .map(|i| (-(i as f64 - center).powi(2) / two_sigma_sq).exp())
        .collect();
    let sum: f64 = taps.iter().sum();
    for tap in taps.iter_mut() {
        *tap /= sum;
    }
    taps
}

/// N-dimensional Gaussian kernel: the outer product of one 1D Gaussian per
/// axis. `sigmas` are in pixels and give the dimensionality.
pub fn gaussian_kernel(sigmas: &[f64]) -> ArrayImage {
    let per_axis: Vec<Vec<f64>> =
        sigmas.iter().map(|&s| gaussian_kernel_1d(s)).collect();
    let shape: Vec<usize> = per_axis.iter().map(|taps| taps.len()).collect();
    ArrayImage::from_fn(&shape, |position| {
        position.iter().enumerate()
            .map(|(axis, &i)| per_axis[axis][i])
            .product()
    })
}

fn identity_kernel(num_dimensions: usize) -> ArrayImage {
    ArrayImage::from_elem(&vec![1; num_dimensions], 1.0)
}

/// Binary neighborhood mask used by the median filter. The element is
/// centered at `shape[d] / 2` along each axis.
#[derive(Clone, Debug, PartialEq)]
pub struct StructuringElement {
    mask: ArrayD<bool>,
    name: String,
}

impl StructuringElement {
    /// Solid hypercube with edge length `size`.
    pub fn cube(num_dimensions: usize, size: usize) -> StructuringElement {
        StructuringElement::solid(&vec![size; num_dimensions],
                                  format!("{}D Cube", num_dimensions))
    }

    /// Every element of the given shape is on.
    pub fn solid(shape: &[usize], name: impl Into<String>) -> StructuringElement {
        StructuringElement{mask: ArrayD::from_elem(IxDyn(shape), true),
                           name: name.into()}
    }

    /// The element the segmenter uses for its median filter: a 3x3 square in
    /// 2D, and a flat 3x3x1 slab in 3D.
    pub fn for_dimensionality(num_dimensions: usize) -> StructuringElement {
        if num_dimensions == 3 {
            StructuringElement::solid(&[3, 3, 1], "3D Square")
        } else {
            StructuringElement::cube(num_dimensions, 3)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        self.mask.shape()
    }

    pub fn num_dimensions(&self) -> usize {
        self.mask.ndim()
    }

    /// Offsets of the "on" elements relative to the element's center.
    pub fn offsets(&self) -> Vec<Vec<isize>> {
        let shape = self.mask.shape();
        self.mask.indexed_iter()
            .filter(|&(_, &on)| on)
            .map(|(index, _on)| {
                index.slice().iter().zip(shape)
                    .map(|(&i, &n)| i as isize - (n / 2) as isize)
                    .collect()
            })
            .collect()
    }
}

/// Per-axis Gaussian width, in pixels of the down-sampled grid, that matches
/// an object of `diameter` physical units. Down-sampling shrinks objects to
/// at most `goal_diameter` pixels, so the pixel sigma is
/// `min(diameter / calibration, goal) / sqrt(N)`. Without a usable
/// calibration the goal diameter stands in.
pub fn gaussian_pixel_sigmas(num_dimensions: usize, diameter: f32,
                             calibration: Option<&[f32]>,
                             goal_diameter: f32) -> Vec<f64> {
    let root_n = (num_dimensions as f64).sqrt();
    let usable = calibration.filter(|c| {
        c.len() == num_dimensions && c.iter().all(|&v| v > 0.0 && v.is_finite())
    });
    (0..num_dimensions).map(|axis| {
        let pixel_diameter = match usable {
            Some(c) => f32::min(diameter / c[axis], goal_diameter),
            None => goal_diameter,
        };
        pixel_diameter as f64 / root_n
    }).collect()
}

/// Kernels derived from the segmenter's configuration. They depend on the
/// image only through its dimensionality: swapping in another image of the
/// same dimensionality keeps the cache, a dimensionality change rebuilds it.
#[derive(Clone, Debug)]
pub struct KernelCache {
    num_dimensions: usize,
    sigma: f32,
    laplacian: ArrayImage,
    gaussian: ArrayImage,
    structuring_element: StructuringElement,
}

impl KernelCache {
    pub fn build(num_dimensions: usize, diameter: f32,
                 calibration: Option<&[f32]>, goal_diameter: f32) -> KernelCache {
        // Optimal sigma for a LoG blob detector of the given diameter.
        let sigma = diameter / (num_dimensions as f32).sqrt();
        let pixel_sigmas = gaussian_pixel_sigmas(
            num_dimensions, diameter, calibration, goal_diameter);
        let gaussian = gaussian_kernel(&pixel_sigmas);
        debug!("Built {}D kernels: sigma {}; pixel sigmas {:?}; Gaussian kernel {:?}",
               num_dimensions, sigma, pixel_sigmas, gaussian.data().shape());
        KernelCache{num_dimensions, sigma,
                    laplacian: laplacian_kernel(num_dimensions),
                    gaussian,
                    structuring_element:
                    StructuringElement::for_dimensionality(num_dimensions)}
    }

    /// True if the cached kernels can serve an image of this dimensionality.
    pub fn serves(&self, num_dimensions: usize) -> bool {
        self.num_dimensions == num_dimensions
    }

    pub fn num_dimensions(&self) -> usize {
        self.num_dimensions
    }

    /// `diameter / sqrt(N)`, in physical units.
    pub fn sigma(&self) -> f32 {
        self.sigma
    }

    pub fn laplacian(&self) -> &ArrayImage {
        &self.laplacian
    }

    pub fn gaussian(&self) -> &ArrayImage {
        &self.gaussian
    }

    pub fn structuring_element(&self) -> &StructuringElement {
        &self.structuring_element
    }
}
