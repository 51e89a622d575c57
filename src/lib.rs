// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! SpotSegmenter locates small, roughly round bright objects ("spots", such
//! as fluorescent particles) in 2D images and 3D volumes, and reports their
//! centers in calibrated physical coordinates.
//!
//! Features:
//!
//! * Works on any [Image]: owned rasters ([ArrayImage]), `image` crate luma
//!   buffers (via conversion), and region-of-interest views ([RoiImage]).
//! * Adapts the working resolution to the expected object size, so large
//!   objects cost no more to find than small ones.
//! * Anisotropic calibration, e.g. volumes whose z spacing differs from
//!   their x/y spacing.
//! * Optional median filtering for salt-and-pepper noise.
//!
//! # Algorithm
//!
//! [SpotSegmenter::process()] runs a fixed sequence of pipeline stages:
//!
//! 1. Down-sampling, so that objects of the configured diameter span about
//!    [GOAL_DOWNSAMPLED_BLOB_DIAMETER] pixels.
//! 2. Optionally, a median filter.
//! 3. Convolution with a Gaussian matched to the object diameter.
//! 4. Convolution with a discrete Laplacian. Together with the Gaussian this
//!    approximates a Laplacian-of-Gaussian blob detector.
//!
//! Both convolutions are done in the frequency domain. Regional maxima of
//! the final response are the spots; their centroids are scaled back to
//! physical units of the source image.
//!
//! Each stage validates its input before running, and the first failure
//! stops the run. A failed run clears previously published results.
//!
//! # Caveats
//!
//! * Spots closer together than about one diameter merge into a single
//!   response peak.
//! * Objects touching the image border are dropped unless edge extrema are
//!   allowed.

pub mod downsample;
pub mod extrema;
pub mod fourier_convolution;
pub mod image_funcs;
pub mod kernels;
pub mod median_filter;
pub mod pipeline;
pub mod roi_image;
pub mod segmenter;

pub use image_funcs::{ArrayImage, Image, ImageError};
pub use pipeline::{PipelineError, Stage, StageError};
pub use roi_image::RoiImage;
pub use segmenter::{
    SegmenterConfig, SegmenterError, Spot, SpotSegmenter,
    DOWNSAMPLE_SIGMA, EXTREMA_TOLERANCE, GOAL_DOWNSAMPLED_BLOB_DIAMETER,
};
