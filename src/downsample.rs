// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Instant;

use log::debug;
use ndarray::{ArrayD, Axis, Zip};

use crate::image_funcs::{mirror_index, ArrayImage, Image};
use crate::kernels::gaussian_kernel_1d;
use crate::pipeline::{Stage, StageError};

/// Resamples an image to a smaller target extent.
///
/// Before resampling, each axis is smoothed with a Gaussian whose width
/// accounts for both the blur already present in the source
/// (`source_sigma`, in source pixels) and the blur wanted in the result
/// (`target_sigma`, in target pixels):
/// `sqrt((scale * target_sigma)^2 - source_sigma^2)`. Axes that are not
/// shrunk are left alone. Output pixel `i` samples source position
/// `i * scale` by N-linear interpolation.
pub struct DownSample {
    target: Vec<usize>,
    source_sigma: f64,
    target_sigma: f64,
}

impl DownSample {
    pub fn new(target: Vec<usize>, source_sigma: f64, target_sigma: f64) -> DownSample {
        DownSample{target, source_sigma, target_sigma}
    }

    pub fn target(&self) -> &[usize] {
        &self.target
    }
}

impl Stage for DownSample {
    fn name(&self) -> &str {
        "Down-sampling"
    }

    fn check_input(&self, input: &ArrayImage) -> Result<(), StageError> {
        let dimensions = input.dimensions();
        if dimensions.len() != self.target.len() {
            return Err(StageError::InvalidInput(format!(
                "Target size {:?} does not match {}D image", self.target,
                dimensions.len())));
        }
        if self.target.iter().any(|&t| t == 0) {
            return Err(StageError::InvalidInput(format!(
                "Target size {:?} has zero extent (image is {:?})",
                self.target, dimensions)));
        }
        if self.target.iter().zip(&dimensions).any(|(&t, &n)| t > n) {
            return Err(StageError::InvalidInput(format!(
                "Target size {:?} exceeds image size {:?}; up-sampling is not supported",
                self.target, dimensions)));
        }
        if !(self.source_sigma >= 0.0) || !(self.target_sigma >= 0.0) {
            return Err(StageError::InvalidInput(format!(
                "Smoothing sigmas must be non-negative, got {} and {}",
                self.source_sigma, self.target_sigma)));
        }
        Ok(())
    }

    fn process(&self, input: &ArrayImage) -> Result<ArrayImage, StageError> {
        let start = Instant::now();
        let dimensions = input.dimensions();
        let scales: Vec<f64> = dimensions.iter().zip(&self.target)
            .map(|(&n, &t)| n as f64 / t as f64)
            .collect();

        let mut smoothed = input.data().clone();
        for (axis, &scale) in scales.iter().enumerate() {
            let variance = (scale * self.target_sigma).powi(2) - self.source_sigma.powi(2);
            if scale > 1.0 && variance > 0.0 {
                smoothed = convolve_axis(&smoothed, axis, &gaussian_kernel_1d(variance.sqrt()));
            }
        }
        let smoothed = ArrayImage::new(smoothed);

        let mut source_position = vec![0.0; dimensions.len()];
        let mut failure = None;
        let resampled = ArrayImage::from_fn(&self.target, |position| {
            for (axis, &p) in position.iter().enumerate() {
                source_position[axis] = p as f64 * scales[axis];
            }
            match smoothed.interpolate(&source_position) {
                Ok(value) => value,
                Err(e) => {
                    failure.get_or_insert(e);
                    0.0
                },
            }
        });
        if let Some(e) = failure {
            return Err(StageError::ProcessingFailed(e.to_string()));
        }
        debug!("Down-sampled {:?} to {:?} (scales {:?}) in {:?}",
               dimensions, self.target, scales, start.elapsed());
        Ok(resampled)
    }
}

/// Convolves every lane of `data` along `axis` with the odd-length `taps`,
/// mirroring at the borders.
pub fn convolve_axis(data: &ArrayD<f64>, axis: usize, taps: &[f64]) -> ArrayD<f64> {
    let half = (taps.len() / 2) as isize;
    let mut output = ArrayD::zeros(data.raw_dim());
    Zip::from(data.lanes(Axis(axis)))
        .and(output.lanes_mut(Axis(axis)))
        .for_each(|source, mut destination| {
            let n = source.len();
            for (i, out) in destination.iter_mut().enumerate() {
                let mut accum = 0.0;
                for (j, &tap) in taps.iter().enumerate() {
                    let index = mirror_index(i as isize + half - j as isize, n);
                    accum += source[index] * tap;
                }
                *out = accum;
            }
        });
    output
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use super::*;

    #[test]
    fn test_check_input() {
        let image = ArrayImage::zeros(&[8, 6]);
        let halved = DownSample::new(vec![4, 3], 0.5, 0.5);
        assert_eq!(halved.target(), &[4, 3]);
        assert!(halved.check_input(&image).is_ok());
        assert!(DownSample::new(vec![8, 6], 0.5, 0.5).check_input(&image).is_ok());
        assert!(matches!(DownSample::new(vec![4], 0.5, 0.5).check_input(&image),
                         Err(StageError::InvalidInput(_))));
        assert!(matches!(DownSample::new(vec![0, 3], 0.5, 0.5).check_input(&image),
                         Err(StageError::InvalidInput(_))));
        assert!(matches!(DownSample::new(vec![9, 3], 0.5, 0.5).check_input(&image),
                         Err(StageError::InvalidInput(_))));
        assert!(matches!(DownSample::new(vec![4, 3], -0.5, 0.5).check_input(&image),
                         Err(StageError::InvalidInput(_))));
    }

    #[test]
    fn test_identity_when_not_shrinking() {
        let image = ArrayImage::from_fn(&[5, 4], |p| (p[0] * 7 + p[1] * 3) as f64);
        let result = DownSample::new(vec![5, 4], 0.5, 0.5).process(&image).unwrap();
        assert_eq!(result, image);
    }

    #[test]
    fn test_constant_image_stays_constant() {
        let image = ArrayImage::from_elem(&[20, 12], 42.0);
        let result = DownSample::new(vec![10, 4], 0.5, 0.5).process(&image).unwrap();
        assert_eq!(result.dimensions(), vec![10, 4]);
        for &v in result.data().iter() {
            assert_abs_diff_eq!(v, 42.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_samples_at_scaled_positions() {
        // A linear ramp survives symmetric smoothing away from the borders,
        // so interior samples read the ramp at i * scale.
        let image = ArrayImage::from_fn(&[40], |p| p[0] as f64);
        let result = DownSample::new(vec![20], 0.5, 0.5).process(&image).unwrap();
        for i in 3..17 {
            assert_abs_diff_eq!(result.get(&[i]).unwrap(), 2.0 * i as f64,
                                epsilon = 1e-9);
        }
    }

    #[test]
    fn test_convolve_axis() {
        let data = ArrayImage::from_fn(&[5, 4], |p| if p == &[2, 0] { 4.0 } else { 0.0 })
            .into_data();
        let smoothed = ArrayImage::new(convolve_axis(&data, 0, &[0.25, 0.5, 0.25]));
        // Only axis 0 is smoothed.
        assert_eq!(smoothed.get(&[1, 0]), Some(1.0));
        assert_eq!(smoothed.get(&[2, 0]), Some(2.0));
        assert_eq!(smoothed.get(&[3, 0]), Some(1.0));
        assert_eq!(smoothed.get(&[2, 1]), Some(0.0));
        assert_abs_diff_eq!(smoothed.data().sum(), 4.0);

        // Mirroring reflects weight back in at the border.
        let edge = ArrayImage::from_fn(&[5], |p| if p[0] == 0 { 4.0 } else { 0.0 })
            .into_data();
        let smoothed = ArrayImage::new(convolve_axis(&edge, 0, &[0.25, 0.5, 0.25]));
        assert_eq!(smoothed.get(&[0]), Some(2.0));
        assert_eq!(smoothed.get(&[1]), Some(1.0));
    }
}
