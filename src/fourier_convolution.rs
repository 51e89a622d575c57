// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Instant;

use log::debug;
use ndarray::{ArrayD, Axis, Dimension, IxDyn, Slice, Zip};
use rustfft::{num_complex::Complex, FftDirection, FftPlanner};

use crate::image_funcs::{mirror_index, ArrayImage, Image};
use crate::pipeline::{Stage, StageError};

/// Convolves an image with a kernel by multiplication in the frequency
/// domain.
///
/// The image is mirror-padded by half the kernel extent on each side so that
/// the circular convolution computed by the FFT never wraps real data around
/// the borders; the result is cropped back to the input extent. The kernel
/// is centered at `extent / 2` along each axis, which is why kernel extents
/// must be odd.
pub struct FourierConvolution<'a> {
    kernel: &'a ArrayImage,
    name: String,
}

impl<'a> FourierConvolution<'a> {
    pub fn new(kernel: &'a ArrayImage, name: impl Into<String>) -> FourierConvolution<'a> {
        FourierConvolution{kernel, name: name.into()}
    }
}

impl<'a> Stage for FourierConvolution<'a> {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_input(&self, input: &ArrayImage) -> Result<(), StageError> {
        let kernel_shape = self.kernel.dimensions();
        if kernel_shape.len() != input.num_dimensions() {
            return Err(StageError::InvalidInput(format!(
                "Kernel is {}D but the image is {}D",
                kernel_shape.len(), input.num_dimensions())));
        }
        if kernel_shape.iter().any(|&k| k % 2 == 0) {
            return Err(StageError::InvalidInput(format!(
                "Kernel extents {:?} must all be odd", kernel_shape)));
        }
        if input.is_empty() {
            return Err(StageError::InvalidInput("Image is empty".to_string()));
        }
        Ok(())
    }

    fn process(&self, input: &ArrayImage) -> Result<ArrayImage, StageError> {
        let start = Instant::now();
        let dimensions = input.dimensions();
        let halves: Vec<usize> =
            self.kernel.dimensions().iter().map(|&k| k / 2).collect();
        let padded_shape: Vec<usize> = dimensions.iter().zip(&halves)
            .map(|(&n, &h)| n + 2 * h)
            .collect();

        // Mirror-padded copy of the image.
        let source = input.data();
        let mut source_index = vec![0_usize; dimensions.len()];
        let mut signal = ArrayD::from_shape_fn(IxDyn(&padded_shape), |index: IxDyn| {
            for (axis, &i) in index.slice().iter().enumerate() {
                source_index[axis] =
                    mirror_index(i as isize - halves[axis] as isize, dimensions[axis]);
            }
            Complex::new(source[source_index.as_slice()], 0.0)
        });

        // Kernel laid out with its center at the origin, wrapping negative
        // offsets to the far end of each axis.
        let mut transfer = ArrayD::<Complex<f64>>::zeros(IxDyn(&padded_shape));
        let mut target = vec![0_usize; dimensions.len()];
        for (index, &weight) in self.kernel.data().indexed_iter() {
            for (axis, &j) in index.slice().iter().enumerate() {
                let length = padded_shape[axis];
                target[axis] = (j + length - halves[axis]) % length;
            }
            transfer[target.as_slice()] = Complex::new(weight, 0.0);
        }

        let mut planner = FftPlanner::<f64>::new();
        transform(&mut signal, &mut planner, FftDirection::Forward);
        transform(&mut transfer, &mut planner, FftDirection::Forward);
        Zip::from(&mut signal).and(&transfer).for_each(|s, &t| *s *= t);
        transform(&mut signal, &mut planner, FftDirection::Inverse);

        // rustfft does not normalize the inverse transform.
        let normalization = 1.0 / signal.len() as f64;
        let cropped = signal.slice_each_axis(|axis_description| {
            let axis = axis_description.axis.index();
            Slice::from(halves[axis]..halves[axis] + dimensions[axis])
        });
        let result = cropped.mapv(|c| c.re * normalization);
        debug!("{} of {:?} with {:?} kernel (padded {:?}) in {:?}",
               self.name, dimensions, self.kernel.dimensions(), padded_shape,
               start.elapsed());
        Ok(ArrayImage::new(result))
    }
}

// In-place N-dimensional FFT, one axis at a time.
fn transform(data: &mut ArrayD<Complex<f64>>, planner: &mut FftPlanner<f64>,
             direction: FftDirection) {
    for axis in 0..data.ndim() {
        let length = data.shape()[axis];
        if length <= 1 {
            continue;
        }
        let fft = planner.plan_fft(length, direction);
        let mut buffer = vec![Complex::new(0.0, 0.0); length];
        let mut scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];
        for mut lane in data.lanes_mut(Axis(axis)) {
            for (b, &v) in buffer.iter_mut().zip(lane.iter()) {
                *b = v;
            }
            fft.process_with_scratch(&mut buffer, &mut scratch);
            for (v, &b) in lane.iter_mut().zip(&buffer) {
                *v = b;
            }
        }
    }
}
