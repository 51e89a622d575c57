// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Instant;

use log::debug;

use crate::image_funcs::{mirror_index, ArrayImage, Image};
use crate::kernels::StructuringElement;
use crate::pipeline::{Stage, StageError};

/// Replaces each pixel with the median of the neighborhood selected by a
/// structuring element. Neighbors beyond the image border are mirrored.
/// Used to remove salt-and-pepper noise that would otherwise show up as
/// spurious maxima.
pub struct MedianFilter<'a> {
    structuring_element: &'a StructuringElement,
}

impl<'a> MedianFilter<'a> {
    pub fn new(structuring_element: &'a StructuringElement) -> MedianFilter<'a> {
        MedianFilter{structuring_element}
    }
}

impl<'a> Stage for MedianFilter<'a> {
    fn name(&self) -> &str {
        "Median filter"
    }

    fn check_input(&self, input: &ArrayImage) -> Result<(), StageError> {
        if input.num_dimensions() != self.structuring_element.num_dimensions() {
            return Err(StageError::InvalidInput(format!(
                "Structuring element '{}' is {}D but the image is {}D",
                self.structuring_element.name(),
                self.structuring_element.num_dimensions(),
                input.num_dimensions())));
        }
        if input.is_empty() {
            return Err(StageError::InvalidInput("Image is empty".to_string()));
        }
        Ok(())
    }

    fn process(&self, input: &ArrayImage) -> Result<ArrayImage, StageError> {
        let start = Instant::now();
        let offsets = self.structuring_element.offsets();
        if offsets.is_empty() {
            return Err(StageError::ProcessingFailed(format!(
                "Structuring element '{}' selects no pixels",
                self.structuring_element.name())));
        }
        let dimensions = input.dimensions();
        let data = input.data();
        let mut neighborhood = Vec::<f64>::with_capacity(offsets.len());
        let mut neighbor = vec![0_usize; dimensions.len()];
        let filtered = ArrayImage::from_fn(&dimensions, |position| {
            neighborhood.clear();
            for offset in &offsets {
                for (axis, (&p, &o)) in position.iter().zip(offset).enumerate() {
                    neighbor[axis] = mirror_index(p as isize + o, dimensions[axis]);
                }
                neighborhood.push(data[neighbor.as_slice()]);
            }
            let middle = neighborhood.len() / 2;
            let (_, median, _) =
                neighborhood.select_nth_unstable_by(middle, |a, b| a.total_cmp(b));
            *median
        });
        debug!("Median filter ({}) applied to {:?} in {:?}",
               self.structuring_element.name(), dimensions, start.elapsed());
        Ok(filtered)
    }
}
