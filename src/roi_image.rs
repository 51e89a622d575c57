// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use crate::image_funcs::{Image, ImageError};

/// A region of interest within a larger image. Positions are relative to the
/// region's origin, so a cursor over a RoiImage walks only the region.
///
/// The region borrows its source; nothing is copied until a caller
/// materializes it (e.g. [crate::ArrayImage::from_image()]).
pub struct RoiImage<'a, I: Image> {
    source: &'a I,
    offset: Vec<usize>,
    size: Vec<usize>,
}

impl<'a, I: Image> RoiImage<'a, I> {
    /// `offset` and `size` may be shorter than the source's dimensionality;
    /// missing offsets are 0 and missing sizes are 1.
    pub fn new(source: &'a I, offset: &[usize], size: &[usize])
               -> Result<RoiImage<'a, I>, ImageError> {
        let dimensions = source.dimensions();
        let ndim = dimensions.len();
        if offset.len() > ndim || size.len() > ndim {
            return Err(ImageError::DimensionMismatch{
                expected: ndim, actual: usize::max(offset.len(), size.len())});
        }
        let offset: Vec<usize> =
            (0..ndim).map(|d| offset.get(d).copied().unwrap_or(0)).collect();
        let size: Vec<usize> =
            (0..ndim).map(|d| size.get(d).copied().unwrap_or(1)).collect();
        let fits = (0..ndim).all(|d| offset[d] + size[d] <= dimensions[d]);
        if !fits {
            return Err(ImageError::RegionOutOfBounds{offset, size, dimensions});
        }
        Ok(RoiImage{source, offset, size})
    }

    pub fn offset(&self) -> &[usize] {
        &self.offset
    }

    /// Number of pixels in the region.
    pub fn num_pixels(&self) -> usize {
        self.size.iter().product()
    }
}

impl<'a, I: Image> Image for RoiImage<'a, I> {
    fn dimensions(&self) -> Vec<usize> {
        self.size.clone()
    }

    fn get(&self, position: &[usize]) -> Option<f64> {
        if position.len() != self.size.len() {
            return None;
        }
        let mut source_position = Vec::with_capacity(position.len());
        for (d, &p) in position.iter().enumerate() {
            if p >= self.size[d] {
                return None;
            }
            source_position.push(p + self.offset[d]);
        }
        self.source.get(&source_position)
    }

    fn calibration(&self) -> Option<Vec<f32>> {
        self.source.calibration()
    }
}

#[cfg(test)]
mod tests {
    use crate::image_funcs::ArrayImage;
    use super::*;

    fn ramp() -> ArrayImage {
        ArrayImage::from_fn(&[4, 5], |p| (p[0] * 10 + p[1]) as f64)
            .with_calibration(vec![0.2, 0.3])
    }

    #[test]
    fn test_roi_remaps_positions() {
        let source = ramp();
        let roi = RoiImage::new(&source, &[1, 2], &[2, 3]).unwrap();
        assert_eq!(roi.dimensions(), vec![2, 3]);
        assert_eq!(roi.num_pixels(), 6);
        assert_eq!(roi.get(&[0, 0]), Some(12.0));
        assert_eq!(roi.get(&[1, 2]), Some(24.0));
        // Inside the source but outside the region.
        assert_eq!(roi.get(&[2, 0]), None);
        assert_eq!(roi.calibration(), Some(vec![0.2, 0.3]));
    }

    #[test]
    fn test_roi_cursor_walks_region_only() {
        let source = ramp();
        let roi = RoiImage::new(&source, &[2, 3], &[2, 2]).unwrap();
        let values: Vec<f64> = roi.cursor().map(|(_p, v)| v).collect();
        assert_eq!(values, vec![23.0, 24.0, 33.0, 34.0]);
    }

    #[test]
    fn test_roi_pads_short_offset_and_size() {
        let source = ramp();
        let roi = RoiImage::new(&source, &[3], &[1]).unwrap();
        assert_eq!(roi.offset(), &[3, 0]);
        assert_eq!(roi.dimensions(), vec![1, 1]);
        assert_eq!(roi.get(&[0, 0]), Some(30.0));
    }

    #[test]
    fn test_roi_out_of_bounds() {
        let source = ramp();
        assert!(matches!(RoiImage::new(&source, &[3, 0], &[2, 5]),
                         Err(ImageError::RegionOutOfBounds{..})));
        assert!(matches!(RoiImage::new(&source, &[0, 0, 0], &[1]),
                         Err(ImageError::DimensionMismatch{..})));
    }

    #[test]
    fn test_roi_interpolation_unsupported() {
        let source = ramp();
        let roi = RoiImage::new(&source, &[0, 0], &[2, 2]).unwrap();
        assert_eq!(roi.interpolate(&[0.5, 0.5]),
                   Err(ImageError::Unsupported("interpolation")));
        // Materializing the view yields an image that does interpolate.
        let owned = ArrayImage::from_image(&roi);
        assert_eq!(owned.interpolate(&[0.5, 0.5]), Ok(5.5));
    }
}
