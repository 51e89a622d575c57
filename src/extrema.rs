// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::VecDeque;
use std::time::Instant;

use log::debug;
use ndarray::{ArrayD, Dimension, IxDyn};

use crate::image_funcs::{ArrayImage, Image};
use crate::pipeline::StageError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtremumKind {
    Maxima,
    Minima,
}

/// Locates regional extrema: plateaus of (nearly) equal samples whose
/// neighbors are all lower (for maxima) or all higher (for minima).
///
/// A plateau grows from a seed sample through the full 3^N-1 neighborhood,
/// taking in neighbors within `tolerance` of the seed value. It is an
/// extremum if no neighbor outside it is beyond the seed value by more than
/// `tolerance`, and if the seed value itself is beyond `tolerance` (a
/// maximum must be positive, a minimum negative). Each extremum is reported
/// as the centroid of its plateau, in the order the raster scan first
/// reaches it.
pub struct RegionalExtremaFinder {
    kind: ExtremumKind,
    allow_edge_extrema: bool,
    tolerance: f64,
}

impl RegionalExtremaFinder {
    pub fn new(kind: ExtremumKind, allow_edge_extrema: bool, tolerance: f64)
               -> RegionalExtremaFinder {
        RegionalExtremaFinder{kind, allow_edge_extrema, tolerance}
    }

    pub fn kind(&self) -> ExtremumKind {
        self.kind
    }

    pub fn allow_edge_extrema(&self) -> bool {
        self.allow_edge_extrema
    }

    pub fn check_input(&self, image: &ArrayImage) -> Result<(), StageError> {
        if image.num_dimensions() == 0 || image.is_empty() {
            return Err(StageError::InvalidInput("Image is empty".to_string()));
        }
        if !(self.tolerance >= 0.0) || !self.tolerance.is_finite() {
            return Err(StageError::InvalidInput(format!(
                "Tolerance must be finite and non-negative, got {}", self.tolerance)));
        }
        Ok(())
    }

    /// Returns the sub-pixel centroid of each regional extremum.
    pub fn find(&self, image: &ArrayImage) -> Result<Vec<Vec<f64>>, StageError> {
        let start = Instant::now();
        self.check_input(image)?;
        let sign = match self.kind {
            ExtremumKind::Maxima => 1.0,
            ExtremumKind::Minima => -1.0,
        };
        // Work on signed values so that minima are found as maxima.
        let values = image.data().mapv(|v| sign * v);
        let dimensions = image.dimensions();
        let offsets = neighbor_offsets(dimensions.len());

        let mut visited = ArrayD::from_elem(IxDyn(&dimensions), false);
        let mut centroids = Vec::<Vec<f64>>::new();
        let mut queue = VecDeque::<Vec<usize>>::new();
        let mut members = Vec::<Vec<usize>>::new();
        let mut plateaus = 0;
        for (seed, &seed_value) in values.indexed_iter() {
            let seed = seed.slice().to_vec();
            if visited[seed.as_slice()] {
                continue;
            }
            plateaus += 1;
            visited[seed.as_slice()] = true;
            queue.push_back(seed);
            members.clear();
            let mut is_extremum = seed_value > self.tolerance;
            while let Some(position) = queue.pop_front() {
                for offset in &offsets {
                    let Some(neighbor) = step(&position, offset, &dimensions) else {
                        continue;
                    };
                    let neighbor_value = values[neighbor.as_slice()];
                    if neighbor_value > seed_value + self.tolerance {
                        is_extremum = false;
                    } else if neighbor_value >= seed_value - self.tolerance
                        && !visited[neighbor.as_slice()] {
                        visited[neighbor.as_slice()] = true;
                        queue.push_back(neighbor);
                    }
                }
                members.push(position);
            }
            if !is_extremum {
                continue;
            }
            if !self.allow_edge_extrema && members.iter().any(|m| on_edge(m, &dimensions)) {
                continue;
            }
            let count = members.len() as f64;
            let centroid: Vec<f64> = (0..dimensions.len())
                .map(|axis| members.iter().map(|m| m[axis] as f64).sum::<f64>() / count)
                .collect();
            centroids.push(centroid);
        }
        debug!("Extrema finder ({:?}) found {} of {} plateaus in {:?}",
               self.kind, centroids.len(), plateaus, start.elapsed());
        Ok(centroids)
    }
}

// Every offset in {-1, 0, 1}^N except the origin.
fn neighbor_offsets(num_dimensions: usize) -> Vec<Vec<isize>> {
    let count = 3_usize.pow(num_dimensions as u32);
    (0..count)
        .map(|code| {
            let mut rest = code;
            (0..num_dimensions).map(|_| {
                let digit = (rest % 3) as isize - 1;
                rest /= 3;
                digit
            }).collect::<Vec<isize>>()
        })
        .filter(|offset| offset.iter().any(|&o| o != 0))
        .collect()
}

// Neighbor of `position`, or None if it falls outside the image.
fn step(position: &[usize], offset: &[isize], dimensions: &[usize]) -> Option<Vec<usize>> {
    position.iter().zip(offset).zip(dimensions)
        .map(|((&p, &o), &n)| {
            let moved = p as isize + o;
            if moved < 0 || moved >= n as isize { None } else { Some(moved as usize) }
        })
        .collect()
}

// Axes of extent 1 have no interior, so they do not count as borders.
fn on_edge(position: &[usize], dimensions: &[usize]) -> bool {
    position.iter().zip(dimensions)
        .any(|(&p, &n)| n > 1 && (p == 0 || p == n - 1))
}
