//! Sliding-window linear detector over an FHOG pyramid.

use image::GrayImage;
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::codec::{self, ModelKind, Persist};
use crate::error::{Error, Result};
use crate::fhog::{
    build_pyramid, mirror_dim, FeatureMap, Pyramid, PyramidLevel, PyramidParams, FHOG_DIMS,
};
use crate::types::Rectangle;

/// Detection window size in FHOG cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionWindow {
    pub width_cells: usize,
    pub height_cells: usize,
}

impl DetectionWindow {
    /// Square window covering roughly `size` pixels per side.
    pub fn from_pixels(size: u32, cell_size: u32) -> Self {
        let cell = cell_size.max(1) as f64;
        let cells = ((size as f64 / cell).round() as usize).max(1);
        Self {
            width_cells: cells,
            height_cells: cells,
        }
    }

    pub fn cells(&self) -> (usize, usize) {
        (self.width_cells, self.height_cells)
    }

    /// Length of the weight vector: one weight per window feature plus a bias.
    pub fn num_weights(&self) -> usize {
        self.width_cells * self.height_cells * FHOG_DIMS + 1
    }

    /// Where weight `idx` lands when the window is mirrored left to right.
    /// The bias stays put.
    pub fn mirror_index(&self, idx: usize) -> usize {
        if idx + 1 >= self.num_weights() {
            return idx;
        }
        let cell = idx / FHOG_DIMS;
        let (cx, cy) = (cell % self.width_cells, cell / self.width_cells);
        let mirrored = cy * self.width_cells + (self.width_cells - 1 - cx);
        mirrored * FHOG_DIMS + mirror_dim(idx % FHOG_DIMS)
    }
}

/// Decides when two boxes describe the same object.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverlapTester {
    /// Boxes whose intersection-over-union exceeds this overlap.
    pub iou_thresh: f64,
    /// Boxes covering more than this fraction of the smaller one overlap.
    pub covered_thresh: f64,
}

impl Default for OverlapTester {
    fn default() -> Self {
        Self {
            iou_thresh: 0.5,
            covered_thresh: 1.0,
        }
    }
}

impl OverlapTester {
    pub fn overlaps(&self, a: &Rectangle, b: &Rectangle) -> bool {
        a.iou(b) > self.iou_thresh || a.covered_fraction(b) > self.covered_thresh
    }
}

/// A detected rectangle and its window score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub rect: Rectangle,
    pub score: f64,
}

/// A window position inside a pyramid, in scan order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WindowLocation {
    pub level: usize,
    pub x: usize,
    pub y: usize,
}

/// A scored window, before suppression.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate {
    pub location: WindowLocation,
    pub rect: Rectangle,
    pub score: f64,
}

/// Map a window at cell (`x`, `y`) of `level` back to original-image pixels.
pub(crate) fn window_rect(
    level: &PyramidLevel,
    window: &DetectionWindow,
    cell_size: u32,
    x: usize,
    y: usize,
) -> Rectangle {
    let cell = cell_size as f64;
    let left = x as f64 * cell * level.scale_x;
    let top = y as f64 * cell * level.scale_y;
    let right = (x + window.width_cells) as f64 * cell * level.scale_x;
    let bottom = (y + window.height_cells) as f64 * cell * level.scale_y;
    Rectangle::new(
        left.round() as i64,
        top.round() as i64,
        right.round() as i64 - 1,
        bottom.round() as i64 - 1,
    )
}

/// Dot product of `weights` with the window at cell (`x`, `y`), bias included.
pub(crate) fn window_score(
    map: &FeatureMap,
    window: &DetectionWindow,
    weights: &[f64],
    x: usize,
    y: usize,
) -> f64 {
    let row_len = window.width_cells * FHOG_DIMS;
    let mut score = weights[weights.len() - 1];
    for wy in 0..window.height_cells {
        let features = map.row_span(x, y + wy, window.width_cells);
        let w = &weights[wy * row_len..(wy + 1) * row_len];
        score += w
            .iter()
            .zip(features)
            .map(|(&w, &f)| w * f as f64)
            .sum::<f64>();
    }
    score
}

/// Add the feature vector of a window (bias included) into `psi`.
pub(crate) fn accumulate_window(
    map: &FeatureMap,
    window: &DetectionWindow,
    x: usize,
    y: usize,
    psi: &mut [f64],
) {
    let row_len = window.width_cells * FHOG_DIMS;
    for wy in 0..window.height_cells {
        let features = map.row_span(x, y + wy, window.width_cells);
        for (dst, &f) in psi[wy * row_len..(wy + 1) * row_len].iter_mut().zip(features) {
            *dst += f as f64;
        }
    }
    let bias = psi.len() - 1;
    psi[bias] += 1.0;
}

/// Every window in the pyramid whose score passes `keep`, in scan order:
/// level, then row, then column.
pub(crate) fn scan_pyramid<F>(
    pyramid: &Pyramid,
    window: &DetectionWindow,
    cell_size: u32,
    weights: &[f64],
    keep: F,
) -> Vec<Candidate>
where
    F: Fn(f64) -> bool + Sync,
{
    pyramid
        .levels
        .par_iter()
        .enumerate()
        .map(|(level_idx, level)| {
            let map = &level.features;
            let mut found = Vec::new();
            for y in 0..=(map.height() - window.height_cells) {
                for x in 0..=(map.width() - window.width_cells) {
                    let score = window_score(map, window, weights, x, y);
                    if keep(score) {
                        found.push(Candidate {
                            location: WindowLocation {
                                level: level_idx,
                                x,
                                y,
                            },
                            rect: window_rect(level, window, cell_size, x, y),
                            score,
                        });
                    }
                }
            }
            found
        })
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect()
}

/// Sort by descending score, keeping scan order among ties.
pub(crate) fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
}

/// Greedy non-maximum suppression over candidates already sorted by
/// [`sort_candidates`].
pub(crate) fn suppress(candidates: Vec<Candidate>, overlap: &OverlapTester) -> Vec<Candidate> {
    let mut accepted: Vec<Candidate> = Vec::new();
    for c in candidates {
        if accepted.iter().all(|a| !overlap.overlaps(&a.rect, &c.rect)) {
            accepted.push(c);
        }
    }
    accepted
}

/// A trained linear detector.
///
/// Immutable once built: training produces a fresh detector rather than
/// updating one in place, so a detector can be shared freely between threads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDetector {
    params: PyramidParams,
    window: DetectionWindow,
    overlap: OverlapTester,
    /// Window weights, row-major by cell, followed by the bias.
    weights: Vec<f64>,
    /// Minimum score for a window to count as a detection.
    threshold: f64,
}

impl ObjectDetector {
    pub fn new(
        params: PyramidParams,
        window: DetectionWindow,
        overlap: OverlapTester,
        weights: Vec<f64>,
    ) -> Result<Self> {
        let detector = Self {
            params,
            window,
            overlap,
            weights,
            threshold: 0.0,
        };
        detector.validate()?;
        Ok(detector)
    }

    /// Shift the decision threshold. Positive values trade recall for precision.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn params(&self) -> &PyramidParams {
        &self.params
    }

    pub fn window(&self) -> &DetectionWindow {
        &self.window
    }

    pub fn overlap(&self) -> &OverlapTester {
        &self.overlap
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn validate(&self) -> Result<()> {
        if self.window.width_cells == 0 || self.window.height_cells == 0 {
            return Err(Error::InvalidModel("detection window is empty".into()));
        }
        if self.params.cell_size == 0 || self.params.downsample < 2 {
            return Err(Error::InvalidModel(format!(
                "invalid pyramid parameters {:?}",
                self.params
            )));
        }
        if self.weights.len() != self.window.num_weights() {
            return Err(Error::InvalidModel(format!(
                "expected {} weights for a {}x{} window, found {}",
                self.window.num_weights(),
                self.window.width_cells,
                self.window.height_cells,
                self.weights.len()
            )));
        }
        if self.weights.iter().any(|w| !w.is_finite()) || !self.threshold.is_finite() {
            return Err(Error::InvalidModel("non-finite weight".into()));
        }
        Ok(())
    }

    pub fn pyramid(&self, image: &GrayImage) -> Pyramid {
        build_pyramid(image, &self.params, self.window.cells())
    }

    /// Detect objects, returning rectangles ordered by descending score.
    pub fn detect(&self, image: &GrayImage) -> Vec<Rectangle> {
        self.detect_scored(image)
            .into_iter()
            .map(|d| d.rect)
            .collect()
    }

    /// Detect objects, keeping each window score.
    ///
    /// Ties in score keep scan order. No two returned rectangles overlap
    /// according to the detector's [`OverlapTester`].
    pub fn detect_scored(&self, image: &GrayImage) -> Vec<Detection> {
        let pyramid = self.pyramid(image);
        if pyramid.is_empty() {
            debug!(
                "{}x{} image is smaller than the detection window",
                image.width(),
                image.height()
            );
            return Vec::new();
        }

        let threshold = self.threshold;
        let mut candidates = scan_pyramid(
            &pyramid,
            &self.window,
            self.params.cell_size,
            &self.weights,
            |score| score > threshold,
        );
        sort_candidates(&mut candidates);

        suppress(candidates, &self.overlap)
            .into_iter()
            .map(|c| Detection {
                rect: c.rect,
                score: c.score,
            })
            .collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        codec::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        codec::deserialize(bytes)
    }
}

impl Persist for ObjectDetector {
    const KIND: ModelKind = ModelKind::ObjectDetector;

    fn check(&self) -> Result<()> {
        self.validate()
    }
}
