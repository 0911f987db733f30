//! Dense FHOG features over a multi-scale image pyramid.
//!
//! Each cell of `cell_size` x `cell_size` pixels is described by the 31-value
//! variant of histogram-of-oriented-gradients from Felzenszwalb et al.,
//! "Object Detection with Discriminatively Trained Part Based Models":
//!
//! - 18 contrast-sensitive orientation bins over 0..360 degrees
//! - 9 contrast-insensitive bins over 0..180 degrees
//! - 4 texture features, one per normalization block
//!
//! Histograms are normalized against the four 2x2 cell blocks containing the
//! cell and clipped at 0.2 before being combined.

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::gray::{downsampled_size, resize, ImageAccess};

/// Number of values describing one cell.
pub const FHOG_DIMS: usize = 31;

const SENSITIVE_BINS: usize = 18;
const INSENSITIVE_BINS: usize = 9;
const TRUNCATION: f32 = 0.2;
const NORM_EPS: f32 = 0.0001;
// 1 / sqrt(18)
const TEXTURE_SCALE: f32 = 0.235_702_26;

// Unit vectors for the 9 orientations covering 0..180 degrees in 20 degree steps.
const UU: [f32; 9] = [
    1.0000, 0.9397, 0.7660, 0.5000, 0.1736, -0.1736, -0.5000, -0.7660, -0.9397,
];
const VV: [f32; 9] = [
    0.0000, 0.3420, 0.6428, 0.8660, 0.9848, 0.9848, 0.8660, 0.6428, 0.3420,
];

/// The dimension a cell feature moves to when the image is mirrored left to
/// right. Orientation bins reflect about the vertical axis and the texture
/// features of the left and right normalization blocks swap.
pub fn mirror_dim(dim: usize) -> usize {
    let texture = SENSITIVE_BINS + INSENSITIVE_BINS;
    if dim < SENSITIVE_BINS {
        (3 * INSENSITIVE_BINS - dim) % SENSITIVE_BINS
    } else if dim < texture {
        SENSITIVE_BINS + (3 * INSENSITIVE_BINS - dim) % INSENSITIVE_BINS
    } else {
        texture + (dim - texture + 2) % 4
    }
}

/// Pyramid geometry shared by training and detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PyramidParams {
    /// Side of one FHOG cell in pixels.
    pub cell_size: u32,
    /// Each level is `(downsample - 1) / downsample` the size of the previous one.
    pub downsample: u32,
}

impl Default for PyramidParams {
    fn default() -> Self {
        Self {
            cell_size: 8,
            downsample: 6,
        }
    }
}

/// A grid of FHOG descriptors, row-major, `FHOG_DIMS` values per cell.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMap {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl FeatureMap {
    fn zeros(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height * FHOG_DIMS],
        }
    }

    /// Width in cells.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height in cells.
    pub fn height(&self) -> usize {
        self.height
    }

    pub fn cell(&self, x: usize, y: usize) -> &[f32] {
        let start = (y * self.width + x) * FHOG_DIMS;
        &self.data[start..start + FHOG_DIMS]
    }

    /// `len` consecutive cells of row `y` starting at column `x`.
    pub fn row_span(&self, x: usize, y: usize, len: usize) -> &[f32] {
        let start = (y * self.width + x) * FHOG_DIMS;
        &self.data[start..start + len * FHOG_DIMS]
    }

    fn cell_mut(&mut self, x: usize, y: usize) -> &mut [f32] {
        let start = (y * self.width + x) * FHOG_DIMS;
        &mut self.data[start..start + FHOG_DIMS]
    }
}

/// One scale of the pyramid.
#[derive(Debug, Clone)]
pub struct PyramidLevel {
    pub features: FeatureMap,
    /// Original-image pixels per level pixel, horizontally and vertically.
    pub scale_x: f64,
    pub scale_y: f64,
}

/// Feature maps at decreasing scale, largest first.
#[derive(Debug, Clone, Default)]
pub struct Pyramid {
    pub levels: Vec<PyramidLevel>,
}

impl Pyramid {
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }
}

/// Compute the FHOG descriptor of every whole cell in `image`.
///
/// Partial cells on the right and bottom edges are dropped.
pub fn extract_fhog(image: &GrayImage, cell_size: u32) -> FeatureMap {
    let cell = cell_size.max(1) as usize;
    let (w, h) = (image.width() as usize, image.height() as usize);
    let (cells_w, cells_h) = (w / cell, h / cell);
    if cells_w == 0 || cells_h == 0 {
        return FeatureMap::zeros(0, 0);
    }

    let hist = orientation_histograms(image, cell, cells_w, cells_h);

    let norms: Vec<f32> = hist
        .chunks_exact(SENSITIVE_BINS)
        .map(|h| {
            (0..INSENSITIVE_BINS)
                .map(|o| {
                    let v = h[o] + h[o + INSENSITIVE_BINS];
                    v * v
                })
                .sum()
        })
        .collect();

    let norm_at = |x: isize, y: isize| -> f32 {
        let cx = x.clamp(0, cells_w as isize - 1) as usize;
        let cy = y.clamp(0, cells_h as isize - 1) as usize;
        norms[cy * cells_w + cx]
    };

    let mut map = FeatureMap::zeros(cells_w, cells_h);
    for y in 0..cells_h {
        for x in 0..cells_w {
            let (xi, yi) = (x as isize, y as isize);
            let block = |dx: isize, dy: isize| -> f32 {
                let n = norm_at(xi + dx, yi + dy)
                    + norm_at(xi + dx + 1, yi + dy)
                    + norm_at(xi + dx, yi + dy + 1)
                    + norm_at(xi + dx + 1, yi + dy + 1);
                1.0 / (n + NORM_EPS).sqrt()
            };
            let n = [block(0, 0), block(0, -1), block(-1, 0), block(-1, -1)];

            let src = &hist[(y * cells_w + x) * SENSITIVE_BINS..][..SENSITIVE_BINS];
            let dst = map.cell_mut(x, y);
            let mut texture = [0.0f32; 4];

            for o in 0..SENSITIVE_BINS {
                let mut sum = 0.0;
                for (k, nk) in n.iter().enumerate() {
                    let v = (src[o] * nk).min(TRUNCATION);
                    sum += v;
                    texture[k] += v;
                }
                dst[o] = 0.5 * sum;
            }

            for o in 0..INSENSITIVE_BINS {
                let h = src[o] + src[o + INSENSITIVE_BINS];
                let sum: f32 = n.iter().map(|nk| (h * nk).min(TRUNCATION)).sum();
                dst[SENSITIVE_BINS + o] = 0.5 * sum;
            }

            for (k, t) in texture.iter().enumerate() {
                dst[SENSITIVE_BINS + INSENSITIVE_BINS + k] = TEXTURE_SCALE * t;
            }
        }
    }

    map
}

/// Gradient magnitudes voted into 18 orientation bins per cell, with
/// bilinear weighting between the four nearest cell centres.
fn orientation_histograms(image: &GrayImage, cell: usize, cells_w: usize, cells_h: usize) -> Vec<f32> {
    let mut hist = vec![0.0f32; cells_w * cells_h * SENSITIVE_BINS];
    let (w, h) = (image.width() as i32, image.height() as i32);
    let px = |x: i32, y: i32| ImageAccess::get_pixel(image, x, y) as f32;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let dx = px(x + 1, y) - px(x - 1, y);
            let dy = px(x, y + 1) - px(x, y - 1);
            let magnitude = (dx * dx + dy * dy).sqrt();
            if magnitude == 0.0 {
                continue;
            }

            // An exactly vertical gradient lies on the boundary between two
            // bins and votes half into each.
            let (bin, share) = if dx == 0.0 {
                let up = if dy > 0.0 { 0 } else { INSENSITIVE_BINS };
                (INSENSITIVE_BINS / 2 + up, 0.5)
            } else {
                (orientation_bin(dx, dy), 1.0)
            };

            let xp = (x as f32 + 0.5) / cell as f32 - 0.5;
            let yp = (y as f32 + 0.5) / cell as f32 - 0.5;
            let ixp = xp.floor();
            let iyp = yp.floor();
            let vx0 = xp - ixp;
            let vy0 = yp - iyp;

            for (cx, wx) in [(ixp as isize, 1.0 - vx0), (ixp as isize + 1, vx0)] {
                for (cy, wy) in [(iyp as isize, 1.0 - vy0), (iyp as isize + 1, vy0)] {
                    if cx < 0 || cy < 0 || cx >= cells_w as isize || cy >= cells_h as isize {
                        continue;
                    }
                    let idx = (cy as usize * cells_w + cx as usize) * SENSITIVE_BINS + bin;
                    let vote = wx * wy * magnitude * share;
                    hist[idx] += vote;
                    if share < 1.0 {
                        hist[idx + 1] += vote;
                    }
                }
            }
        }
    }

    hist
}

/// The contrast-sensitive bin whose direction best matches `(dx, dy)`.
fn orientation_bin(dx: f32, dy: f32) -> usize {
    let mut best_dot = 0.0f32;
    let mut best_o = 0usize;
    for o in 0..INSENSITIVE_BINS {
        let dot = UU[o] * dx + VV[o] * dy;
        if dot > best_dot {
            best_dot = dot;
            best_o = o;
        } else if -dot > best_dot {
            best_dot = -dot;
            best_o = o + INSENSITIVE_BINS;
        }
    }
    best_o
}

/// Build the feature pyramid for `image`.
///
/// Level sizes follow the `(n - 1) / n` chain from the full image and each
/// level is resampled to the nearest whole number of cells, so the cell grid
/// covers the level edge to edge and a mirrored image gets the mirrored grid.
/// Levels stop once the chain drops below the window; an image smaller than
/// the window at full resolution yields an empty pyramid.
pub fn build_pyramid(
    image: &GrayImage,
    params: &PyramidParams,
    window_cells: (usize, usize),
) -> Pyramid {
    let (orig_w, orig_h) = image.dimensions();
    let cell = params.cell_size.max(1);
    let min_w = window_cells.0 as u64 * cell as u64;
    let min_h = window_cells.1 as u64 * cell as u64;

    let mut levels = Vec::new();
    let mut size = Some((orig_w, orig_h));
    while let Some((w, h)) = size {
        if (w as u64) < min_w || (h as u64) < min_h {
            break;
        }

        let (level_w, level_h) = (snap_to_cells(w, cell), snap_to_cells(h, cell));
        let level = resize(image, level_w, level_h);
        levels.push(PyramidLevel {
            features: extract_fhog(&level, cell),
            scale_x: orig_w as f64 / level_w as f64,
            scale_y: orig_h as f64 / level_h as f64,
        });

        size = downsampled_size(w, h, params.downsample.max(2));
    }

    Pyramid { levels }
}

/// `len` rounded to the nearest whole number of cells, at least one.
fn snap_to_cells(len: u32, cell: u32) -> u32 {
    ((len + cell / 2) / cell).max(1) * cell
}
