//! Loader for dlib's shape_predictor .dat format.
//!
//! The bundled landmark asset ships in dlib's binary encoding. This module
//! parses it directly, supporting both raw `.dat` files and bzip2-compressed
//! `.dat.bz2` files.
//!
//! # Example
//!
//! ```ignore
//! use hog_landmark::dlib::load_dlib_model;
//!
//! // Load compressed model directly
//! let model = load_dlib_model("shape_predictor_68_face_landmarks.dat.bz2")?;
//!
//! // Or uncompressed
//! let model = load_dlib_model("shape_predictor_68_face_landmarks.dat")?;
//! ```
//!
//! # Obtaining Models
//!
//! Pre-trained models are available from the dlib-models repository:
//!
//! ```bash
//! git clone --depth 1 git@github.com:davisking/dlib-models.git
//! ```
//!
//! Common models:
//! - `shape_predictor_5_face_landmarks.dat.bz2` - 5-point model (eyes + nose)
//! - `shape_predictor_68_face_landmarks.dat.bz2` - Full 68-point model

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use bzip2::read::BzDecoder;

use crate::error::{Error, Result};
use crate::model::ShapePredictor;
use crate::tree::{RegressionTree, SplitFeature, TreeEnsemble, TreeNode};
use crate::types::{Point, Shape};

/// Upper bound on any sequence length, so corrupt input fails instead of
/// allocating.
const MAX_ELEMENTS: usize = 1 << 26;

/// Cursor over dlib's serialization format.
///
/// Integers are a control byte (bit 7 is the sign, the low nibble the byte
/// count) followed by that many little-endian magnitude bytes. Reals are an
/// integer mantissa and a power-of-two exponent. Column vectors carry their
/// dimensions negated.
struct Decoder<R> {
    inner: R,
}

impl<R: Read> Decoder<R> {
    fn new(inner: R) -> Self {
        Self { inner }
    }

    fn int(&mut self) -> Result<i64> {
        let mut control = [0u8; 1];
        self.inner.read_exact(&mut control)?;
        let len = (control[0] & 0x0F) as usize;
        if len > 8 {
            return Err(Error::InvalidModel(format!("{}-byte integer", len)));
        }

        let mut bytes = [0u8; 8];
        self.inner.read_exact(&mut bytes[..len])?;
        let magnitude = u64::from_le_bytes(bytes) as i64;
        Ok(if control[0] & 0x80 != 0 {
            magnitude.wrapping_neg()
        } else {
            magnitude
        })
    }

    fn len(&mut self) -> Result<usize> {
        let n = self.int()?;
        if n < 0 || n as u64 > MAX_ELEMENTS as u64 {
            return Err(Error::InvalidModel(format!("implausible length {}", n)));
        }
        Ok(n as usize)
    }

    fn index(&mut self) -> Result<u16> {
        let n = self.int()?;
        u16::try_from(n).map_err(|_| Error::InvalidModel(format!("index {} out of range", n)))
    }

    fn real(&mut self) -> Result<f32> {
        let mantissa = self.int()?;
        let exponent = self.int()?;
        Ok((mantissa as f64 * 2f64.powi(exponent as i32)) as f32)
    }

    fn point(&mut self) -> Result<Point> {
        let x = self.real()?;
        let y = self.real()?;
        Ok(Point::new(x, y))
    }

    /// A column of interleaved x/y coordinates, optionally of a known size.
    fn points(&mut self, expected: Option<usize>) -> Result<Vec<Point>> {
        let rows = self.int()?.wrapping_neg();
        let cols = self.int()?.wrapping_neg();
        let valid = cols == 1 && rows >= 0 && rows % 2 == 0 && (rows as u64) < MAX_ELEMENTS as u64;
        if !valid || expected.is_some_and(|n| rows as usize != n * 2) {
            return Err(Error::InvalidModel(format!(
                "unexpected {}x{} point matrix",
                rows, cols
            )));
        }
        (0..rows / 2).map(|_| self.point()).collect()
    }

    fn seq<T>(&mut self, mut item: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        let n = self.len()?;
        let mut out = Vec::with_capacity(n.min(4096));
        for _ in 0..n {
            out.push(item(self)?);
        }
        Ok(out)
    }
}

/// A split as stored: indices into the stage's feature pool.
struct StoredSplit {
    feature1: u16,
    feature2: u16,
    threshold: f32,
}

/// A tree as stored: splits in breadth-first order, then the leaves.
struct StoredTree {
    splits: Vec<StoredSplit>,
    leaves: Vec<Shape>,
}

/// Load a dlib shape_predictor from a .dat or .dat.bz2 file.
pub fn load_dlib_model<P: AsRef<Path>>(path: P) -> Result<ShapePredictor> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);

    if path.extension().is_some_and(|ext| ext == "bz2") {
        load_dlib_model_from_reader(BzDecoder::new(reader))
    } else {
        load_dlib_model_from_reader(reader)
    }
}

/// Load an uncompressed dlib model from an already-opened reader.
pub fn load_dlib_model_from_reader<R: Read>(reader: R) -> Result<ShapePredictor> {
    read_predictor(&mut Decoder::new(reader))
}

fn read_predictor<R: Read>(d: &mut Decoder<R>) -> Result<ShapePredictor> {
    let version = d.int()?;
    if version != 1 {
        return Err(Error::InvalidModel(format!(
            "unsupported shape_predictor version {}",
            version
        )));
    }

    let mean_shape = d.points(None)?;
    let num_landmarks = mean_shape.len();

    // forests[stage][tree], anchors[stage][feature], offsets[stage][feature]
    let forests = d.seq(|d| d.seq(|d| read_tree(d, num_landmarks)))?;
    let anchors = d.seq(|d| d.seq(Decoder::index))?;
    let offsets = d.seq(|d| d.seq(Decoder::point))?;
    if anchors.len() < forests.len() || offsets.len() < forests.len() {
        return Err(Error::InvalidModel(format!(
            "{} cascade stages but feature pools for {} and {}",
            forests.len(),
            anchors.len(),
            offsets.len()
        )));
    }

    let cascade = forests
        .into_iter()
        .zip(anchors.iter().zip(&offsets))
        .map(|(trees, (stage_anchors, stage_offsets))| {
            let trees = trees
                .into_iter()
                .map(|tree| resolve_tree(tree, stage_anchors, stage_offsets))
                .collect::<Result<Vec<_>>>()?;
            Ok(TreeEnsemble::new(trees, num_landmarks))
        })
        .collect::<Result<Vec<_>>>()?;

    let model = ShapePredictor::new(Shape::new(mean_shape), cascade);
    model.validate()?;
    Ok(model)
}

fn read_tree<R: Read>(d: &mut Decoder<R>, num_landmarks: usize) -> Result<StoredTree> {
    let splits = d.seq(|d| {
        Ok(StoredSplit {
            feature1: d.index()?,
            feature2: d.index()?,
            threshold: d.real()?,
        })
    })?;
    let leaves = d.seq(|d| d.points(Some(num_landmarks)).map(Shape::new))?;

    if leaves.len() != splits.len() + 1 {
        return Err(Error::InvalidModel(format!(
            "tree with {} splits has {} leaves",
            splits.len(),
            leaves.len()
        )));
    }
    Ok(StoredTree { splits, leaves })
}

/// Replace feature-pool indices with anchor landmarks and offsets. Children
/// of split `i` sit at `2i + 1` and `2i + 2`.
fn resolve_tree(tree: StoredTree, anchors: &[u16], offsets: &[Point]) -> Result<RegressionTree> {
    let lookup = |feature: u16| -> Result<(u16, Point)> {
        let i = feature as usize;
        match (anchors.get(i), offsets.get(i)) {
            (Some(&anchor), Some(&offset)) => Ok((anchor, offset)),
            _ => Err(Error::InvalidModel(format!(
                "split feature {} outside a pool of {}",
                feature,
                anchors.len().min(offsets.len())
            ))),
        }
    };

    let mut nodes = Vec::with_capacity(tree.splits.len() + tree.leaves.len());
    for (i, split) in tree.splits.iter().enumerate() {
        let (anchor1_idx, offset1) = lookup(split.feature1)?;
        let (anchor2_idx, offset2) = lookup(split.feature2)?;
        nodes.push(TreeNode::Split {
            feature: SplitFeature {
                anchor1_idx,
                offset1_x: offset1.x,
                offset1_y: offset1.y,
                anchor2_idx,
                offset2_x: offset2.x,
                offset2_y: offset2.y,
            },
            threshold: split.threshold,
            left: (2 * i + 1) as u32,
            right: (2 * i + 2) as u32,
        });
    }
    nodes.extend(tree.leaves.into_iter().map(|delta| TreeNode::Leaf { delta }));

    Ok(RegressionTree::new(nodes))
}
