use std::fs;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::codec::{self, ModelKind, Persist};
use crate::error::{Error, Result};
use crate::features::{find_similarity_transform, make_feature_extractor};
use crate::gray::ImageAccess;
use crate::tree::TreeEnsemble;
use crate::types::{Rectangle, Shape};

/// The landmark regression cascade.
///
/// This implements the ERT algorithm for landmark detection.
/// The model consists of:
/// - A mean shape (initial estimate)
/// - A cascade of tree ensembles that iteratively refine the shape
///
/// A predictor is never mutated after construction, so one instance can
/// serve any number of sequential `predict` calls.
///
/// # Usage
///
/// ```ignore
/// let model = ShapePredictor::load("model.bin")?;
/// let rect = Rectangle::new(100, 100, 299, 299);
/// let landmarks = model.predict(&image, &rect);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapePredictor {
    /// The mean shape in rectangle-normalized [0,1] coordinates.
    mean_shape: Shape,

    /// Cascade of tree ensembles, applied strictly in order.
    cascade: Vec<TreeEnsemble>,

    /// Number of landmark points (typically 68 for full face, 5 for simplified).
    num_landmarks: usize,
}

impl ShapePredictor {
    /// Create a new shape predictor with the given mean shape and cascade.
    pub fn new(mean_shape: Shape, cascade: Vec<TreeEnsemble>) -> Self {
        let num_landmarks = mean_shape.num_landmarks();
        Self {
            mean_shape,
            cascade,
            num_landmarks,
        }
    }

    /// Load a model written by [`ShapePredictor::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Save the model to a binary file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        codec::serialize(self)
    }

    /// Decode and structurally validate a predictor.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        codec::deserialize(bytes)
    }

    /// Load a landmark asset, choosing the format by extension: `.bin` files
    /// are crate-native, anything else is read as a dlib `.dat`/`.dat.bz2`.
    ///
    /// Every failure is reported as [`Error::AssetMissing`].
    pub fn load_asset<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading landmark model from {}", path.display());

        let native = path.extension().is_some_and(|ext| ext == "bin");
        let loaded = if native {
            Self::load(path)
        } else {
            crate::dlib::load_dlib_model(path)
        };

        loaded.map_err(|e| Error::AssetMissing {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Get the number of landmarks this model predicts.
    pub fn num_landmarks(&self) -> usize {
        self.num_landmarks
    }

    /// Get the number of cascade stages.
    pub fn num_cascade_stages(&self) -> usize {
        self.cascade.len()
    }

    pub fn mean_shape(&self) -> &Shape {
        &self.mean_shape
    }

    /// Check that every stage agrees with the mean shape on the point count.
    pub fn validate(&self) -> Result<()> {
        if self.num_landmarks != self.mean_shape.num_landmarks() {
            return Err(Error::InvalidModel(format!(
                "declared {} landmarks but mean shape has {}",
                self.num_landmarks,
                self.mean_shape.num_landmarks()
            )));
        }
        for (idx, stage) in self.cascade.iter().enumerate() {
            if stage.num_landmarks != self.num_landmarks {
                return Err(Error::InvalidModel(format!(
                    "cascade stage {} predicts {} landmarks, expected {}",
                    idx, stage.num_landmarks, self.num_landmarks
                )));
            }
            stage.validate()?;
        }
        Ok(())
    }

    /// Predict landmarks for the object bounded by `rect`.
    ///
    /// # Arguments
    ///
    /// * `image` - Grayscale image to analyze
    /// * `rect` - Region believed to hold exactly one object instance
    ///
    /// # Returns
    ///
    /// A `Shape` with exactly [`num_landmarks`](Self::num_landmarks) points in
    /// image coordinates. A zero-area rectangle still yields every point,
    /// collapsed onto the rectangle.
    pub fn predict<I: ImageAccess>(&self, image: &I, rect: &Rectangle) -> Shape {
        // The estimate stays in normalized coordinates until the end.
        let mut current_shape = self.mean_shape.clone();

        for ensemble in &self.cascade {
            // Lets feature offsets follow the rotation and scale of the
            // current estimate relative to the mean shape.
            let tform = find_similarity_transform(&self.mean_shape, &current_shape);

            let delta = {
                let get_feature = make_feature_extractor(&current_shape, rect, image, tform);
                ensemble.predict(get_feature)
            };

            current_shape.add_delta(&delta);
        }

        Shape::new(
            current_shape
                .points
                .iter()
                .map(|p| rect.denormalize_point(*p))
                .collect(),
        )
    }
}

impl Persist for ShapePredictor {
    const KIND: ModelKind = ModelKind::ShapePredictor;

    fn check(&self) -> Result<()> {
        self.validate()
    }
}
