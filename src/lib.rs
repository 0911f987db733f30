//! # hog-landmark
//!
//! Object detection and landmark regression on grayscale images, in pure Rust.
//!
//! This crate provides:
//! - **Detection**: a sliding-window linear detector over an FHOG feature
//!   pyramid, trained with a structural SVM on boxed example images
//! - **Landmarks**: ERT shape prediction ("One Millisecond Face Alignment with
//!   an Ensemble of Regression Trees", Kazemi & Sullivan, 2014), reading dlib's
//!   `shape_predictor_*.dat` models directly
//! - **Pooling**: shared, lazily built predictor instances for concurrent callers
//! - **Persistence**: checksummed, bit-exact encoding of trained models
//!
//! ## Detection
//!
//! 1. Build a pyramid of 31-dimensional FHOG cells, each level 5/6 of the last
//! 2. Score every window position with `w . features + bias`
//! 3. Keep windows scoring above the threshold
//! 4. Greedy non-maximum suppression across all levels
//!
//! ```rust
//! use hog_landmark::{DetectorConfig, GrayImage, Rectangle, StructuralTrainer, TrainingSample};
//!
//! let image = GrayImage::from_fn(64, 64, |x, y| {
//!     let inside = (16..48).contains(&x) && (16..48).contains(&y);
//!     image::Luma([if inside { 220 } else { 20 }])
//! });
//! let sample = TrainingSample::new(image.clone(), vec![Rectangle::from_size(16, 16, 32, 32)]);
//!
//! let config = DetectorConfig { window_size: 32, max_iterations: 50, ..Default::default() };
//! let detector = StructuralTrainer::new(config)?.train(&[sample])?;
//! for rect in detector.detect(&image) {
//!     println!("{:?}", rect);
//! }
//! # Ok::<(), hog_landmark::Error>(())
//! ```
//!
//! ## Landmarks
//!
//! ```rust
//! use hog_landmark::{
//!     GrayImage, Point, Rectangle, RegressionTree, Shape, ShapePredictor, TreeEnsemble, TreeNode,
//! };
//!
//! let mean_shape = Shape::new(vec![
//!     Point::new(0.3, 0.35),
//!     Point::new(0.7, 0.35),
//!     Point::new(0.5, 0.75),
//! ]);
//! let tree = RegressionTree::new(vec![TreeNode::Leaf {
//!     delta: Shape::zeros(3),
//! }]);
//! let model = ShapePredictor::new(mean_shape, vec![TreeEnsemble::new(vec![tree], 3)]);
//! model.validate()?;
//!
//! let image = GrayImage::from_fn(640, 480, |x, y| image::Luma([((x + y) % 256) as u8]));
//! let landmarks = model.predict(&image, &Rectangle::new(100, 50, 299, 249));
//! assert_eq!(landmarks.num_landmarks(), 3);
//! # Ok::<(), hog_landmark::Error>(())
//! ```
//!
//! Implement [`ImageAccess`] to run the landmark regressor on other image types.

mod codec;
mod config;
mod detector;
pub mod dlib;
mod error;
mod features;
mod fhog;
mod gray;
mod model;
mod operation;
mod pool;
mod trainer;
mod tree;
mod types;

pub use codec::{deserialize, serialize, ModelKind, Persist};
pub use config::{Config, DetectorConfig, LandmarkConfig, EXAMPLE_CONFIG};
pub use detector::{Detection, DetectionWindow, ObjectDetector, OverlapTester};
pub use error::{Error, Result};
pub use features::{find_similarity_transform, SimilarityTransform2D};
pub use fhog::{
    build_pyramid, extract_fhog, mirror_dim, FeatureMap, Pyramid, PyramidLevel, PyramidParams,
    FHOG_DIMS,
};
pub use gray::{flip_left_right, to_gray, ImageAccess};
pub use image::GrayImage;
pub use model::ShapePredictor;
pub use operation::{DetectOperation, LandmarkOperation, Operation, Template};
pub use pool::{Pooled, ResourcePool};
pub use trainer::{add_image_left_right_flips, StructuralTrainer, TrainingSample};
pub use tree::{RegressionTree, SplitFeature, TreeEnsemble, TreeNode};
pub use types::{Point, Rectangle, Shape};
