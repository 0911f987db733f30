//! The two processing steps an image can go through: object detection and
//! landmark regression.
//!
//! Both consume a [`Template`] and return a copy with their results appended.
//! Existing rectangles and landmark sets are never replaced.

use std::sync::Arc;

use image::GrayImage;
use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::codec::{self, ModelKind, Persist};
use crate::config::{DetectorConfig, LandmarkConfig};
use crate::detector::ObjectDetector;
use crate::error::Result;
use crate::model::ShapePredictor;
use crate::pool::ResourcePool;
use crate::trainer::{StructuralTrainer, TrainingSample};
use crate::types::{Rectangle, Shape};

/// An image and everything found in it so far.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub image: GrayImage,
    pub rects: Vec<Rectangle>,
    /// One landmark set per landmarked rectangle, in the order produced.
    pub landmarks: Vec<Shape>,
}

impl Template {
    pub fn new(image: GrayImage) -> Self {
        Self {
            image,
            rects: Vec::new(),
            landmarks: Vec::new(),
        }
    }

    pub fn with_rects(mut self, rects: Vec<Rectangle>) -> Self {
        self.rects = rects;
        self
    }
}

/// Detection step. Owns its detector; training swaps in a new one.
#[derive(Debug, Clone)]
pub struct DetectOperation {
    config: DetectorConfig,
    detector: Option<Arc<ObjectDetector>>,
}

#[derive(Serialize, Deserialize)]
struct StoredDetectOperation {
    config: DetectorConfig,
    detector: Option<ObjectDetector>,
}

impl Persist for StoredDetectOperation {
    const KIND: ModelKind = ModelKind::DetectOperation;

    fn check(&self) -> Result<()> {
        self.config.validate()?;
        match &self.detector {
            Some(detector) => detector.validate(),
            None => Ok(()),
        }
    }
}

impl DetectOperation {
    pub fn new(config: DetectorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            detector: None,
        })
    }

    /// Use an already trained detector.
    pub fn with_detector(mut self, detector: ObjectDetector) -> Self {
        self.detector = Some(Arc::new(detector));
        self
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn detector(&self) -> Option<&ObjectDetector> {
        self.detector.as_deref()
    }

    pub fn is_trained(&self) -> bool {
        self.detector.is_some()
    }

    /// Train a new detector on the templates' rectangles, replacing any
    /// previous one. On failure the previous detector is kept.
    pub fn train(&mut self, templates: &[Template]) -> Result<()> {
        let samples: Vec<TrainingSample> = templates
            .iter()
            .map(|t| TrainingSample::new(t.image.clone(), t.rects.clone()))
            .collect();
        let detector = StructuralTrainer::new(self.config.clone())?.train(&samples)?;
        self.detector = Some(Arc::new(detector));
        Ok(())
    }

    /// Append detections to a copy of `template`. An untrained operation
    /// appends nothing.
    pub fn project(&self, template: &Template) -> Result<Template> {
        let mut out = template.clone();
        match &self.detector {
            Some(detector) => {
                let found = detector.detect(&template.image);
                debug!("Detected {} objects", found.len());
                out.rects.extend(found);
            }
            None => debug!("Detector is not trained; no detections"),
        }
        Ok(out)
    }

    /// Encode the configuration and detector, trained or not.
    pub fn store(&self) -> Result<Vec<u8>> {
        codec::serialize(&StoredDetectOperation {
            config: self.config.clone(),
            detector: self.detector.as_deref().cloned(),
        })
    }

    pub fn load(bytes: &[u8]) -> Result<Self> {
        let stored: StoredDetectOperation = codec::deserialize(bytes)?;
        Ok(Self {
            config: stored.config,
            detector: stored.detector.map(Arc::new),
        })
    }
}

/// Landmark step. Predictors come from a shared pool.
#[derive(Clone)]
pub struct LandmarkOperation {
    pool: Arc<ResourcePool<ShapePredictor>>,
}

impl LandmarkOperation {
    /// Pool predictors loaded from the configured asset. Nothing is read
    /// until the first rectangle needs landmarking.
    pub fn new(config: &LandmarkConfig) -> Result<Self> {
        config.validate()?;
        let path = config.model_path();
        info!("Landmark model asset: {}", path.display());
        let mut pool = ResourcePool::new(move || ShapePredictor::load_asset(&path));
        if let Some(max) = config.max_instances {
            pool = pool.with_max_instances(max);
        }
        Ok(Self::with_pool(Arc::new(pool)))
    }

    pub fn with_pool(pool: Arc<ResourcePool<ShapePredictor>>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ResourcePool<ShapePredictor> {
        &self.pool
    }

    /// Append one landmark set per rectangle to a copy of `template`.
    ///
    /// A template without rectangles comes back unchanged.
    pub fn project(&self, template: &Template) -> Result<Template> {
        if template.rects.is_empty() {
            debug!("No rectangles to landmark");
            return Ok(template.clone());
        }

        let predictor = self.pool.acquire()?;
        let shapes: Vec<Shape> = template
            .rects
            .iter()
            .map(|rect| predictor.predict(&template.image, rect))
            .collect();
        drop(predictor);

        let mut out = template.clone();
        out.landmarks.extend(shapes);
        Ok(out)
    }
}

/// A processing step.
#[derive(Clone)]
pub enum Operation {
    Detect(DetectOperation),
    Landmark(LandmarkOperation),
}

impl Operation {
    /// Train the step. Landmarking uses a pre-trained model and ignores this.
    pub fn train(&mut self, templates: &[Template]) -> Result<()> {
        match self {
            Operation::Detect(op) => op.train(templates),
            Operation::Landmark(_) => Ok(()),
        }
    }

    pub fn project(&self, template: &Template) -> Result<Template> {
        match self {
            Operation::Detect(op) => op.project(template),
            Operation::Landmark(op) => op.project(template),
        }
    }

    /// Project independent templates in parallel. Results keep input order
    /// and fail individually.
    pub fn project_batch(&self, templates: &[Template]) -> Vec<Result<Template>> {
        templates.par_iter().map(|t| self.project(t)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::tests::edge_detector;
    use crate::error::Error;
    use crate::model::tests::create_test_model;
    use image::Luma;

    fn stripes() -> GrayImage {
        GrayImage::from_fn(96, 96, |x, _| Luma([if (x / 4) % 2 == 0 { 30 } else { 220 }]))
    }

    fn test_landmarker() -> LandmarkOperation {
        LandmarkOperation::with_pool(Arc::new(ResourcePool::new(|| Ok(create_test_model()))))
    }

    fn broken_landmarker() -> LandmarkOperation {
        LandmarkOperation::with_pool(Arc::new(ResourcePool::new(|| {
            Err(Error::InvalidModel("missing".into()))
        })))
    }

    #[test]
    fn landmarking_without_rectangles_passes_through() {
        let op = broken_landmarker();
        let template = Template::new(stripes());
        let out = op.project(&template).unwrap();
        assert_eq!(out, template);
        assert_eq!(op.pool().created(), 0);
    }

    #[test]
    fn landmarks_are_appended_per_rectangle() {
        let op = test_landmarker();
        let mut template = Template::new(stripes()).with_rects(vec![
            Rectangle::new(10, 10, 60, 60),
            Rectangle::new(30, 20, 90, 80),
        ]);
        template.landmarks.push(Shape::zeros(5));

        let out = op.project(&template).unwrap();
        assert_eq!(out.rects, template.rects);
        assert_eq!(out.landmarks.len(), 3);
        assert_eq!(out.landmarks[0], Shape::zeros(5));
        assert!(out.landmarks[1..].iter().all(|s| s.num_landmarks() == 68));
        assert_eq!(op.pool().idle(), 1);
    }

    #[test]
    fn missing_asset_fails_then_poisons() {
        let op = broken_landmarker();
        let template = Template::new(stripes()).with_rects(vec![Rectangle::new(0, 0, 40, 40)]);
        assert!(matches!(op.project(&template), Err(Error::InvalidModel(_))));
        assert!(matches!(op.project(&template), Err(Error::PoolPoisoned(_))));
    }

    #[test]
    fn untrained_detector_is_deterministically_empty() {
        let op = DetectOperation::new(DetectorConfig::default()).unwrap();
        assert!(!op.is_trained());
        let existing = Rectangle::new(1, 2, 3, 4);
        for image in [stripes(), GrayImage::from_pixel(200, 150, Luma([7]))] {
            let template = Template::new(image).with_rects(vec![existing]);
            for _ in 0..3 {
                assert_eq!(op.project(&template).unwrap(), template);
            }
        }
    }

    #[test]
    fn detections_are_appended() {
        let existing = Rectangle::new(1, 2, 3, 4);
        let detector = edge_detector(32);
        let expected = detector.detect(&stripes());
        let op = DetectOperation::new(DetectorConfig::default())
            .unwrap()
            .with_detector(detector);

        let out = op
            .project(&Template::new(stripes()).with_rects(vec![existing]))
            .unwrap();
        assert_eq!(out.rects[0], existing);
        assert_eq!(&out.rects[1..], expected.as_slice());
    }

    #[test]
    fn store_and_load_round_trip() {
        let untrained = DetectOperation::new(DetectorConfig::default()).unwrap();
        let restored = DetectOperation::load(&untrained.store().unwrap()).unwrap();
        assert!(!restored.is_trained());
        assert_eq!(restored.config(), untrained.config());

        let trained = untrained.with_detector(edge_detector(32));
        let restored = DetectOperation::load(&trained.store().unwrap()).unwrap();
        assert_eq!(restored.detector(), trained.detector());

        let template = Template::new(stripes());
        assert_eq!(
            restored.project(&template).unwrap(),
            trained.project(&template).unwrap()
        );
    }

    #[test]
    fn stored_operation_is_not_a_detector() {
        let op = DetectOperation::new(DetectorConfig::default())
            .unwrap()
            .with_detector(edge_detector(32));
        let bytes = op.store().unwrap();
        assert!(matches!(
            ObjectDetector::from_bytes(&bytes),
            Err(Error::CorruptModel(_))
        ));
    }

    #[test]
    fn training_through_the_operation() {
        let image = GrayImage::from_fn(64, 64, |x, y| {
            let inside = (16..48).contains(&x) && (16..48).contains(&y);
            Luma([if inside { 220 } else { 20 }])
        });
        let config = DetectorConfig {
            window_size: 32,
            max_iterations: 50,
            num_threads: 1,
            ..DetectorConfig::default()
        };
        let mut op = Operation::Detect(DetectOperation::new(config).unwrap());

        let unlabeled = [Template::new(image.clone())];
        assert!(matches!(op.train(&unlabeled), Err(Error::NoTrainingSamples)));

        let labeled = [Template::new(image).with_rects(vec![Rectangle::from_size(16, 16, 32, 32)])];
        op.train(&labeled).unwrap();
        match &op {
            Operation::Detect(d) => assert!(d.is_trained()),
            Operation::Landmark(_) => unreachable!(),
        }
    }

    #[test]
    fn batch_keeps_order_and_fails_per_item() {
        let op = Operation::Landmark(broken_landmarker());
        let templates = vec![
            Template::new(stripes()),
            Template::new(stripes()).with_rects(vec![Rectangle::new(0, 0, 40, 40)]),
            Template::new(stripes()),
        ];
        let results = op.project_batch(&templates);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap(), &templates[0]);
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap(), &templates[2]);

        let op = Operation::Landmark(test_landmarker());
        let results = op.project_batch(&templates);
        assert_eq!(results[1].as_ref().unwrap().landmarks.len(), 1);
    }

    #[test]
    fn landmarking_ignores_training() {
        let mut op = Operation::Landmark(broken_landmarker());
        assert!(op.train(&[]).is_ok());
    }
}
