//! End-to-end: train a detector, persist it, detect, then landmark the hits.

use std::sync::Arc;

use hog_landmark::{
    flip_left_right, DetectOperation, DetectorConfig, GrayImage, LandmarkOperation,
    ObjectDetector, Operation, Point, Rectangle, RegressionTree, ResourcePool, Shape,
    ShapePredictor, SplitFeature, Template, TreeEnsemble, TreeNode,
};
use image::Luma;

fn square_image(left: u32, top: u32) -> GrayImage {
    GrayImage::from_fn(64, 64, |x, y| {
        let inside = x >= left && x < left + 32 && y >= top && y < top + 32;
        Luma([if inside { 220 } else { 20 }])
    })
}

fn labeled(left: u32, top: u32) -> Template {
    Template::new(square_image(left, top))
        .with_rects(vec![Rectangle::from_size(left as i64, top as i64, 32, 32)])
}

fn config() -> DetectorConfig {
    DetectorConfig {
        window_size: 32,
        c: 10.0,
        epsilon: 1e-4,
        max_iterations: 100,
        num_threads: 2,
        ..DetectorConfig::default()
    }
}

/// 68 points spread row by row over the unit square, ten to a row.
fn grid_shape() -> Shape {
    Shape::new(
        (0..68)
            .map(|i| Point::new(0.1 + 0.08 * (i % 10) as f32, 0.1 + 0.08 * (i / 10) as f32))
            .collect(),
    )
}

/// Moves every point right when the top-left point is brighter than the
/// bottom-right one, down otherwise.
fn split_predictor() -> ShapePredictor {
    let mut right = Shape::zeros(68);
    let mut down = Shape::zeros(68);
    for i in 0..68 {
        right[i] = Point::new(0.02, 0.0);
        down[i] = Point::new(0.0, 0.02);
    }
    let tree = RegressionTree::new(vec![
        TreeNode::Split {
            feature: SplitFeature {
                anchor1_idx: 0,
                offset1_x: 0.0,
                offset1_y: 0.0,
                anchor2_idx: 67,
                offset2_x: 0.0,
                offset2_y: 0.0,
            },
            threshold: 10.0,
            left: 1,
            right: 2,
        },
        TreeNode::Leaf { delta: right },
        TreeNode::Leaf { delta: down },
    ]);
    let model = ShapePredictor::new(grid_shape(), vec![TreeEnsemble::new(vec![tree], 68)]);
    model.validate().unwrap();
    model
}

#[test]
fn trained_detector_survives_persistence() {
    let mut op = DetectOperation::new(config()).unwrap();
    op.train(&[labeled(16, 16), labeled(8, 24)]).unwrap();

    let trained = op.detector().unwrap();
    assert!(trained.weights().iter().any(|&w| w != 0.0));
    assert!(!trained.detect(&square_image(16, 16)).is_empty());

    let restored = DetectOperation::load(&op.store().unwrap()).unwrap();
    let bytes = trained.to_bytes().unwrap();
    let detector = ObjectDetector::from_bytes(&bytes).unwrap();

    for image in [square_image(16, 16), square_image(24, 8), GrayImage::new(80, 70)] {
        let template = Template::new(image.clone());
        assert_eq!(
            restored.project(&template).unwrap(),
            op.project(&template).unwrap()
        );
        assert_eq!(
            detector.detect_scored(&image),
            op.detector().unwrap().detect_scored(&image)
        );
    }
}

#[test]
fn detect_then_landmark() {
    let mut detect = Operation::Detect(DetectOperation::new(config()).unwrap());
    detect.train(&[labeled(16, 16), labeled(24, 8)]).unwrap();

    let pool = Arc::new(ResourcePool::new(|| Ok(split_predictor())));
    let landmark = Operation::Landmark(LandmarkOperation::with_pool(pool.clone()));

    let template = Template::new(square_image(16, 16));
    let detected = detect.project(&template).unwrap();
    let out = landmark.project(&detected).unwrap();

    assert!(!detected.rects.is_empty());
    assert!(detected.rects[0].iou(&Rectangle::from_size(16, 16, 32, 32)) >= 0.5);
    assert_eq!(out.rects, detected.rects);
    assert_eq!(out.landmarks.len(), out.rects.len());
    assert!(out.landmarks.iter().all(|s| s.num_landmarks() == 68));
    assert_eq!(pool.created(), 1);
}

#[test]
fn mirrored_training_set_gives_mirrored_detections() {
    let labeled_set = [labeled(16, 16), labeled(8, 24)];
    let mirrored_set: Vec<Template> = labeled_set
        .iter()
        .map(|t| {
            let width = t.image.width();
            Template::new(flip_left_right(&t.image))
                .with_rects(t.rects.iter().map(|r| r.flip_left_right(width)).collect())
        })
        .collect();

    let mut original = DetectOperation::new(config()).unwrap();
    original.train(&labeled_set).unwrap();
    let mut mirrored = DetectOperation::new(config()).unwrap();
    mirrored.train(&mirrored_set).unwrap();

    let image = square_image(8, 24);
    let width = image.width();
    let expected: Vec<Rectangle> = original
        .project(&Template::new(image.clone()))
        .unwrap()
        .rects
        .iter()
        .map(|r| r.flip_left_right(width))
        .collect();
    let found = mirrored
        .project(&Template::new(flip_left_right(&image)))
        .unwrap()
        .rects;

    assert!(!expected.is_empty());
    assert!(!found.is_empty());
    assert!(
        found[0].iou(&expected[0]) > 0.9,
        "{:?} vs {:?}",
        found[0],
        expected[0]
    );
}

#[test]
fn concurrent_landmarking_matches_sequential() {
    let pool = Arc::new(ResourcePool::new(|| Ok(split_predictor())).with_max_instances(1));
    let op = Operation::Landmark(LandmarkOperation::with_pool(pool.clone()));

    let templates: Vec<Template> = (0..16u32)
        .map(|i| {
            Template::new(square_image(i % 32, (i * 3) % 32)).with_rects(vec![
                Rectangle::new(0, 0, 63, 63),
                Rectangle::new(10, 5, 50, 60),
            ])
        })
        .collect();

    let sequential: Vec<Template> = templates
        .iter()
        .map(|t| op.project(t).unwrap())
        .collect();

    let op_ref = &op;
    let parallel: Vec<Template> = std::thread::scope(|s| {
        let handles: Vec<_> = templates
            .iter()
            .map(|t| s.spawn(move || op_ref.project(t).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(parallel, sequential);

    let batch: Vec<Template> = op
        .project_batch(&templates)
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(batch, sequential);

    assert_eq!(pool.created(), 1);
}
