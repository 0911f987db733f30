//! Structural SVM training for [`ObjectDetector`].
//!
//! Each training image is one structured example whose label is its set of
//! ground-truth boxes. For the current weights a loss-augmented search finds
//! the most violating set of detections. Its sub-gradient becomes a cutting
//! plane under the training risk, and the next weights minimize the
//! regularized piecewise-linear model those planes form. The gap between the
//! best objective seen and the model's minimum bounds how much training could
//! still gain.
//!
//! The training set holds every image next to its mirror, so the risk is
//! unchanged by mirroring the weights. Sub-gradients are averaged with their
//! mirror and the learned weights are exactly mirror-symmetric.

use image::GrayImage;
use log::{debug, info, warn};
use rayon::prelude::*;

use crate::config::DetectorConfig;
use crate::detector::{
    accumulate_window, scan_pyramid, sort_candidates, window_rect, Candidate, DetectionWindow,
    ObjectDetector, OverlapTester, WindowLocation,
};
use crate::error::{Error, Result};
use crate::fhog::{build_pyramid, Pyramid, PyramidParams};
use crate::gray;
use crate::types::Rectangle;

/// Step cap for the dual solve of one cutting-plane model.
const MAX_QP_STEPS: usize = 5_000;

/// One image with every object of interest boxed.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSample {
    pub image: GrayImage,
    pub boxes: Vec<Rectangle>,
}

impl TrainingSample {
    pub fn new(image: GrayImage, boxes: Vec<Rectangle>) -> Self {
        Self { image, boxes }
    }

    /// The sample mirrored left to right, boxes included.
    pub fn flip_left_right(&self) -> Self {
        let width = self.image.width();
        Self {
            image: gray::flip_left_right(&self.image),
            boxes: self
                .boxes
                .iter()
                .map(|b| b.flip_left_right(width))
                .collect(),
        }
    }
}

/// Drop samples without boxes and follow every remaining sample with its
/// mirror image: `[s0, flip(s0), s1, flip(s1), ...]`.
pub fn add_image_left_right_flips(samples: &[TrainingSample]) -> Vec<TrainingSample> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for (idx, sample) in samples.iter().enumerate() {
        if sample.boxes.is_empty() {
            debug!("Skipping training image {}: no ground-truth boxes", idx);
            continue;
        }
        out.push(sample.clone());
        out.push(sample.flip_left_right());
    }
    out
}

/// A training image with its pyramid and ground truth resolved to windows.
struct PreparedSample {
    pyramid: Pyramid,
    /// Boxes matched to a window, in the order they were given.
    truth: Vec<Rectangle>,
    /// Boxes no window can represent. Detections on them are neither
    /// rewarded nor penalized.
    ignore: Vec<Rectangle>,
    /// Summed features of the windows representing `truth`.
    psi_truth: Vec<f64>,
}

/// Loss and sub-gradient of one sample at the current weights.
struct Violation {
    loss: f64,
    gradient: Option<Vec<f64>>,
}

/// Where the optimizer stopped.
struct Solution {
    /// Best weights seen, bias last.
    weights: Vec<f64>,
    /// `1/2 |w|^2 + C * risk` at `weights`.
    objective: f64,
    iterations: usize,
    converged: bool,
}

/// Planes `risk(w) >= a . w + b` collected so far, their Gram matrix and the
/// dual weights of the last solve.
#[derive(Default)]
struct CuttingPlanes {
    slopes: Vec<Vec<f64>>,
    offsets: Vec<f64>,
    gram: Vec<Vec<f64>>,
    alpha: Vec<f64>,
}

impl CuttingPlanes {
    fn push(&mut self, slope: Vec<f64>, offset: f64) {
        let mut row: Vec<f64> = self.slopes.iter().map(|a| dot(a, &slope)).collect();
        for (existing, &g) in self.gram.iter_mut().zip(&row) {
            existing.push(g);
        }
        row.push(dot(&slope, &slope));
        self.gram.push(row);
        self.slopes.push(slope);
        self.offsets.push(offset);
        // The first plane takes all the weight; later ones start from zero.
        self.alpha.push(if self.alpha.is_empty() { 1.0 } else { 0.0 });
    }

    /// Minimize `1/2 |w|^2 + c * max_i (a_i . w + b_i)` through its dual over
    /// the simplex, by pairwise coordinate steps. Returns the minimizer and a
    /// lower bound on the minimum.
    fn solve(&mut self, c: f64, tolerance: f64) -> (Vec<f64>, f64) {
        let n = self.alpha.len();
        // Gradient of `c/2 a'Ga - b'a`.
        let mut grad: Vec<f64> = (0..n)
            .map(|i| c * dot(&self.gram[i], &self.alpha) - self.offsets[i])
            .collect();

        for _ in 0..MAX_QP_STEPS {
            let Some(up) = (0..n).min_by(|&i, &j| grad[i].total_cmp(&grad[j])) else {
                break;
            };
            let Some(down) = (0..n)
                .filter(|&i| self.alpha[i] > 0.0)
                .max_by(|&i, &j| grad[i].total_cmp(&grad[j]))
            else {
                break;
            };
            let gap = grad[down] - grad[up];
            if gap <= tolerance {
                break;
            }

            let curvature =
                c * (self.gram[up][up] + self.gram[down][down] - 2.0 * self.gram[up][down]);
            let step = if curvature > 0.0 {
                (gap / curvature).min(self.alpha[down])
            } else {
                self.alpha[down]
            };
            self.alpha[down] -= step;
            self.alpha[up] += step;
            for (k, g) in grad.iter_mut().enumerate() {
                *g += c * step * (self.gram[k][up] - self.gram[k][down]);
            }
        }

        let dim = self.slopes.first().map_or(0, Vec::len);
        let mut weights = vec![0.0; dim];
        for (a, &alpha) in self.slopes.iter().zip(&self.alpha) {
            if alpha == 0.0 {
                continue;
            }
            for (w, x) in weights.iter_mut().zip(a) {
                *w -= c * alpha * x;
            }
        }
        let lower_bound = c * dot(&self.offsets, &self.alpha) - 0.5 * dot(&weights, &weights);
        (weights, lower_bound)
    }
}

pub struct StructuralTrainer {
    config: DetectorConfig,
    params: PyramidParams,
    window: DetectionWindow,
    overlap: OverlapTester,
}

impl StructuralTrainer {
    pub fn new(config: DetectorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            params: config.pyramid(),
            window: config.window(),
            overlap: config.overlap(),
            config,
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Fit a detector to `samples`.
    ///
    /// Samples without boxes are skipped; every other sample is used
    /// together with its mirror image. Fails with
    /// [`Error::NoTrainingSamples`] when nothing usable remains, and with
    /// [`Error::DegenerateModel`] when no weights beat the all-zero start.
    pub fn train(&self, samples: &[TrainingSample]) -> Result<ObjectDetector> {
        let threads = self.config.threads();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()?;
        debug!("Using {} training threads", threads);

        let prepared = pool.install(|| self.prepare_all(samples))?;
        let solution = pool.install(|| self.optimize(&prepared));
        if solution.weights.iter().all(|&w| w == 0.0) {
            return Err(Error::DegenerateModel {
                iterations: solution.iterations,
            });
        }

        let detector =
            ObjectDetector::new(self.params, self.window, self.overlap, solution.weights)?
                .with_threshold(self.config.threshold);
        Ok(detector)
    }

    /// Augment with mirrors and resolve every usable sample to its pyramid.
    fn prepare_all(&self, samples: &[TrainingSample]) -> Result<Vec<PreparedSample>> {
        let augmented = add_image_left_right_flips(samples);
        info!(
            "Training on {} of {} images ({} with mirrors)",
            augmented.len() / 2,
            samples.len(),
            augmented.len()
        );

        let mut prepared: Vec<PreparedSample> =
            augmented.par_iter().map(|sample| self.prepare(sample)).collect();

        // A sample and its mirror have the same size, so pairs are kept or
        // dropped together.
        let before = prepared.len();
        prepared.retain(|s| !s.pyramid.is_empty());
        if prepared.len() < before {
            warn!(
                "Skipping {} training images smaller than the {}x{} cell window",
                (before - prepared.len()) / 2,
                self.window.width_cells,
                self.window.height_cells
            );
        }
        if prepared.is_empty() {
            return Err(Error::NoTrainingSamples);
        }
        Ok(prepared)
    }

    fn prepare(&self, sample: &TrainingSample) -> PreparedSample {
        let pyramid = build_pyramid(&sample.image, &self.params, self.window.cells());
        let mut psi_truth = vec![0.0; self.window.num_weights()];
        let mut truth = Vec::new();
        let mut ignore = Vec::new();

        for rect in &sample.boxes {
            match self.best_window(&pyramid, rect) {
                Some((location, iou)) if iou >= self.config.match_iou => {
                    let level = &pyramid.levels[location.level];
                    accumulate_window(
                        &level.features,
                        &self.window,
                        location.x,
                        location.y,
                        &mut psi_truth,
                    );
                    truth.push(*rect);
                }
                Some((_, iou)) => {
                    warn!(
                        "Ignoring box {:?}: best window overlap {:.2} is below {:.2}",
                        rect, iou, self.config.match_iou
                    );
                    ignore.push(*rect);
                }
                None => ignore.push(*rect),
            }
        }

        PreparedSample {
            pyramid,
            truth,
            ignore,
            psi_truth,
        }
    }

    /// The window anywhere in the pyramid that best overlaps `rect`. Ties go
    /// to the earliest window in scan order.
    fn best_window(&self, pyramid: &Pyramid, rect: &Rectangle) -> Option<(WindowLocation, f64)> {
        let mut best: Option<(WindowLocation, f64)> = None;
        for (level_idx, level) in pyramid.levels.iter().enumerate() {
            let map = &level.features;
            for y in 0..=(map.height() - self.window.height_cells) {
                for x in 0..=(map.width() - self.window.width_cells) {
                    let candidate = window_rect(level, &self.window, self.params.cell_size, x, y);
                    let iou = candidate.iou(rect);
                    if best.map_or(true, |(_, b)| iou > b) {
                        best = Some((
                            WindowLocation {
                                level: level_idx,
                                x,
                                y,
                            },
                            iou,
                        ));
                    }
                }
            }
        }
        best
    }

    /// Greedy loss-augmented search: the set of detections maximizing
    /// `loss(detections) + w . psi(detections)`.
    fn find_violation(&self, sample: &PreparedSample, weights: &[f64]) -> Violation {
        let lfa = self.config.loss_per_false_alarm;
        let lmt = self.config.loss_per_missed_target;
        let match_iou = self.config.match_iou;

        // Only windows that could add to the objective as a false alarm or a
        // hit are worth visiting.
        let mut candidates = scan_pyramid(
            &sample.pyramid,
            &self.window,
            self.params.cell_size,
            weights,
            |score| score + lfa > 0.0,
        );
        sort_candidates(&mut candidates);

        let mut hit = vec![false; sample.truth.len()];
        let mut accepted: Vec<Candidate> = Vec::new();
        let mut false_alarms = 0usize;
        for c in candidates {
            if accepted.iter().any(|a| self.overlap.overlaps(&a.rect, &c.rect)) {
                continue;
            }
            if sample.ignore.iter().any(|r| r.iou(&c.rect) >= match_iou) {
                continue;
            }

            let target = sample
                .truth
                .iter()
                .enumerate()
                .filter(|(i, _)| !hit[*i])
                .map(|(i, t)| (i, t.iou(&c.rect)))
                .filter(|&(_, iou)| iou >= match_iou)
                .max_by(|a, b| a.1.total_cmp(&b.1));

            match target {
                Some((i, _)) => {
                    if c.score - lmt > 0.0 {
                        hit[i] = true;
                        accepted.push(c);
                    }
                }
                None => {
                    false_alarms += 1;
                    accepted.push(c);
                }
            }
        }

        let missed = hit.iter().filter(|h| !**h).count();
        let delta = lmt * missed as f64 + lfa * false_alarms as f64;
        let predicted: f64 = accepted.iter().map(|c| c.score).sum();
        let loss = delta + predicted - dot(weights, &sample.psi_truth);
        if loss <= 0.0 {
            return Violation {
                loss: 0.0,
                gradient: None,
            };
        }

        let mut gradient = vec![0.0; weights.len()];
        for c in &accepted {
            let level = &sample.pyramid.levels[c.location.level];
            accumulate_window(
                &level.features,
                &self.window,
                c.location.x,
                c.location.y,
                &mut gradient,
            );
        }
        for (g, t) in gradient.iter_mut().zip(&sample.psi_truth) {
            *g -= t;
        }
        Violation {
            loss,
            gradient: Some(gradient),
        }
    }

    /// Mean loss and mean sub-gradient over `samples` at `weights`, the
    /// gradient averaged with its mirror.
    fn risk(&self, samples: &[PreparedSample], weights: &[f64]) -> (f64, Vec<f64>) {
        let violations: Vec<Violation> = samples
            .par_iter()
            .map(|s| self.find_violation(s, weights))
            .collect();

        // Mirrored pairs are summed first so the result does not depend on
        // which of the two came first.
        let mut risk = 0.0;
        let mut gradient = vec![0.0; weights.len()];
        for pair in violations.chunks(2) {
            risk += pair.iter().map(|v| v.loss).sum::<f64>();
            match (pair[0].gradient.as_ref(), pair.get(1).and_then(|v| v.gradient.as_ref())) {
                (Some(a), Some(b)) => {
                    for ((g, x), y) in gradient.iter_mut().zip(a).zip(b) {
                        *g += x + y;
                    }
                }
                (Some(a), None) | (None, Some(a)) => {
                    for (g, x) in gradient.iter_mut().zip(a) {
                        *g += x;
                    }
                }
                (None, None) => {}
            }
        }

        let n = samples.len() as f64;
        for g in gradient.iter_mut() {
            *g /= n;
        }
        for i in 0..gradient.len() {
            let j = self.window.mirror_index(i);
            if j > i {
                let mean = 0.5 * (gradient[i] + gradient[j]);
                gradient[i] = mean;
                gradient[j] = mean;
            }
        }
        (risk / n, gradient)
    }

    /// Minimize `1/2 |w|^2 + C * risk(w)` by cutting planes, starting from
    /// zero. Stops once the best objective is within `C * epsilon` of the
    /// planes' lower bound, or after `max_iterations`.
    fn optimize(&self, samples: &[PreparedSample]) -> Solution {
        let c = self.config.c;
        let epsilon = self.config.epsilon;
        let mut planes = CuttingPlanes::default();
        let mut weights = vec![0.0; self.window.num_weights()];
        let mut best = Solution {
            weights: weights.clone(),
            objective: f64::INFINITY,
            iterations: 0,
            converged: false,
        };

        for t in 1..=self.config.max_iterations {
            let (risk, gradient) = self.risk(samples, &weights);
            let objective = 0.5 * dot(&weights, &weights) + c * risk;
            if objective < best.objective {
                best.objective = objective;
                best.weights.clone_from(&weights);
            }
            best.iterations = t;

            let offset = risk - dot(&gradient, &weights);
            planes.push(gradient, offset);
            let (next, lower_bound) = planes.solve(c, 0.01 * epsilon);
            let gap = (best.objective - lower_bound) / c;
            debug!(
                "Iteration {}: objective {:.6}, risk {:.6}, gap {:.6}",
                t, objective, risk, gap
            );
            if gap < epsilon {
                best.converged = true;
                break;
            }
            weights = next;
        }

        if best.converged {
            info!(
                "Training converged after {} iterations, objective {:.6}",
                best.iterations, best.objective
            );
        } else {
            warn!(
                "Training stopped after {} iterations before reaching epsilon {}, objective {:.6}",
                best.iterations, epsilon, best.objective
            );
        }
        best
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// A dark image with a bright 32x32 square at (`left`, `top`).
    fn square_sample(left: u32, top: u32) -> TrainingSample {
        let image = GrayImage::from_fn(64, 64, |x, y| {
            let inside = x >= left && x < left + 32 && y >= top && y < top + 32;
            Luma([if inside { 220 } else { 20 }])
        });
        TrainingSample::new(
            image,
            vec![Rectangle::from_size(left as i64, top as i64, 32, 32)],
        )
    }

    fn config() -> DetectorConfig {
        DetectorConfig {
            window_size: 32,
            c: 10.0,
            epsilon: 1e-4,
            num_threads: 2,
            ..DetectorConfig::default()
        }
    }

    #[test]
    fn no_samples_is_an_error() {
        let trainer = StructuralTrainer::new(config()).unwrap();
        assert!(matches!(trainer.train(&[]), Err(Error::NoTrainingSamples)));
    }

    #[test]
    fn images_without_boxes_are_dropped() {
        let empty = TrainingSample::new(GrayImage::from_pixel(64, 64, Luma([0])), Vec::new());
        let trainer = StructuralTrainer::new(config()).unwrap();
        assert!(matches!(
            trainer.train(&[empty.clone(), empty]),
            Err(Error::NoTrainingSamples)
        ));
    }

    #[test]
    fn images_smaller_than_the_window_are_dropped() {
        let tiny = TrainingSample::new(
            GrayImage::from_pixel(16, 16, Luma([0])),
            vec![Rectangle::from_size(0, 0, 8, 8)],
        );
        let trainer = StructuralTrainer::new(config()).unwrap();
        assert!(matches!(trainer.train(&[tiny]), Err(Error::NoTrainingSamples)));
    }

    #[test]
    fn augmentation_interleaves_mirrors() {
        let samples = vec![
            square_sample(8, 8),
            TrainingSample::new(GrayImage::from_pixel(64, 64, Luma([0])), Vec::new()),
            square_sample(24, 16),
        ];
        let augmented = add_image_left_right_flips(&samples);
        assert_eq!(augmented.len(), 4);
        assert_eq!(augmented[0], samples[0]);
        assert_eq!(augmented[1], samples[0].flip_left_right());
        assert_eq!(augmented[2], samples[2]);
        assert_eq!(augmented[1].boxes[0], Rectangle::new(24, 8, 55, 39));
        assert_eq!(augmented[1].flip_left_right(), samples[0]);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let bad = DetectorConfig {
            c: -1.0,
            ..config()
        };
        assert!(matches!(StructuralTrainer::new(bad), Err(Error::Config(_))));
    }

    fn nonzero(weights: &[f64]) -> usize {
        weights.iter().filter(|&&w| w != 0.0).count()
    }

    #[test]
    fn learns_to_find_the_training_object() {
        let samples = vec![square_sample(16, 16), square_sample(8, 24)];
        let trainer = StructuralTrainer::new(config()).unwrap();
        let detector = trainer.train(&samples).unwrap();

        assert_eq!(detector.window().cells(), (4, 4));
        assert!(nonzero(detector.weights()) > 0);
        for sample in &samples {
            let truth = sample.boxes[0];
            let dets = detector.detect(&sample.image);
            assert!(!dets.is_empty(), "nothing found for {:?}", truth);
            assert!(dets[0].iou(&truth) >= 0.5, "top detection {:?}", dets[0]);
        }
    }

    #[test]
    fn single_iteration_is_degenerate() {
        let config = DetectorConfig {
            max_iterations: 1,
            ..config()
        };
        let trainer = StructuralTrainer::new(config).unwrap();
        assert!(matches!(
            trainer.train(&[square_sample(16, 16)]),
            Err(Error::DegenerateModel { iterations: 1 })
        ));
    }

    #[test]
    fn epsilon_controls_when_training_stops() {
        let samples = vec![square_sample(16, 16), square_sample(8, 24)];
        let run = |epsilon: f64| {
            let trainer = StructuralTrainer::new(DetectorConfig {
                epsilon,
                ..config()
            })
            .unwrap();
            let prepared = trainer.prepare_all(&samples).unwrap();
            let first = trainer.risk(&prepared, &vec![0.0; trainer.window.num_weights()]).0;
            (trainer.optimize(&prepared), trainer.config.c * first)
        };

        let (coarse, start) = run(1.0);
        let (fine, _) = run(1e-6);

        assert!(coarse.converged);
        assert!(coarse.iterations <= fine.iterations);
        assert!(coarse.objective < start);
        assert!(nonzero(&coarse.weights) > 0);
        assert!(fine.objective <= coarse.objective);
    }

    #[test]
    fn trained_weights_are_mirror_symmetric() {
        let trainer = StructuralTrainer::new(config()).unwrap();
        let detector = trainer.train(&[square_sample(8, 24)]).unwrap();
        let window = detector.window();
        let weights = detector.weights();
        for i in 0..weights.len() {
            assert_eq!(weights[i], weights[window.mirror_index(i)], "weight {}", i);
        }
    }

    #[test]
    fn mirrored_dataset_detects_mirrored_objects() {
        let samples = vec![square_sample(16, 16), square_sample(8, 24)];
        let mirrored: Vec<TrainingSample> =
            samples.iter().map(TrainingSample::flip_left_right).collect();

        let trainer = StructuralTrainer::new(config()).unwrap();
        let model = trainer.train(&samples).unwrap();
        let mirror_model = trainer.train(&mirrored).unwrap();
        assert_eq!(model, mirror_model);
        assert!(nonzero(model.weights()) > 0);

        let image = samples[1].image.clone();
        let width = image.width();
        let direct = model.detect_scored(&image);
        let on_mirror = mirror_model.detect_scored(&gray::flip_left_right(&image));
        assert!(!direct.is_empty());
        assert!(!on_mirror.is_empty());

        let expected = direct[0].rect.flip_left_right(width);
        let found = on_mirror[0].rect;
        for (a, b) in [
            (expected.left, found.left),
            (expected.top, found.top),
            (expected.right, found.right),
            (expected.bottom, found.bottom),
        ] {
            assert!((a - b).abs() <= 1, "{:?} vs {:?}", expected, found);
        }
        assert!((direct[0].score - on_mirror[0].score).abs() < 1e-3);
    }

    #[test]
    fn trained_detections_do_not_overlap() {
        let samples = vec![square_sample(16, 16), square_sample(24, 24)];
        let detector = StructuralTrainer::new(config()).unwrap().train(&samples).unwrap();
        let dets = detector.detect(&samples[1].image);
        for (i, a) in dets.iter().enumerate() {
            for b in &dets[i + 1..] {
                assert!(!detector.overlap().overlaps(a, b));
            }
        }
    }
}
