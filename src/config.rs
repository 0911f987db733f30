//! Configuration for the detector trainer and the landmark model asset.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::detector::{DetectionWindow, OverlapTester};
use crate::error::{Error, Result};
use crate::fhog::PyramidParams;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub detector: DetectorConfig,
    pub landmark: LandmarkConfig,
}

/// Detection window, pyramid and trainer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Side of the square detection window in pixels; also the smallest
    /// detectable object size.
    pub window_size: u32,

    /// Regularization trade-off: larger values fit the training set harder.
    pub c: f64,

    /// Training stops once no further improvement of the training risk
    /// larger than this is possible.
    pub epsilon: f64,

    /// Training threads; 0 means one per available core.
    pub num_threads: usize,

    /// Hard cap on optimizer iterations.
    pub max_iterations: usize,

    /// FHOG cell side in pixels.
    pub cell_size: u32,

    /// Pyramid step: each level is `(n - 1) / n` of the previous one.
    pub pyramid_downsample: u32,

    /// IoU above which two detections are considered the same object.
    pub overlap_iou: f64,

    /// Fraction of the smaller box that, once covered, marks an overlap.
    pub overlap_covered: f64,

    /// IoU a window needs with a ground-truth box to count as a hit.
    pub match_iou: f64,

    pub loss_per_missed_target: f64,
    pub loss_per_false_alarm: f64,

    /// Score a window must exceed to be reported.
    pub threshold: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_size: 80,
            c: 1.0,
            epsilon: 0.01,
            num_threads: 0,
            max_iterations: 200,
            cell_size: 8,
            pyramid_downsample: 6,
            overlap_iou: 0.5,
            overlap_covered: 1.0,
            match_iou: 0.5,
            loss_per_missed_target: 1.0,
            loss_per_false_alarm: 1.0,
            threshold: 0.0,
        }
    }
}

impl DetectorConfig {
    pub fn pyramid(&self) -> PyramidParams {
        PyramidParams {
            cell_size: self.cell_size,
            downsample: self.pyramid_downsample,
        }
    }

    pub fn window(&self) -> DetectionWindow {
        DetectionWindow::from_pixels(self.window_size, self.cell_size)
    }

    pub fn overlap(&self) -> OverlapTester {
        OverlapTester {
            iou_thresh: self.overlap_iou,
            covered_thresh: self.overlap_covered,
        }
    }

    /// Resolved thread count, never less than 1.
    pub fn threads(&self) -> usize {
        if self.num_threads > 0 {
            return self.num_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(Error::Config("window_size must be positive".into()));
        }
        if self.cell_size == 0 {
            return Err(Error::Config("cell_size must be positive".into()));
        }
        if self.window_size < self.cell_size {
            return Err(Error::Config(format!(
                "window_size {} is smaller than one {}px cell",
                self.window_size, self.cell_size
            )));
        }
        if self.pyramid_downsample < 2 {
            return Err(Error::Config("pyramid_downsample must be at least 2".into()));
        }
        if !(self.c.is_finite() && self.c > 0.0) {
            return Err(Error::Config("C must be a positive number".into()));
        }
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(Error::Config("epsilon must be a positive number".into()));
        }
        if self.max_iterations == 0 {
            return Err(Error::Config("max_iterations must be positive".into()));
        }
        for (name, value) in [
            ("overlap_iou", self.overlap_iou),
            ("overlap_covered", self.overlap_covered),
            ("match_iou", self.match_iou),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!(
                    "{} must be between 0.0 and 1.0",
                    name
                )));
            }
        }
        if self.loss_per_missed_target <= 0.0 || self.loss_per_false_alarm <= 0.0 {
            return Err(Error::Config("losses must be positive".into()));
        }
        if !self.threshold.is_finite() {
            return Err(Error::Config("threshold must be a finite number".into()));
        }
        Ok(())
    }
}

/// Where the pre-trained landmark model lives and how many copies may exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LandmarkConfig {
    /// Installation root that `model` is resolved against.
    pub sdk_path: PathBuf,

    /// Model asset, relative to `sdk_path` unless absolute.
    pub model: PathBuf,

    /// Cap on pooled model instances; unbounded when absent.
    pub max_instances: Option<usize>,
}

impl Default for LandmarkConfig {
    fn default() -> Self {
        Self {
            sdk_path: PathBuf::from("."),
            model: PathBuf::from("share/models/dlib/shape_predictor_68_face_landmarks.dat"),
            max_instances: None,
        }
    }
}

impl LandmarkConfig {
    pub fn model_path(&self) -> PathBuf {
        self.sdk_path.join(&self.model)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_instances == Some(0) {
            return Err(Error::Config("max_instances must be at least 1".into()));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.detector.validate()?;
        self.landmark.validate()
    }
}

/// Example configuration file content
pub const EXAMPLE_CONFIG: &str = r#"# hog-landmark configuration

detector:
  window_size: 80
  c: 1.0
  epsilon: 0.01
  num_threads: 0          # 0 = one per core
  max_iterations: 200
  cell_size: 8
  pyramid_downsample: 6   # each level is 5/6 of the previous
  overlap_iou: 0.5
  overlap_covered: 1.0
  match_iou: 0.5
  loss_per_missed_target: 1.0
  loss_per_false_alarm: 1.0
  threshold: 0.0

landmark:
  sdk_path: "/usr/local"
  model: "share/models/dlib/shape_predictor_68_face_landmarks.dat"
"#;
