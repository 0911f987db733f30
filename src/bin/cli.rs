//! Command line front end: train and run detectors, landmark regions and
//! inspect saved models.
//!
//! Usage:
//!   hog-landmark train --annotations boxes.json --output detector.bin
//!   hog-landmark detect --model detector.bin photo.jpg
//!   hog-landmark landmark --config config.yaml photo.jpg --rect 40,30,200,190
//!   hog-landmark inspect detector.bin

use clap::{Parser, Subcommand};
use hog_landmark::{
    to_gray, Config, DetectOperation, Detection, GrayImage, LandmarkOperation, ObjectDetector,
    Point, Rectangle, ShapePredictor, StructuralTrainer, Template, TrainingSample,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "hog-landmark")]
#[command(author, version, about = "Object detection and landmark regression", long_about = None)]
struct Args {
    /// Show debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a detector from boxed example images
    Train {
        /// JSON list of {"image": path, "boxes": [[left, top, right, bottom], ...]}
        #[arg(long)]
        annotations: PathBuf,

        /// Where to write the trained detector
        #[arg(short, long)]
        output: PathBuf,

        /// YAML configuration (defaults when absent)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Run a trained detector over images
    Detect {
        /// Trained detector file
        #[arg(short, long)]
        model: PathBuf,

        /// Minimum window score; defaults to the trained threshold
        #[arg(long)]
        threshold: Option<f64>,

        #[arg(required = true)]
        images: Vec<PathBuf>,
    },

    /// Predict landmarks inside given rectangles
    Landmark {
        /// YAML configuration naming the landmark model
        #[arg(short, long)]
        config: Option<PathBuf>,

        image: PathBuf,

        /// Region as left,top,right,bottom; repeat for several regions
        #[arg(long = "rect", required = true, value_parser = parse_rect)]
        rects: Vec<Rectangle>,
    },

    /// Summarize a saved model
    Inspect { model: PathBuf },
}

#[derive(Deserialize)]
struct Annotation {
    image: PathBuf,
    boxes: Vec<[i64; 4]>,
}

#[derive(Serialize)]
struct DetectOutput {
    image: String,
    width: u32,
    height: u32,
    detections: Vec<Detection>,
}

#[derive(Serialize)]
struct LandmarkOutput {
    rect: Rectangle,
    points: Vec<Point>,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum InspectOutput {
    ObjectDetector {
        window_cells: (usize, usize),
        cell_size: u32,
        pyramid_downsample: u32,
        num_weights: usize,
        bias: f64,
        threshold: f64,
    },
    ShapePredictor {
        num_landmarks: usize,
        num_cascade_stages: usize,
    },
    DetectOperation {
        trained: bool,
        window_size: u32,
        c: f64,
        epsilon: f64,
    },
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(level));

    if let Err(e) = run(args.command) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Train {
            annotations,
            output,
            config,
        } => train(&annotations, &output, config.as_deref()),
        Command::Detect {
            model,
            threshold,
            images,
        } => detect(&model, threshold, &images),
        Command::Landmark {
            config,
            image,
            rects,
        } => landmark(config.as_deref(), &image, rects),
        Command::Inspect { model } => inspect(&model),
    }
}

fn load_config(path: Option<&Path>) -> hog_landmark::Result<Config> {
    match path {
        Some(path) => Config::from_file(path),
        None => Ok(Config::default()),
    }
}

fn load_gray(path: &Path) -> Result<GrayImage, Box<dyn std::error::Error>> {
    let img = image::open(path)?;
    Ok(to_gray(&img))
}

fn train(
    annotations: &Path,
    output: &Path,
    config: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config)?;
    let entries: Vec<Annotation> = serde_json::from_str(&std::fs::read_to_string(annotations)?)?;

    // Image paths are relative to the annotation file.
    let base = annotations.parent().unwrap_or_else(|| Path::new("."));
    let mut samples = Vec::with_capacity(entries.len());
    for entry in entries {
        let path = base.join(&entry.image);
        let image = load_gray(&path)?;
        let boxes = entry
            .boxes
            .iter()
            .map(|&[l, t, r, b]| Rectangle::new(l, t, r, b))
            .collect();
        samples.push(TrainingSample::new(image, boxes));
    }
    info!("Loaded {} annotated images", samples.len());

    let detector = StructuralTrainer::new(config.detector)?.train(&samples)?;
    std::fs::write(output, detector.to_bytes()?)?;
    info!("Detector written to {}", output.display());
    Ok(())
}

fn detect(
    model: &Path,
    threshold: Option<f64>,
    images: &[PathBuf],
) -> Result<(), Box<dyn std::error::Error>> {
    let mut detector = ObjectDetector::from_bytes(&std::fs::read(model)?)?;
    if let Some(threshold) = threshold {
        detector = detector.with_threshold(threshold);
    }

    let mut outputs = Vec::with_capacity(images.len());
    for path in images {
        let image = match load_gray(path) {
            Ok(image) => image,
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };
        outputs.push(DetectOutput {
            image: path.display().to_string(),
            width: image.width(),
            height: image.height(),
            detections: detector.detect_scored(&image),
        });
    }

    println!("{}", serde_json::to_string_pretty(&outputs)?);
    Ok(())
}

fn landmark(
    config: Option<&Path>,
    image: &Path,
    rects: Vec<Rectangle>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config)?;
    let op = LandmarkOperation::new(&config.landmark)?;

    let template = Template::new(load_gray(image)?).with_rects(rects);
    let out = op.project(&template)?;

    let results: Vec<LandmarkOutput> = out
        .rects
        .iter()
        .zip(out.landmarks)
        .map(|(rect, shape)| LandmarkOutput {
            rect: *rect,
            points: shape.points,
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

fn inspect(model: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = std::fs::read(model)?;

    let summary = if let Ok(detector) = ObjectDetector::from_bytes(&bytes) {
        InspectOutput::ObjectDetector {
            window_cells: detector.window().cells(),
            cell_size: detector.params().cell_size,
            pyramid_downsample: detector.params().downsample,
            num_weights: detector.weights().len(),
            bias: detector.weights().last().copied().unwrap_or_default(),
            threshold: detector.threshold(),
        }
    } else if let Ok(predictor) = ShapePredictor::from_bytes(&bytes) {
        InspectOutput::ShapePredictor {
            num_landmarks: predictor.num_landmarks(),
            num_cascade_stages: predictor.num_cascade_stages(),
        }
    } else {
        let op = DetectOperation::load(&bytes)?;
        InspectOutput::DetectOperation {
            trained: op.is_trained(),
            window_size: op.config().window_size,
            c: op.config().c,
            epsilon: op.config().epsilon,
        }
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn parse_rect(s: &str) -> Result<Rectangle, String> {
    let values: Vec<i64> = s
        .split(',')
        .map(|v| v.trim().parse::<i64>().map_err(|e| format!("{}: {}", v, e)))
        .collect::<Result<_, _>>()?;
    match values.as_slice() {
        &[l, t, r, b] => Ok(Rectangle::new(l, t, r, b)),
        _ => Err(format!("expected left,top,right,bottom, got {:?}", s)),
    }
}
