use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    /// The bundled model asset could not be read or parsed.
    #[error("Model asset {path:?} unavailable: {reason}")]
    AssetMissing { path: PathBuf, reason: String },

    /// A pool whose factory failed once; it is never retried.
    #[error("Resource pool unusable after construction failure: {0}")]
    PoolPoisoned(String),

    #[error("No usable training samples: every image lacks ground-truth rectangles")]
    NoTrainingSamples,

    /// The optimizer found nothing better than the all-zero weight vector.
    #[error("Training produced an all-zero detector after {iterations} iterations")]
    DegenerateModel { iterations: usize },

    /// Serialized bytes that are foreign, truncated or tampered with.
    #[error("Corrupt model bytes: {0}")]
    CorruptModel(String),

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, Error>;
