use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid base64 image buffer: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid json pixel array: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cannot reshape {actual} values into {expected:?}")]
    Shape {
        expected: (usize, usize, usize),
        actual: usize,
    },
    #[error("invalid bounding box {0}")]
    InvalidBox(String),
    #[error("pixel value {0} is not a byte")]
    PixelRange(f64),
    #[error("unsupported image depth {0}, expected 1, 3 or 4")]
    UnsupportedDepth(usize),
    #[error("no such file or directory: {0:?}")]
    ModelNotFound(PathBuf),
    #[error("model directory {dir:?}: {reason}")]
    ModelFile { dir: PathBuf, reason: String },
    #[error("{0} is not initialized, call init() first")]
    NotInitialized(&'static str),
    #[error("should be a square image because it will be resized to 160x160 (got {width}x{height})")]
    NotSquare { width: u32, height: u32 },
    #[error("already had embedding!")]
    EmbeddingAlreadySet,
    #[error("no embedding yet!")]
    EmbeddingMissing,
    #[error("embedding dim is not 128! (got {0})")]
    EmbeddingDim(usize),
}
