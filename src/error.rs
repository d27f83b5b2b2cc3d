use std::io;

/// Errors produced by training, inference and model file handling.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad model file magic/version, or an unknown loss/model code on load.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// Caller misuse: `k < 1`, predicting or quantizing a non-supervised
    /// model, label id out of range, matrix too small to quantize.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// An internal index-bounds assumption was violated.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, Error>;
