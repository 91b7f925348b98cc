use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiffSingerError>;

/// Errors produced by the DiffSinger engine.
#[derive(Debug, Error)]
pub enum DiffSingerError {
    #[error("ONNX runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid format: {0}")]
    InvalidFormat(String),
    #[error("session error: {0}")]
    Session(String),
    /// Parsers collect every problem and report them in one go, so users see
    /// the full list instead of fixing one field per run.
    #[error("configuration errors:\n{}", .0.join("\n"))]
    Config(Vec<String>),
    #[error("feature not supported: {0}")]
    NotSupported(String),
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}
