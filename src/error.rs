//! Crate-wide error type and `Result` alias.
//!
//! One `thiserror` enum plus a crate-local `Result`, in the teacher's
//! `layer234/error.rs` style.

use thiserror::Error;

/// Errors surfaced across the streamcap pipeline.
#[derive(Debug, Error)]
pub enum StreamcapError {
    #[error("sink error: {0}")]
    Sink(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StreamcapError>;
