//! Frame capture collaborator.
//!
//! The streaming core never touches camera hardware; it asks a `FrameSource`
//! for one JPEG frame per capture tick.

use async_trait::async_trait;
use thiserror::Error;

pub mod directory;

pub use directory::DirectoryFrameSource;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Capture source unavailable: {0}")]
    Unavailable(String),

    #[error("Captured frame is empty")]
    Empty,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Capture task panicked")]
    Panicked,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One JPEG frame with its pixel dimensions
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl CapturedFrame {
    pub fn new(jpeg: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            jpeg,
            width,
            height,
        }
    }
}

/// Provider of frames on demand. May fail; a failure only skips one tick.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn capture(&self) -> Result<CapturedFrame, CaptureError>;
}
