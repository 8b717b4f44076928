pub mod backoff;
pub mod connector;
pub mod ffmpeg;
pub mod mjpeg;
pub mod reader;
pub mod supervisor;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

use camrelay_common::frame::FrameError;
use std::time::Duration;

pub use connector::{FrameStream, SourceConnector, UriConnector};
pub use reader::{ReaderSettings, SourceReader};
pub use supervisor::{HealthView, SourceSupervisor};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },
    #[error("failed to read source output: {0}")]
    Read(std::io::Error),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("no frame received within {0:?}")]
    ReadTimeout(Duration),
    #[error("source stream ended")]
    Ended,
    #[error("malformed frame: {0}")]
    Decode(#[from] FrameError),
}

/// Coarse classification used for logging and health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
    /// The source could not be reached or stopped delivering.
    Unavailable,
    /// The source delivered bytes that are not a usable frame.
    Decode,
}

impl SourceError {
    pub fn kind(&self) -> SourceErrorKind {
        match self {
            SourceError::Decode(_) => SourceErrorKind::Decode,
            _ => SourceErrorKind::Unavailable,
        }
    }
}
