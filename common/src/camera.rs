use chrono::{DateTime, Utc};
use serde::Serialize;

/// One configured upstream camera. Immutable after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSource {
    pub index: usize,
    pub uri: String,
}

impl CameraSource {
    pub fn new(index: usize, uri: impl Into<String>) -> Self {
        Self {
            index,
            uri: uri.into(),
        }
    }

    /// An empty URI marks a slot that is never started.
    pub fn is_disabled(&self) -> bool {
        self.uri.trim().is_empty()
    }
}

/// Lifecycle of a single source reader, as seen by the status surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReaderState {
    /// Empty URI. Terminal.
    Disabled,
    Connecting,
    Streaming,
    Failed {
        reason: String,
        retry_at: DateTime<Utc>,
    },
}

impl ReaderState {
    pub fn label(&self) -> &'static str {
        match self {
            ReaderState::Disabled => "disabled",
            ReaderState::Connecting => "connecting",
            ReaderState::Streaming => "streaming",
            ReaderState::Failed { .. } => "failed",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ReaderState::Failed { .. })
    }
}
