use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Sequence value meaning "nothing delivered yet". Real frames start at 1.
pub const NO_SEQUENCE: u64 = 0;

/// The latest frame held by one cache slot.
///
/// Snapshots are shared behind an `Arc` and never mutated once published;
/// `payload` is a reference-counted immutable buffer, so handing one to any
/// number of viewers costs a pointer copy.
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    /// A complete JPEG image (SOI through EOI).
    pub payload: Bytes,
    /// Per-slot counter, incremented on every publish.
    pub sequence: u64,
    /// Wall-clock capture time, for status reporting.
    pub captured_at: DateTime<Utc>,
    /// Monotonic capture time, for staleness checks.
    pub received_at: Instant,
}

impl FrameSnapshot {
    pub fn new(payload: Bytes, sequence: u64) -> Self {
        Self {
            payload,
            sequence,
            captured_at: Utc::now(),
            received_at: Instant::now(),
        }
    }

    /// Time since this frame was captured.
    pub fn age(&self) -> Duration {
        self.received_at.elapsed()
    }

    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.age() > threshold
    }
}

/// Check that `data` is a complete JPEG and return it without trailing
/// padding (some encoders append CR/LF or spaces after EOI).
pub fn validate_jpeg(data: Bytes, max_bytes: usize) -> Result<Bytes, FrameError> {
    if data.is_empty() {
        return Err(FrameError::Empty);
    }
    if data.len() > max_bytes {
        return Err(FrameError::TooLarge {
            got: data.len(),
            max: max_bytes,
        });
    }
    if !data.starts_with(&JPEG_SOI) {
        return Err(FrameError::NotJpeg);
    }

    let end = data
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|pos| pos + 1)
        .unwrap_or(0);
    if end < JPEG_SOI.len() + JPEG_EOI.len() || data[end - 2..end] != JPEG_EOI {
        return Err(FrameError::Truncated { got: data.len() });
    }

    Ok(data.slice(..end))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("frame does not start with a JPEG SOI marker")]
    NotJpeg,
    #[error("JPEG frame truncated: {got} bytes without EOI marker")]
    Truncated { got: usize },
    #[error("frame too large: {got} bytes exceeds limit of {max}")]
    TooLarge { got: usize, max: usize },
}
