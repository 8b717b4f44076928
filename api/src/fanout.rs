use bytes::{Bytes, BytesMut};
use camrelay_common::cache::{NextFrame, SlotWatcher};
use camrelay_common::config::StreamConfig;
use camrelay_common::frame::NO_SEQUENCE;
use futures_util::{stream, Stream};
use std::convert::Infallible;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Multipart boundary used on every outgoing stream.
pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

/// Wrap one JPEG as a multipart part, trailing CRLF included.
pub fn encode_part(jpeg: &[u8]) -> Bytes {
    let mut part = BytesMut::with_capacity(PART_HEADER.len() + jpeg.len() + 2);
    part.extend_from_slice(PART_HEADER);
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part.freeze()
}

#[derive(Debug, Clone)]
pub struct FanoutSettings {
    /// Placeholder cadence while a camera has nothing to show.
    pub idle_interval: Duration,
    /// How long a live stream waits for a new frame before re-sending one.
    pub frame_timeout: Duration,
    /// Frames older than this are replaced by the placeholder.
    pub stale_after: Duration,
}

impl FanoutSettings {
    pub fn from_config(stream: &StreamConfig) -> Self {
        Self {
            idle_interval: stream.idle_interval(),
            frame_timeout: stream.frame_timeout(),
            stale_after: stream.stale_after(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Starting,
    Live,
    Placeholder,
}

/// One viewer of one camera.
///
/// Produces multipart chunks until the slot closes or shutdown is
/// requested. Dropping the session releases its cache registration.
pub struct ClientSession {
    watcher: SlotWatcher,
    last_seen: u64,
    mode: Mode,
    placeholder_part: Bytes,
    settings: FanoutSettings,
    shutdown: CancellationToken,
    frames_sent: u64,
}

impl ClientSession {
    /// `placeholder_part` must already be wrapped with [`encode_part`].
    pub fn new(
        watcher: SlotWatcher,
        placeholder_part: Bytes,
        settings: FanoutSettings,
        shutdown: CancellationToken,
    ) -> Self {
        debug!(camera = watcher.index(), "client connected");
        Self {
            watcher,
            last_seen: NO_SEQUENCE,
            mode: Mode::Starting,
            placeholder_part,
            settings,
            shutdown,
            frames_sent: 0,
        }
    }

    pub fn camera(&self) -> usize {
        self.watcher.index()
    }

    /// Next chunk to write, or `None` when the stream is over.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        if self.mode == Mode::Starting {
            match self.watcher.latest() {
                None => return Some(self.enter_placeholder()),
                Some(snapshot) if snapshot.is_stale(self.settings.stale_after) => {
                    self.last_seen = snapshot.sequence;
                    return Some(self.enter_placeholder());
                }
                Some(_) => self.mode = Mode::Live,
            }
        }

        let timeout = match self.mode {
            Mode::Placeholder => self.settings.idle_interval,
            _ => self.settings.frame_timeout,
        };

        let next = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return None,
            next = self.watcher.await_next(self.last_seen, timeout) => next,
        };

        match next {
            NextFrame::Frame(snapshot) => {
                self.last_seen = snapshot.sequence;
                self.mode = Mode::Live;
                self.frames_sent += 1;
                Some(encode_part(&snapshot.payload))
            }
            NextFrame::TimedOut(Some(snapshot))
                if !snapshot.is_stale(self.settings.stale_after) =>
            {
                // Connected but frozen source: repeat the frame to keep the
                // client's connection busy.
                self.mode = Mode::Live;
                Some(encode_part(&snapshot.payload))
            }
            NextFrame::TimedOut(_) => Some(self.enter_placeholder()),
            NextFrame::Closed => None,
        }
    }

    fn enter_placeholder(&mut self) -> Bytes {
        if self.mode != Mode::Placeholder {
            debug!(camera = self.camera(), "no live frame, sending placeholder");
            self.mode = Mode::Placeholder;
        }
        self.placeholder_part.clone()
    }

    /// The session as a response body stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        stream::unfold(self, |mut session| async move {
            let chunk = session.next_chunk().await?;
            Some((Ok(chunk), session))
        })
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        debug!(
            camera = self.camera(),
            frames = self.frames_sent,
            "client disconnected"
        );
    }
}
