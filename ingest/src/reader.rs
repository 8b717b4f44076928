use camrelay_common::cache::SlotWriter;
use camrelay_common::camera::{CameraSource, ReaderState};
use camrelay_common::config::{ReconnectConfig, StreamConfig};
use camrelay_common::frame::validate_jpeg;
use chrono::Utc;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::connector::{FrameStream, SourceConnector};
use crate::SourceError;

/// Timing and size limits for one reader.
#[derive(Debug, Clone)]
pub struct ReaderSettings {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Longest gap between frames before the connection is considered dead.
    pub read_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl ReaderSettings {
    pub fn from_config(reconnect: &ReconnectConfig, stream: &StreamConfig) -> Self {
        Self {
            initial_backoff: reconnect.initial_backoff(),
            max_backoff: reconnect.max_backoff(),
            read_timeout: reconnect.read_timeout(),
            max_frame_bytes: stream.max_frame_bytes,
        }
    }
}

/// Keeps one camera's cache slot fresh.
///
/// Runs Connecting → Streaming → Failed → Connecting ... until cancelled.
/// Every error stays inside the reader and only shows up as the published
/// [`ReaderState`].
pub struct SourceReader {
    source: CameraSource,
    connector: Arc<dyn SourceConnector>,
    writer: SlotWriter,
    state: watch::Sender<ReaderState>,
    backoff: Backoff,
    settings: ReaderSettings,
    cancel: CancellationToken,
}

impl SourceReader {
    pub fn new(
        source: CameraSource,
        connector: Arc<dyn SourceConnector>,
        writer: SlotWriter,
        settings: ReaderSettings,
        cancel: CancellationToken,
    ) -> (Self, watch::Receiver<ReaderState>) {
        let (state, rx) = watch::channel(ReaderState::Connecting);
        let reader = Self {
            backoff: Backoff::new(settings.initial_backoff, settings.max_backoff),
            source,
            connector,
            writer,
            state,
            settings,
            cancel,
        };
        (reader, rx)
    }

    pub async fn run(mut self) {
        let camera = self.source.index;
        let cancel = self.cancel.clone();
        info!(camera, "source reader started");

        loop {
            self.transition(ReaderState::Connecting);

            let error = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                error = self.connect_and_stream() => error,
            };

            let delay = self.backoff.next_delay();
            warn!(
                camera,
                error = %error,
                kind = ?error.kind(),
                "source failed, reconnecting in {:?}",
                delay
            );
            let retry_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            self.transition(ReaderState::Failed {
                reason: error.to_string(),
                retry_at,
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(camera, "source reader stopped");
    }

    /// Connect and publish frames until something goes wrong. Always returns
    /// the reason the connection is no longer usable.
    async fn connect_and_stream(&mut self) -> SourceError {
        let frames = match self.connector.connect(&self.source).await {
            Ok(frames) => frames,
            Err(e) => return e,
        };
        self.pump(frames).await
    }

    async fn pump(&mut self, mut frames: FrameStream) -> SourceError {
        loop {
            let next = tokio::time::timeout(self.settings.read_timeout, frames.next()).await;
            let frame = match next {
                Err(_) => return SourceError::ReadTimeout(self.settings.read_timeout),
                Ok(None) => return SourceError::Ended,
                Ok(Some(Err(e))) => return e,
                Ok(Some(Ok(frame))) => frame,
            };

            let frame = match validate_jpeg(frame, self.settings.max_frame_bytes) {
                Ok(frame) => frame,
                Err(e) => return e.into(),
            };

            let bytes = frame.len();
            let sequence = self.writer.publish(frame);
            debug!(camera = self.source.index, sequence, bytes, "frame captured");

            if *self.state.borrow() != ReaderState::Streaming {
                self.backoff.reset();
                self.transition(ReaderState::Streaming);
            }
        }
    }

    fn transition(&self, next: ReaderState) {
        let label = next.label();
        let previous = self.state.send_replace(next);
        if previous.label() != label {
            info!(
                camera = self.source.index,
                from = previous.label(),
                to = label,
                "reader state changed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{jpeg, Attempt, ScriptedConnector, Tail};
    use bytes::Bytes;
    use camrelay_common::cache::{FrameCache, NextFrame};
    use tokio::task::JoinHandle;

    fn settings() -> ReaderSettings {
        ReaderSettings {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(4),
            read_timeout: Duration::from_secs(15),
            max_frame_bytes: 1024,
        }
    }

    struct Harness {
        connector: Arc<ScriptedConnector>,
        cache: Arc<FrameCache>,
        state: watch::Receiver<ReaderState>,
        cancel: CancellationToken,
        handle: JoinHandle<()>,
    }

    fn start(script: Vec<Attempt>) -> Harness {
        let connector = Arc::new(ScriptedConnector::new().with_script(0, script));
        let cache = Arc::new(FrameCache::new(1));
        let cancel = CancellationToken::new();
        let (reader, state) = SourceReader::new(
            CameraSource::new(0, "rtsp://cam-a/live"),
            connector.clone(),
            cache.writer(0).unwrap(),
            settings(),
            cancel.clone(),
        );
        let handle = tokio::spawn(reader.run());
        Harness {
            connector,
            cache,
            state,
            cancel,
            handle,
        }
    }

    fn gaps(times: &[tokio::time::Instant]) -> Vec<Duration> {
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn backs_off_between_refused_connects_then_streams() {
        let mut h = start(vec![
            Attempt::refuse(),
            Attempt::refuse(),
            Attempt::refuse(),
            Attempt::frames(vec![jpeg(1)]),
        ]);

        h.state
            .wait_for(|s| *s == ReaderState::Streaming)
            .await
            .unwrap();

        let gaps = gaps(&h.connector.attempt_times(0));
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert!(gaps.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(h.cache.read(0).unwrap().sequence, 1);

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn delay_is_capped() {
        let mut h = start(vec![
            Attempt::refuse(),
            Attempt::refuse(),
            Attempt::refuse(),
            Attempt::refuse(),
            Attempt::refuse(),
            Attempt::frames(vec![jpeg(1)]),
        ]);

        h.state
            .wait_for(|s| *s == ReaderState::Streaming)
            .await
            .unwrap();

        let gaps = gaps(&h.connector.attempt_times(0));
        let secs: Vec<u64> = gaps.iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![1, 2, 4, 4, 4]);

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_resets_backoff() {
        let h = start(vec![
            Attempt::refuse(),
            Attempt::refuse(),
            Attempt::paced(vec![jpeg(1)], Duration::ZERO, Tail::End),
            Attempt::frames(vec![jpeg(2)]),
        ]);

        // The second frame only arrives after the upstream closed once.
        let mut watcher = h.cache.subscribe(0).unwrap();
        match watcher.await_next(1, Duration::from_secs(60)).await {
            NextFrame::Frame(s) => assert_eq!(s.payload, jpeg(2)),
            other => panic!("expected second frame, got {other:?}"),
        }

        let secs: Vec<u64> = gaps(&h.connector.attempt_times(0))
            .iter()
            .map(Duration::as_secs)
            .collect();
        assert_eq!(secs, vec![1, 2, 1]);
        assert_eq!(h.cache.read(0).unwrap().sequence, 2);

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn decode_failure_fails_and_retries() {
        let mut h = start(vec![
            Attempt::frames(vec![Bytes::from_static(b"not a jpeg")]),
            Attempt::frames(vec![jpeg(7)]),
        ]);

        let failed = h.state.wait_for(|s| s.is_failed()).await.unwrap().clone();
        match failed {
            ReaderState::Failed { reason, .. } => assert!(reason.contains("JPEG"), "{reason}"),
            other => panic!("unexpected state {other:?}"),
        }
        assert!(h.cache.read(0).is_none());

        h.state
            .wait_for(|s| *s == ReaderState::Streaming)
            .await
            .unwrap();
        let snapshot = h.cache.read(0).unwrap();
        assert_eq!(snapshot.sequence, 1);
        assert_eq!(snapshot.payload, jpeg(7));

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connection_times_out() {
        let mut h = start(vec![Attempt::frames(vec![jpeg(1)]), Attempt::frames(vec![jpeg(2)])]);

        h.state
            .wait_for(|s| *s == ReaderState::Streaming)
            .await
            .unwrap();
        let failed = h.state.wait_for(|s| s.is_failed()).await.unwrap().clone();
        match failed {
            ReaderState::Failed { reason, .. } => {
                assert!(reason.contains("no frame received"), "{reason}")
            }
            other => panic!("unexpected state {other:?}"),
        }

        h.state
            .wait_for(|s| *s == ReaderState::Streaming)
            .await
            .unwrap();
        assert_eq!(h.cache.read(0).unwrap().sequence, 2);

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_closes_upstream() {
        let mut h = start(vec![Attempt::frames(vec![jpeg(1)])]);

        h.state
            .wait_for(|s| *s == ReaderState::Streaming)
            .await
            .unwrap();
        assert_eq!(h.connector.open_streams(), 1);

        h.cancel.cancel();
        h.handle.await.unwrap();
        assert_eq!(h.connector.open_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_backoff_sleep() {
        let mut h = start(vec![]);

        h.state.wait_for(|s| s.is_failed()).await.unwrap();
        h.cancel.cancel();
        h.handle.await.unwrap();
        assert_eq!(h.connector.attempt_times(0).len(), 1);
    }
}
