use camrelay_common::cache::{CacheError, FrameCache};
use camrelay_common::camera::{CameraSource, ReaderState};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::connector::SourceConnector;
use crate::reader::{ReaderSettings, SourceReader};

/// Owns every source reader task.
///
/// Readers restart themselves after failures; the supervisor only starts
/// them, reports their health, and stops them on shutdown.
pub struct SourceSupervisor {
    health: HealthView,
    tasks: JoinSet<()>,
    cancel: CancellationToken,
}

/// Read-only, cloneable view of reader health for the status surface.
#[derive(Clone)]
pub struct HealthView {
    cache: Arc<FrameCache>,
    states: Arc<Vec<watch::Receiver<ReaderState>>>,
}

impl HealthView {
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn status(&self, index: usize) -> Option<ReaderState> {
        self.states.get(index).map(|rx| rx.borrow().clone())
    }

    /// Capture time of the camera's latest frame.
    pub fn latest_timestamp(&self, index: usize) -> Option<DateTime<Utc>> {
        self.cache.read(index).map(|snapshot| snapshot.captured_at)
    }
}

impl SourceSupervisor {
    /// Start one reader per enabled camera. `sources` must cover indexes
    /// `0..cache.len()`.
    pub fn start(
        mut sources: Vec<CameraSource>,
        connector: Arc<dyn SourceConnector>,
        cache: Arc<FrameCache>,
        settings: ReaderSettings,
        cancel: CancellationToken,
    ) -> Result<Self, CacheError> {
        sources.sort_by_key(|source| source.index);

        let mut tasks = JoinSet::new();
        let mut states = Vec::with_capacity(sources.len());

        for source in sources {
            if source.is_disabled() {
                info!(camera = source.index, "camera disabled (empty URI)");
                let (_tx, rx) = watch::channel(ReaderState::Disabled);
                states.push(rx);
                continue;
            }

            let writer = cache.writer(source.index)?;
            let (reader, rx) = SourceReader::new(
                source,
                Arc::clone(&connector),
                writer,
                settings.clone(),
                cancel.child_token(),
            );
            tasks.spawn(reader.run());
            states.push(rx);
        }

        info!(
            cameras = states.len(),
            readers = tasks.len(),
            "source supervisor started"
        );

        Ok(Self {
            health: HealthView {
                cache,
                states: Arc::new(states),
            },
            tasks,
            cancel,
        })
    }

    pub fn health(&self) -> HealthView {
        self.health.clone()
    }

    pub fn status(&self, index: usize) -> Option<ReaderState> {
        self.health.status(index)
    }

    pub fn latest_timestamp(&self, index: usize) -> Option<DateTime<Utc>> {
        self.health.latest_timestamp(index)
    }

    pub fn reader_count(&self) -> usize {
        self.tasks.len()
    }

    /// Cancel every reader and wait up to `grace` for them to close their
    /// connections. Stragglers are aborted.
    pub async fn shutdown(mut self, grace: Duration) {
        self.cancel.cancel();
        info!(readers = self.tasks.len(), "stopping source readers");

        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = self.tasks.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() {
                        error!(error = %e, "source reader panicked");
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = self.tasks.len(),
                "source readers did not stop within {:?}, aborting", grace
            );
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }

        info!("source readers stopped");
    }
}
