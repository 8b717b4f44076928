use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::frame::FrameSnapshot;

type SlotValue = Option<Arc<FrameSnapshot>>;

struct Slot {
    tx: watch::Sender<SlotValue>,
    writer_claimed: AtomicBool,
}

impl Slot {
    fn replace(&self, index: usize, payload: Bytes) -> u64 {
        let mut sequence = 0;
        self.tx.send_modify(|current| {
            sequence = current.as_ref().map_or(0, |s| s.sequence) + 1;
            *current = Some(Arc::new(FrameSnapshot::new(payload, sequence)));
        });
        debug!(camera = index, sequence, "frame published");
        sequence
    }
}

/// Latest-frame store keyed by camera index.
///
/// Each slot is a `watch` channel holding the most recent snapshot. Publishing
/// swaps the `Arc` under the channel lock and wakes every waiter; readers only
/// clone the `Arc` out, so the writer is never held up by a slow viewer and a
/// reader can never see a half-written slot.
pub struct FrameCache {
    slots: Vec<Slot>,
}

/// Outcome of waiting for a frame newer than some sequence.
#[derive(Debug, Clone)]
pub enum NextFrame {
    /// A frame with a sequence above the one asked for.
    Frame(Arc<FrameSnapshot>),
    /// Nothing newer arrived in time. Carries whatever the slot holds now.
    TimedOut(Option<Arc<FrameSnapshot>>),
    /// The cache was dropped.
    Closed,
}

impl FrameCache {
    pub fn new(len: usize) -> Self {
        let slots = (0..len)
            .map(|_| {
                let (tx, _rx) = watch::channel(None);
                Slot {
                    tx,
                    writer_claimed: AtomicBool::new(false),
                }
            })
            .collect();
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, index: usize) -> Result<&Slot, CacheError> {
        self.slots.get(index).ok_or(CacheError::UnknownCamera {
            index,
            len: self.slots.len(),
        })
    }

    /// Replace the slot's frame and bump its sequence. Returns the new sequence.
    pub fn publish(&self, index: usize, payload: Bytes) -> Result<u64, CacheError> {
        Ok(self.slot(index)?.replace(index, payload))
    }

    /// Current snapshot, or `None` if no frame has been captured (or the index
    /// is out of range).
    pub fn read(&self, index: usize) -> Option<Arc<FrameSnapshot>> {
        self.slots.get(index)?.tx.borrow().clone()
    }

    /// Register a long-lived waiter on one slot. Dropping the watcher releases
    /// the registration.
    pub fn subscribe(&self, index: usize) -> Result<SlotWatcher, CacheError> {
        let slot = self.slot(index)?;
        Ok(SlotWatcher {
            index,
            rx: slot.tx.subscribe(),
        })
    }

    /// One-shot form of [`SlotWatcher::await_next`].
    pub async fn await_next(
        &self,
        index: usize,
        since: u64,
        timeout: Duration,
    ) -> Result<NextFrame, CacheError> {
        let mut watcher = self.subscribe(index)?;
        Ok(watcher.await_next(since, timeout).await)
    }

    /// Claim the single writer handle for a slot.
    pub fn writer(self: &Arc<Self>, index: usize) -> Result<SlotWriter, CacheError> {
        let slot = self.slot(index)?;
        if slot.writer_claimed.swap(true, Ordering::AcqRel) {
            return Err(CacheError::WriterTaken(index));
        }
        Ok(SlotWriter {
            cache: Arc::clone(self),
            index,
        })
    }

    /// Live watcher registrations on a slot.
    pub fn watcher_count(&self, index: usize) -> usize {
        self.slots
            .get(index)
            .map_or(0, |slot| slot.tx.receiver_count())
    }
}

/// Exclusive publishing handle for one slot. Only one exists per index.
pub struct SlotWriter {
    cache: Arc<FrameCache>,
    index: usize,
}

impl SlotWriter {
    pub fn publish(&self, payload: Bytes) -> u64 {
        // Claimed indexes are always in range; slots are never removed.
        self.cache.slots[self.index].replace(self.index, payload)
    }
}

impl Drop for SlotWriter {
    fn drop(&mut self) {
        if let Some(slot) = self.cache.slots.get(self.index) {
            slot.writer_claimed.store(false, Ordering::Release);
        }
    }
}

/// A registration on one slot, used by viewers to wait for new frames.
pub struct SlotWatcher {
    index: usize,
    rx: watch::Receiver<SlotValue>,
}

impl SlotWatcher {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn latest(&self) -> Option<Arc<FrameSnapshot>> {
        self.rx.borrow().clone()
    }

    /// Return the slot's frame as soon as its sequence exceeds `since`.
    ///
    /// Returns immediately when the current frame already qualifies, otherwise
    /// waits for publishes until `timeout` elapses.
    pub async fn await_next(&mut self, since: u64, timeout: Duration) -> NextFrame {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(snapshot) = self.newer_than(since) {
                return NextFrame::Frame(snapshot);
            }
            match tokio::time::timeout_at(deadline, self.rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return NextFrame::Closed,
                Err(_) => return NextFrame::TimedOut(self.latest()),
            }
        }
    }

    fn newer_than(&mut self, since: u64) -> Option<Arc<FrameSnapshot>> {
        let current = self.rx.borrow_and_update();
        current
            .as_ref()
            .filter(|snapshot| snapshot.sequence > since)
            .cloned()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("camera index {index} out of range (configured cameras: {len})")]
    UnknownCamera { index: usize, len: usize },
    #[error("camera {0} already has a writer")]
    WriterTaken(usize),
}
