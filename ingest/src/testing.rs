//! Scripted sources for exercising readers without network or ffmpeg.

use async_trait::async_trait;
use bytes::Bytes;
use camrelay_common::camera::CameraSource;
use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;

use crate::connector::{FrameStream, SourceConnector};
use crate::SourceError;

/// A minimal complete JPEG whose third byte is `tag`.
pub fn jpeg(tag: u8) -> Bytes {
    Bytes::from(vec![0xFF, 0xD8, tag, 0xFF, 0xD9])
}

/// What one connection attempt does.
#[derive(Debug, Clone)]
pub enum Attempt {
    /// Connect fails with this reason.
    Refuse(String),
    /// Deliver frames `interval` apart, then behave as `tail`.
    Frames {
        frames: Vec<Bytes>,
        interval: Duration,
        tail: Tail,
    },
}

#[derive(Debug, Clone)]
pub enum Tail {
    /// Stay connected without sending anything.
    Hang,
    /// Upstream closes the connection.
    End,
    /// Upstream read fails.
    Fail(String),
}

impl Attempt {
    pub fn refuse() -> Self {
        Attempt::Refuse("connection refused".into())
    }

    /// Frames back to back, then stay connected.
    pub fn frames(frames: Vec<Bytes>) -> Self {
        Attempt::Frames {
            frames,
            interval: Duration::ZERO,
            tail: Tail::Hang,
        }
    }

    pub fn paced(frames: Vec<Bytes>, interval: Duration, tail: Tail) -> Self {
        Attempt::Frames {
            frames,
            interval,
            tail,
        }
    }
}

/// Connector that plays back a per-camera script of attempts. Once a
/// camera's script runs out every further attempt is refused.
#[derive(Default)]
pub struct ScriptedConnector {
    scripts: Mutex<HashMap<usize, VecDeque<Attempt>>>,
    attempts: Mutex<HashMap<usize, Vec<Instant>>>,
    open_streams: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, camera: usize, script: Vec<Attempt>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(camera, script.into_iter().collect());
        self
    }

    /// When each connection attempt for `camera` happened.
    pub fn attempt_times(&self, camera: usize) -> Vec<Instant> {
        self.attempts
            .lock()
            .unwrap()
            .get(&camera)
            .cloned()
            .unwrap_or_default()
    }

    /// Streams handed out and not yet dropped, across all cameras.
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceConnector for ScriptedConnector {
    async fn connect(&self, source: &CameraSource) -> Result<FrameStream, SourceError> {
        self.attempts
            .lock()
            .unwrap()
            .entry(source.index)
            .or_default()
            .push(Instant::now());

        let attempt = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&source.index)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Attempt::Refuse("script exhausted".into()));

        match attempt {
            Attempt::Refuse(reason) => Err(SourceError::Connect(reason)),
            Attempt::Frames {
                frames,
                interval,
                tail,
            } => {
                self.open_streams.fetch_add(1, Ordering::SeqCst);
                Ok(Counted {
                    inner: build_stream(frames, interval, tail),
                    open: Arc::clone(&self.open_streams),
                }
                .boxed())
            }
        }
    }
}

fn build_stream(frames: Vec<Bytes>, interval: Duration, tail: Tail) -> FrameStream {
    let body = stream::iter(frames).then(move |frame| async move {
        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
        Ok(frame)
    });
    let tail: FrameStream = match tail {
        Tail::Hang => stream::pending().boxed(),
        Tail::End => stream::empty().boxed(),
        Tail::Fail(reason) => stream::once(async move { Err(SourceError::Connect(reason)) }).boxed(),
    };
    body.chain(tail).boxed()
}

/// Decrements the open-stream counter when dropped.
struct Counted {
    inner: BoxStream<'static, Result<Bytes, SourceError>>,
    open: Arc<AtomicUsize>,
}

impl Stream for Counted {
    type Item = Result<Bytes, SourceError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

impl Drop for Counted {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}
