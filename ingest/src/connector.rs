use async_trait::async_trait;
use bytes::Bytes;
use camrelay_common::camera::CameraSource;
use camrelay_common::config::FfmpegConfig;
use futures_util::stream::BoxStream;
use std::time::Duration;

use crate::{ffmpeg, mjpeg, SourceError};

/// Frames coming out of one upstream connection. Each item is one encoded
/// image; dropping the stream closes the connection.
pub type FrameStream = BoxStream<'static, Result<Bytes, SourceError>>;

/// Opens upstream connections for source readers.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn connect(&self, source: &CameraSource) -> Result<FrameStream, SourceError>;
}

/// Chooses a transport from the URI scheme: MJPEG over HTTP for `http(s)://`,
/// an ffmpeg child process for everything else (RTSP, RTMP, files, ...).
pub struct UriConnector {
    http: reqwest::Client,
    ffmpeg: FfmpegConfig,
    max_frame_bytes: usize,
}

impl UriConnector {
    pub fn new(
        ffmpeg: FfmpegConfig,
        connect_timeout: Duration,
        max_frame_bytes: usize,
    ) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(SourceError::HttpConnect)?;
        Ok(Self {
            http,
            ffmpeg,
            max_frame_bytes,
        })
    }
}

#[async_trait]
impl SourceConnector for UriConnector {
    async fn connect(&self, source: &CameraSource) -> Result<FrameStream, SourceError> {
        let uri = source.uri.trim();
        if is_http(uri) {
            mjpeg::connect(&self.http, uri, self.max_frame_bytes).await
        } else {
            ffmpeg::spawn(&self.ffmpeg, source.index, uri, self.max_frame_bytes)
        }
    }
}

fn is_http(uri: &str) -> bool {
    let lower = uri.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}
