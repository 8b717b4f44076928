use bytes::Bytes;
use camrelay_common::config::FfmpegConfig;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::connector::FrameStream;
use crate::mjpeg::{frames_from_chunks, MjpegParser};
use crate::SourceError;

/// Boundary ffmpeg's `mpjpeg` muxer is told to write.
const FFMPEG_BOUNDARY: &str = "frame";

/// Build the ffmpeg command line that decodes `uri` and writes JPEG frames as
/// multipart to stdout.
pub fn ffmpeg_args(config: &FfmpegConfig, uri: &str) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
        .into_iter()
        .map(String::from)
        .collect();

    let lower = uri.to_ascii_lowercase();
    if lower.starts_with("rtsp://") || lower.starts_with("rtsps://") {
        args.push("-rtsp_transport".into());
        args.push(config.rtsp_transport.clone());
    }

    args.push("-i".into());
    args.push(uri.to_string());
    args.push("-an".into());

    if let Some(fps) = config.fps {
        args.push("-r".into());
        args.push(fps.to_string());
    }

    let quality = config.quality.to_string();
    args.extend(
        [
            "-c:v",
            "mjpeg",
            "-q:v",
            quality.as_str(),
            "-f",
            "mpjpeg",
            "-boundary_tag",
            FFMPEG_BOUNDARY,
            "pipe:1",
        ]
        .into_iter()
        .map(String::from),
    );
    args
}

/// Spawn ffmpeg for one camera. The child is killed when the returned stream
/// is dropped.
pub fn spawn(
    config: &FfmpegConfig,
    camera: usize,
    uri: &str,
    max_frame_bytes: usize,
) -> Result<FrameStream, SourceError> {
    let mut cmd = Command::new(&config.binary);
    cmd.args(ffmpeg_args(config, uri))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| SourceError::Spawn {
        binary: config.binary.clone(),
        source,
    })?;

    let stdout = child.stdout.take().ok_or_else(|| SourceError::Spawn {
        binary: config.binary.clone(),
        source: std::io::Error::other("could not get stdout handle"),
    })?;

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(camera, line, "ffmpeg");
            }
        });
    }

    info!(camera, pid = child.id(), "ffmpeg source started");

    let output = ChildOutput {
        camera,
        child,
        stdout: ReaderStream::new(stdout),
    };
    let chunks = output.map(|chunk| chunk.map_err(SourceError::Read));
    Ok(frames_from_chunks(
        chunks,
        MjpegParser::new(FFMPEG_BOUNDARY, max_frame_bytes),
    ))
}

/// ffmpeg's stdout, owning the child so the process lives exactly as long as
/// the stream.
struct ChildOutput {
    camera: usize,
    child: Child,
    stdout: ReaderStream<ChildStdout>,
}

impl Stream for ChildOutput {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.stdout).poll_next(cx);
        if let Poll::Ready(None) = polled {
            match this.child.try_wait() {
                Ok(Some(status)) => warn!(camera = this.camera, %status, "ffmpeg exited"),
                Ok(None) => debug!(camera = this.camera, "ffmpeg closed stdout"),
                Err(e) => warn!(camera = this.camera, error = %e, "failed to query ffmpeg status"),
            }
        }
        polled
    }
}
