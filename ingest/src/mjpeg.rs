use bytes::{Bytes, BytesMut};
use camrelay_common::frame::FrameError;
use futures_util::{stream, Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, info};

use crate::connector::FrameStream;
use crate::SourceError;

/// Boundary assumed when the upstream does not declare one.
pub const DEFAULT_BOUNDARY: &str = "frame";

const HEADER_END: &[u8] = b"\r\n\r\n";
const MAX_HEADER_BYTES: usize = 16 * 1024;

/// Parse state for the MJPEG multipart stream.
enum ParseState {
    /// Looking for the boundary delimiter `--<boundary>`.
    SeekingBoundary,
    /// Found the delimiter, now looking for end of part headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next delimiter.
    CollectingJpeg,
}

/// Incremental splitter for `multipart/x-mixed-replace` bodies.
///
/// Bytes arrive in arbitrary chunks through [`MjpegParser::push`]; complete
/// parts come out of [`MjpegParser::next_frame`]. The parser only frames
/// parts; it does not check that they are valid JPEGs.
pub struct MjpegParser {
    delimiter: Vec<u8>,
    buffer: BytesMut,
    state: ParseState,
    /// Where to resume the delimiter scan inside the current part.
    jpeg_scan_from: usize,
    max_frame_bytes: usize,
}

impl MjpegParser {
    pub fn new(boundary: &str, max_frame_bytes: usize) -> Self {
        let mut delimiter = b"--".to_vec();
        delimiter.extend_from_slice(boundary.trim_start_matches('-').as_bytes());
        Self {
            delimiter,
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            jpeg_scan_from: 0,
            max_frame_bytes,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete part, if the buffered bytes contain one.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, SourceError> {
        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, &self.delimiter) {
                        let _ = self.buffer.split_to(pos + self.delimiter.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep the tail in case the delimiter spans chunks
                        let keep = self.delimiter.len();
                        if self.buffer.len() > keep {
                            let _ = self.buffer.split_to(self.buffer.len() - keep);
                        }
                        return Ok(None);
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let _ = self.buffer.split_to(pos + HEADER_END.len());
                        self.jpeg_scan_from = 0;
                        self.state = ParseState::CollectingJpeg;
                    } else if self.buffer.len() > MAX_HEADER_BYTES {
                        debug!(bytes = self.buffer.len(), "part headers too long, resyncing");
                        self.state = ParseState::SeekingBoundary;
                    } else {
                        return Ok(None);
                    }
                }
                ParseState::CollectingJpeg => {
                    let scan = &self.buffer[self.jpeg_scan_from..];
                    if let Some(pos) = find_subsequence(scan, &self.delimiter) {
                        let part_end = self.jpeg_scan_from + pos;
                        let mut part = self.buffer.split_to(part_end).freeze();
                        let _ = self.buffer.split_to(self.delimiter.len());
                        self.state = ParseState::SeekingHeaderEnd;

                        let trimmed = trim_part_tail(&part);
                        part.truncate(trimmed);
                        if part.is_empty() {
                            continue;
                        }
                        return Ok(Some(part));
                    }

                    if self.buffer.len() > self.max_frame_bytes {
                        let got = self.buffer.len();
                        self.buffer.clear();
                        self.state = ParseState::SeekingBoundary;
                        return Err(FrameError::TooLarge {
                            got,
                            max: self.max_frame_bytes,
                        }
                        .into());
                    }

                    self.jpeg_scan_from = self.buffer.len().saturating_sub(self.delimiter.len());
                    return Ok(None);
                }
            }
        }
    }
}

/// Length of `part` without the CRLF (and any stray dashes) that precede the
/// next delimiter.
fn trim_part_tail(part: &[u8]) -> usize {
    part.iter()
        .rposition(|b| !matches!(b, b'\r' | b'\n' | b'-'))
        .map_or(0, |pos| pos + 1)
}

/// Extract `boundary=` from a `multipart/x-mixed-replace` content type.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|param| {
            let (key, value) = param.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("boundary")
                .then(|| value.trim().trim_matches('"').to_string())
        })
        .filter(|b| !b.is_empty())
}

/// Turn a stream of raw body chunks into a stream of multipart parts.
pub fn frames_from_chunks<S>(chunks: S, parser: MjpegParser) -> FrameStream
where
    S: Stream<Item = Result<Bytes, SourceError>> + Send + 'static,
{
    let chunks = Box::pin(chunks);
    stream::unfold((chunks, parser), |(mut chunks, mut parser)| async move {
        loop {
            match parser.next_frame() {
                Ok(Some(frame)) => return Some((Ok(frame), (chunks, parser))),
                Err(e) => return Some((Err(e), (chunks, parser))),
                Ok(None) => {}
            }
            match chunks.next().await {
                Some(Ok(chunk)) => parser.push(&chunk),
                Some(Err(e)) => return Some((Err(e), (chunks, parser))),
                None => return None,
            }
        }
    })
    .boxed()
}

/// Open an MJPEG-over-HTTP stream.
pub async fn connect(
    client: &reqwest::Client,
    url: &str,
    max_frame_bytes: usize,
) -> Result<FrameStream, SourceError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(SourceError::HttpConnect)?;

    if !response.status().is_success() {
        return Err(SourceError::HttpStatus(response.status().as_u16()));
    }

    let boundary = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(boundary_from_content_type)
        .unwrap_or_else(|| DEFAULT_BOUNDARY.to_string());

    info!(status = %response.status(), boundary, "connected to MJPEG stream");

    let chunks = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(SourceError::HttpStream));
    Ok(frames_from_chunks(
        chunks,
        MjpegParser::new(&boundary, max_frame_bytes),
    ))
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const JPEG_A: &[u8] = &[0xFF, 0xD8, 0xAA, 0xFF, 0xD9];
    const JPEG_B: &[u8] = &[0xFF, 0xD8, 0xBB, 0xBB, 0xFF, 0xD9];

    fn part(boundary: &str, jpeg: &[u8]) -> Vec<u8> {
        let mut out = format!("--{boundary}\r\nContent-Type: image/jpeg\r\n\r\n").into_bytes();
        out.extend_from_slice(jpeg);
        out.extend_from_slice(b"\r\n");
        out
    }

    fn drain(parser: &mut MjpegParser) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(frame) = parser.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn emits_part_once_next_delimiter_arrives() {
        let mut parser = MjpegParser::new("frame", 1024);
        parser.push(&part("frame", JPEG_A));
        assert!(drain(&mut parser).is_empty());

        parser.push(&part("frame", JPEG_B));
        assert_eq!(drain(&mut parser), vec![Bytes::from_static(JPEG_A)]);
    }

    #[test]
    fn handles_byte_at_a_time_delivery() {
        let mut body = part("frame", JPEG_A);
        body.extend(part("frame", JPEG_B));
        body.extend(part("frame", JPEG_A));

        let mut parser = MjpegParser::new("frame", 1024);
        let mut frames = Vec::new();
        for byte in body {
            parser.push(&[byte]);
            frames.extend(drain(&mut parser));
        }
        assert_eq!(
            frames,
            vec![Bytes::from_static(JPEG_A), Bytes::from_static(JPEG_B)]
        );
    }

    #[test]
    fn parses_ffmpeg_mpjpeg_headers() {
        let mut body = Vec::new();
        for jpeg in [JPEG_A, JPEG_B, JPEG_A] {
            body.extend(
                format!(
                    "--frame\r\nContent-type: image/jpeg\r\nContent-length: {}\r\n\r\n",
                    jpeg.len()
                )
                .into_bytes(),
            );
            body.extend_from_slice(jpeg);
            body.extend_from_slice(b"\r\n");
        }
        let mut parser = MjpegParser::new("frame", 1024);
        parser.push(&body);
        assert_eq!(drain(&mut parser).len(), 2);
    }

    #[test]
    fn tolerates_dashed_boundary_declaration() {
        // Some cameras declare `boundary=--myboundary` and then write `----myboundary`.
        let mut parser = MjpegParser::new("--myboundary", 1024);
        parser.push(&part("--myboundary", JPEG_A));
        parser.push(&part("--myboundary", JPEG_B));
        assert_eq!(drain(&mut parser), vec![Bytes::from_static(JPEG_A)]);
    }

    #[test]
    fn skips_leading_garbage() {
        let mut body = b"HTTP preamble noise".to_vec();
        body.extend(part("frame", JPEG_A));
        body.extend(part("frame", JPEG_B));
        let mut parser = MjpegParser::new("frame", 1024);
        parser.push(&body);
        assert_eq!(drain(&mut parser), vec![Bytes::from_static(JPEG_A)]);
    }

    #[test]
    fn oversized_part_is_an_error_then_resyncs() {
        let mut parser = MjpegParser::new("frame", 64);
        parser.push(b"--frame\r\n\r\n");
        parser.push(&[0xAB; 128]);
        assert!(matches!(
            parser.next_frame(),
            Err(SourceError::Decode(FrameError::TooLarge { .. }))
        ));

        parser.push(&part("frame", JPEG_A));
        parser.push(&part("frame", JPEG_B));
        assert_eq!(drain(&mut parser), vec![Bytes::from_static(JPEG_A)]);
    }

    #[test]
    fn boundary_from_header() {
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace; boundary=frame").as_deref(),
            Some("frame")
        );
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace;boundary=\"abc123\"").as_deref(),
            Some("abc123")
        );
        assert_eq!(boundary_from_content_type("image/jpeg"), None);
        assert_eq!(boundary_from_content_type("multipart/x-mixed-replace; boundary="), None);
    }

    #[tokio::test]
    async fn chunk_stream_yields_frames_then_ends() {
        let mut body = part("frame", JPEG_A);
        body.extend(part("frame", JPEG_B));
        body.extend(b"--frame\r\n".to_vec());
        let chunks: Vec<Result<Bytes, SourceError>> = body
            .chunks(3)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        let frames: Vec<_> = frames_from_chunks(stream::iter(chunks), MjpegParser::new("frame", 1024))
            .collect()
            .await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref().unwrap(), &Bytes::from_static(JPEG_A));
        assert_eq!(frames[1].as_ref().unwrap(), &Bytes::from_static(JPEG_B));
    }
}
