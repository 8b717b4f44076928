use bytes::Bytes;
use camrelay_common::frame::validate_jpeg;
use image::{DynamicImage, ImageFormat, RgbImage};
use std::io::Cursor;
use std::path::Path;
use tracing::{info, warn};

/// Size of the generated placeholder when no usable image is configured.
pub const FALLBACK_WIDTH: u32 = 640;
pub const FALLBACK_HEIGHT: u32 = 480;

#[derive(Debug, thiserror::Error)]
pub enum PlaceholderError {
    #[error("failed to read {0}: {1}")]
    Read(String, std::io::Error),
    #[error("failed to decode placeholder image: {0}")]
    Decode(image::ImageError),
    #[error("failed to encode placeholder JPEG: {0}")]
    Encode(image::ImageError),
}

/// Load the image sent to viewers of cameras without a live frame.
///
/// JPEG files are served byte for byte; other formats are re-encoded. A
/// missing or unreadable file falls back to a black frame.
pub fn load(path: &Path) -> Result<Bytes, PlaceholderError> {
    match load_file(path) {
        Ok(jpeg) => {
            info!(path = %path.display(), bytes = jpeg.len(), "placeholder loaded");
            Ok(jpeg)
        }
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "placeholder unavailable, using a generated black frame"
            );
            black_jpeg(FALLBACK_WIDTH, FALLBACK_HEIGHT)
        }
    }
}

fn load_file(path: &Path) -> Result<Bytes, PlaceholderError> {
    let data = std::fs::read(path)
        .map_err(|e| PlaceholderError::Read(path.display().to_string(), e))?;
    let data = Bytes::from(data);

    if let Ok(jpeg) = validate_jpeg(data.clone(), usize::MAX) {
        return Ok(jpeg);
    }

    let decoded = image::load_from_memory(&data).map_err(PlaceholderError::Decode)?;
    encode_jpeg(&decoded)
}

pub fn black_jpeg(width: u32, height: u32) -> Result<Bytes, PlaceholderError> {
    encode_jpeg(&DynamicImage::ImageRgb8(RgbImage::new(width, height)))
}

fn encode_jpeg(image: &DynamicImage) -> Result<Bytes, PlaceholderError> {
    // The JPEG encoder rejects alpha channels
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    let mut out = Cursor::new(Vec::new());
    rgb.write_to(&mut out, ImageFormat::Jpeg)
        .map_err(PlaceholderError::Encode)?;
    Ok(Bytes::from(out.into_inner()))
}
