use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::GenericImageView;
use tracing::debug;

use crate::error::AcquireError;

pub const MAX_FILE_BYTES: u64 = 5 * 1024 * 1024;
pub const DEFAULT_MAX_DIMENSION_PX: u32 = 256;
pub const DEFAULT_QUALITY: f32 = 0.85;

/// A file the user picked, read fully into memory.
#[derive(Debug, Clone)]
pub struct PickedFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl PickedFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    /// Reads `path`, refusing files over the size cap before reading them.
    pub fn from_path(path: &Path) -> Result<Self, AcquireError> {
        let read_err = |source| AcquireError::Read {
            path: PathBuf::from(path),
            source,
        };
        let size = fs::metadata(path).map_err(read_err)?.len();
        if size > MAX_FILE_BYTES {
            return Err(AcquireError::TooLarge {
                size,
                limit: MAX_FILE_BYTES,
            });
        }
        let bytes = fs::read(path).map_err(read_err)?;
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("image")
            .to_string();
        Ok(Self { name, bytes })
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquireOptions {
    pub max_dimension_px: u32,
    /// Lossy quality in `[0.1, 1.0]`; out-of-range values are clamped.
    pub quality: f32,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            max_dimension_px: DEFAULT_MAX_DIMENSION_PX,
            quality: DEFAULT_QUALITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    /// `data:image/jpeg;base64,...`
    pub data_url: String,
    pub width: u32,
    pub height: u32,
}

/// Decodes, downscales and re-encodes a picked image as an embeddable JPEG data URL.
pub fn acquire(file: &PickedFile, options: AcquireOptions) -> Result<EncodedImage, AcquireError> {
    if file.size() > MAX_FILE_BYTES {
        return Err(AcquireError::TooLarge {
            size: file.size(),
            limit: MAX_FILE_BYTES,
        });
    }

    let decoded = image::load_from_memory(&file.bytes).map_err(AcquireError::Decode)?;
    let (src_w, src_h) = decoded.dimensions();
    let (width, height) = scaled_dimensions(src_w, src_h, options.max_dimension_px);

    let resized = if (width, height) == (src_w, src_h) {
        decoded
    } else {
        decoded.resize_exact(width, height, FilterType::Lanczos3)
    };
    // JPEG has no alpha channel.
    let rgb = resized.to_rgb8();

    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, jpeg_quality(options.quality))
        .encode_image(&rgb)
        .map_err(AcquireError::Encode)?;

    debug!(
        file = %file.name,
        src_w,
        src_h,
        width,
        height,
        encoded_bytes = buf.len(),
        "encoded replacement avatar"
    );

    Ok(EncodedImage {
        data_url: format!("data:image/jpeg;base64,{}", STANDARD.encode(&buf)),
        width,
        height,
    })
}

/// Uniform downscale so the longer side fits `max_px`. Never upscales.
pub fn scaled_dimensions(width: u32, height: u32, max_px: u32) -> (u32, u32) {
    let longest = width.max(height);
    let scale = if longest > max_px {
        max_px as f64 / longest as f64
    } else {
        1.0
    };
    let w = ((width as f64 * scale).round() as u32).max(1);
    let h = ((height as f64 * scale).round() as u32).max(1);
    (w, h)
}

/// Maps a `[0.1, 1.0]` quality onto the encoder's 1..=100 scale.
pub fn jpeg_quality(quality: f32) -> u8 {
    let q = if quality.is_nan() {
        DEFAULT_QUALITY
    } else {
        quality.clamp(0.1, 1.0)
    };
    (q * 100.0).round() as u8
}
