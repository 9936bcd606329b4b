//! Loading, validating and re-encoding images.
//!
//! Everything that touches pixels lives here. All of the functions that decode
//! or encode are synchronous and CPU-bound; async callers should wrap them in
//! [`crate::async_utils::spawn_blocking_propagating_panics`].

use std::{fmt, io::Cursor, sync::Arc};

use clap::ValueEnum;
use image::{
    DynamicImage, GenericImageView as _, ImageFormat,
    codecs::{jpeg::JpegEncoder, png::PngEncoder, webp::WebPEncoder},
    imageops::FilterType,
};

use crate::{data_url::data_url, errors::ValidationError, prelude::*};

/// Largest file we accept, in bytes.
pub const MAX_FILE_SIZE: u64 = 20 * 1024 * 1024;

/// Uploads are scaled down until their longest side fits in this many pixels.
pub const DEFAULT_MAX_SIDE: u32 = 1600;

/// JPEG quality used for uploads.
pub const DEFAULT_UPLOAD_QUALITY: f32 = 0.85;

/// JPEG quality used by [`resize`].
const RESIZE_QUALITY: f32 = 0.9;

/// Largest width or height accepted by [`compress`] and [`resize`].
const MAX_DIMENSION: u32 = 10_000;

/// MIME type used when we can't identify a file at all.
const UNKNOWN_MIME_TYPE: &str = "application/octet-stream";

/// An image supplied by the user. The bytes are shared and never modified.
#[derive(Clone)]
pub struct SourceImage {
    /// File name, without any directory.
    pub name: String,
    /// MIME type, sniffed from the content when possible.
    pub mime_type: String,
    /// Original file content.
    pub data: Arc<[u8]>,
}

impl SourceImage {
    /// Wrap raw bytes, detecting the MIME type from the content and falling
    /// back to the file name's extension.
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        let name = name.into();
        let data = data.into();
        let mime_type = infer::get(&data)
            .map(|kind| kind.mime_type().to_owned())
            .or_else(|| mime_guess::from_path(&name).first_raw().map(str::to_owned))
            .unwrap_or_else(|| UNKNOWN_MIME_TYPE.to_owned());
        Self {
            name,
            mime_type,
            data,
        }
    }

    /// Read an image from disk, failing if it is too large. This does not
    /// check that it is an image.
    pub async fn load(path: &Path) -> Result<Self> {
        Ok(Self::load_within_limit(path).await??)
    }

    /// Read an image from disk. Files over [`MAX_FILE_SIZE`] are refused
    /// based on their metadata, without reading them, and returned as the
    /// inner error. The outer error is for I/O failures.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn load_within_limit(path: &Path) -> Result<Result<Self, ValidationError>> {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        let size = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Failed to read image at path: {:?}", path))?
            .len();
        if size > MAX_FILE_SIZE {
            return Ok(Err(ValidationError::FileTooLarge {
                name,
                size,
                max: MAX_FILE_SIZE,
            }));
        }
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read image at path: {:?}", path))?;
        Ok(Ok(Self::from_bytes(name, data)))
    }

    /// Size of the original file.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Does this look like an image?
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    /// Check that this is an image of an acceptable size.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.is_image() {
            return Err(ValidationError::NotAnImage {
                name: self.name.clone(),
                mime_type: self.mime_type.clone(),
            });
        }
        if self.size() > MAX_FILE_SIZE {
            return Err(ValidationError::FileTooLarge {
                name: self.name.clone(),
                size: self.size(),
                max: MAX_FILE_SIZE,
            });
        }
        Ok(())
    }

    /// Decode the image.
    pub fn decode(&self) -> Result<DynamicImage> {
        image::load_from_memory(&self.data)
            .with_context(|| format!("Failed to decode image {:?}", self.name))
    }

    /// Re-encode this image as a JPEG whose longest side is at most
    /// `max_side` pixels. Smaller images keep their size.
    pub fn encode_for_upload(&self, max_side: u32, quality: f32) -> Result<EncodedImage> {
        let img = self.decode()?;
        let (width, height) = img.dimensions();
        let img = if width.max(height) > max_side {
            img.resize(max_side, max_side, FilterType::Lanczos3)
        } else {
            img
        };
        Ok(EncodedImage {
            mime_type: "image/jpeg".to_owned(),
            width: img.width(),
            height: img.height(),
            data: encode(&img, EncodeFormat::Jpeg, quality)?,
        })
    }
}

impl fmt::Debug for SourceImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceImage")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.data.len())
            .finish()
    }
}

/// An image we have encoded ourselves.
#[derive(Clone, Debug)]
pub struct EncodedImage {
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl EncodedImage {
    /// Convert to a data URL.
    pub fn to_data_url(&self) -> String {
        data_url(&self.mime_type, &self.data)
    }
}

/// Output formats for [`compress`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodeFormat {
    #[default]
    Jpeg,
    /// Lossless; quality is ignored.
    Png,
    /// Lossless; quality is ignored.
    Webp,
}

impl EncodeFormat {
    /// The usual file extension for this format.
    pub fn extension(self) -> &'static str {
        match self {
            EncodeFormat::Jpeg => "jpg",
            EncodeFormat::Png => "png",
            EncodeFormat::Webp => "webp",
        }
    }

    /// Guess a format from an output path, for when the user didn't say.
    pub fn from_path(path: &Path) -> Option<Self> {
        match ImageFormat::from_path(path).ok()? {
            ImageFormat::Jpeg => Some(EncodeFormat::Jpeg),
            ImageFormat::Png => Some(EncodeFormat::Png),
            ImageFormat::WebP => Some(EncodeFormat::Webp),
            _ => None,
        }
    }
}

/// Encode an image. `quality` runs from 0.0 to 1.0 and only affects JPEG.
fn encode(img: &DynamicImage, format: EncodeFormat, quality: f32) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    match format {
        EncodeFormat::Jpeg => {
            let quality = (quality.clamp(0.01, 1.0) * 100.0).round() as u8;
            let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
            // JPEG has no alpha channel.
            img.to_rgb8()
                .write_with_encoder(encoder)
                .context("Failed to encode JPEG")?;
        }
        EncodeFormat::Png => {
            img.to_rgba8()
                .write_with_encoder(PngEncoder::new(&mut buf))
                .context("Failed to encode PNG")?;
        }
        EncodeFormat::Webp => {
            img.to_rgba8()
                .write_with_encoder(WebPEncoder::new_lossless(&mut buf))
                .context("Failed to encode WebP")?;
        }
    }
    Ok(buf.into_inner())
}

/// Check a user-supplied width or height.
fn check_dimension(field: &'static str, value: u32) -> Result<u32, ValidationError> {
    if value == 0 || value > MAX_DIMENSION {
        Err(ValidationError::InvalidDimension { field, value })
    } else {
        Ok(value)
    }
}

/// Options for [`compress`].
#[derive(Clone, Debug)]
pub struct CompressOptions {
    /// From 0.1 to 1.0.
    pub quality: f32,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub format: EncodeFormat,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self {
            quality: 0.8,
            max_width: None,
            max_height: None,
            format: EncodeFormat::Jpeg,
        }
    }
}

impl CompressOptions {
    /// Check our parameters before doing any work.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(0.1..=1.0).contains(&self.quality) {
            return Err(ValidationError::InvalidQuality(self.quality));
        }
        if let Some(max_width) = self.max_width {
            check_dimension("max width", max_width)?;
        }
        if let Some(max_height) = self.max_height {
            check_dimension("max height", max_height)?;
        }
        Ok(())
    }

    /// Scale `(width, height)` down to fit our limits, keeping the aspect
    /// ratio. Never scales up.
    pub fn fit(&self, width: u32, height: u32) -> (u32, u32) {
        let mut scale = 1.0f64;
        if let Some(max_width) = self.max_width {
            scale = scale.min(f64::from(max_width) / f64::from(width));
        }
        if let Some(max_height) = self.max_height {
            scale = scale.min(f64::from(max_height) / f64::from(height));
        }
        let scaled = |n: u32| ((f64::from(n) * scale).round() as u32).max(1);
        (scaled(width), scaled(height))
    }
}

/// The result of [`compress`].
#[derive(Clone, Debug, Serialize)]
pub struct CompressionReport {
    pub original_size: u64,
    pub compressed_size: u64,
    pub original_width: u32,
    pub original_height: u32,
    pub width: u32,
    pub height: u32,
    /// Percentage of the original size saved, rounded to one decimal. This is
    /// negative if the output is larger.
    pub compression_ratio: f64,
    pub quality: f32,
    pub format: EncodeFormat,
    #[serde(skip)]
    pub data: Vec<u8>,
}

/// Re-encode an image, optionally shrinking it.
#[instrument(level = "debug", skip_all, fields(name = %source.name))]
pub fn compress(
    source: &SourceImage,
    options: &CompressOptions,
) -> Result<CompressionReport> {
    source.validate()?;
    options.validate()?;
    let img = source.decode()?;
    let (original_width, original_height) = img.dimensions();
    let (width, height) = options.fit(original_width, original_height);
    let img = if (width, height) != (original_width, original_height) {
        img.resize_exact(width, height, FilterType::Lanczos3)
    } else {
        img
    };
    let data = encode(&img, options.format, options.quality)?;

    let original_size = source.size();
    let compressed_size = data.len() as u64;
    Ok(CompressionReport {
        original_size,
        compressed_size,
        original_width,
        original_height,
        width,
        height,
        compression_ratio: compression_ratio(original_size, compressed_size),
        quality: options.quality,
        format: options.format,
        data,
    })
}

/// Percentage saved, to one decimal place.
fn compression_ratio(original_size: u64, compressed_size: u64) -> f64 {
    if original_size == 0 {
        return 0.0;
    }
    let saved = original_size as f64 - compressed_size as f64;
    (saved / original_size as f64 * 1000.0).round() / 10.0
}

/// Options for [`resize`].
#[derive(Clone, Debug)]
pub struct ResizeOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Derive the missing dimension from the original aspect ratio. If both
    /// dimensions are given, the width wins.
    pub keep_aspect: bool,
}

impl ResizeOptions {
    /// Work out the final size of an image that is currently
    /// `width`×`height`.
    pub fn target_dimensions(
        &self,
        width: u32,
        height: u32,
    ) -> Result<(u32, u32), ValidationError> {
        let aspect = f64::from(width) / f64::from(height);
        let (target_width, target_height) = match (self.width, self.height) {
            (Some(w), _) if self.keep_aspect => {
                (w, ((f64::from(w) / aspect).round() as u32).max(1))
            }
            (None, Some(h)) if self.keep_aspect => {
                (((f64::from(h) * aspect).round() as u32).max(1), h)
            }
            (w, h) => (w.unwrap_or(width), h.unwrap_or(height)),
        };
        Ok((
            check_dimension("width", target_width)?,
            check_dimension("height", target_height)?,
        ))
    }
}

/// The result of [`resize`]. Always a JPEG.
#[derive(Clone, Debug)]
pub struct ResizedImage {
    pub original_width: u32,
    pub original_height: u32,
    pub image: EncodedImage,
}

/// Resize an image to exact dimensions.
#[instrument(level = "debug", skip_all, fields(name = %source.name))]
pub fn resize(source: &SourceImage, options: &ResizeOptions) -> Result<ResizedImage> {
    source.validate()?;
    let img = source.decode()?;
    let (original_width, original_height) = img.dimensions();
    let (width, height) = options.target_dimensions(original_width, original_height)?;
    let img = img.resize_exact(width, height, FilterType::Lanczos3);
    Ok(ResizedImage {
        original_width,
        original_height,
        image: EncodedImage {
            mime_type: "image/jpeg".to_owned(),
            width,
            height,
            data: encode(&img, EncodeFormat::Jpeg, RESIZE_QUALITY)?,
        },
    })
}

/// Format a byte count for humans, like "1.5 MB".
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 Bytes".to_owned();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let formatted = format!("{value:.2}");
    let formatted = formatted.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", formatted, UNITS[unit])
}
