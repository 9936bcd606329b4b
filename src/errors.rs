//! Typed errors for the parts of the pipeline that callers need to tell apart.
//!
//! Everything above the core is plain [`anyhow::Error`], but adding images,
//! extracting text and validating user parameters each have failure modes
//! that get reported differently, so they get their own types.

use thiserror::Error;

/// Bad input, caught at the point where the user supplied it. These never
/// enter the record pipeline.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{name}: not an image (detected {mime_type})")]
    NotAnImage { name: String, mime_type: String },

    #[error("{name}: file is {size} bytes, but the maximum is {max} bytes")]
    FileTooLarge { name: String, size: u64, max: u64 },

    #[error("no image files were provided")]
    NoImages,

    #[error("invalid color {0:?}: use a hex color like #FFF or #FFFFFF")]
    InvalidColor(String),

    #[error("quality must be a number between 0.1 and 1.0, not {0}")]
    InvalidQuality(f32),

    #[error("{field} must be between 1 and 10000, not {value}")]
    InvalidDimension { field: &'static str, value: u32 },
}

/// Adding a batch would push the store over its record limit. The whole batch
/// is rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("cannot add {incoming} images to {existing}: at most {max} images are allowed")]
pub struct CapacityError {
    pub existing: usize,
    pub incoming: usize,
    pub max: usize,
}

/// Why [`crate::store::RecordStore::add`] refused a batch.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AddError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Capacity(#[from] CapacityError),
}

/// A single extraction failed. This is recorded on the record as a string and
/// never aborts a batch.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("could not prepare image for upload: {0}")]
    Encode(String),

    #[error("OCR service request failed: {0}")]
    Transport(String),

    #[error("OCR service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("OCR service returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("OCR request timed out")]
    Timeout,

    #[error("OCR command failed: {0}")]
    Command(String),
}
