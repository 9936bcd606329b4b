//! Text extraction for a single image.
//!
//! [`TextExtractionClient`] is the only thing the batch runner talks to. It
//! shrinks the image, hands it to an [`OcrEngine`], and folds every kind of
//! failure into [`Extraction::Failed`], so callers never see an error.

use std::{sync::Arc, time::Duration};

use clap::Args;
use schemars::JsonSchema;

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    errors::ExtractionError,
    images::{DEFAULT_MAX_SIDE, DEFAULT_UPLOAD_QUALITY, SourceImage},
    prelude::*,
};

pub mod command;
pub mod http;

/// The request body understood by OCR services.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct OcrRequest {
    /// The image as a `data:` URL.
    pub image: String,

    /// The original file name, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// The response body returned by OCR services.
#[derive(Clone, Debug, Deserialize, JsonSchema)]
pub struct OcrResponse {
    /// Did recognition succeed?
    pub success: bool,

    /// Recognized text. Missing text on success means the image had none.
    #[serde(default)]
    pub text: Option<String>,

    /// Failure reason.
    #[serde(default)]
    pub error: Option<String>,
}

impl OcrResponse {
    /// Collapse the loosely-typed response into an [`Extraction`].
    pub fn into_extraction(self) -> Extraction {
        if self.success {
            Extraction::Text(self.text.unwrap_or_default())
        } else {
            Extraction::Failed(
                self.error
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| "OCR failed".to_owned()),
            )
        }
    }
}

/// The result of extracting text from one image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Extraction {
    Text(String),
    Failed(String),
}

/// Something that can recognize text in an image.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// Send one request. Implementations should not retry.
    async fn recognize(&self, request: &OcrRequest) -> Result<OcrResponse, ExtractionError>;
}

/// Default per-request timeout, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Our OCR-related options.
#[derive(Args, Clone, Debug)]
pub struct OcrOpts {
    /// Base URL of the OCR service. Requests are sent to `<URL>/ocr`.
    #[clap(long, env = "PHOTOBOX_OCR_URL")]
    pub ocr_url: Option<String>,

    /// Run this program for each image instead of calling a service. It
    /// receives the request JSON on stdin and must print the response JSON on
    /// stdout. Takes precedence over `--ocr-url`.
    #[clap(long)]
    pub ocr_command: Option<String>,

    /// An argument to pass to `--ocr-command`. May be repeated.
    #[clap(long = "ocr-arg", allow_hyphen_values = true)]
    pub ocr_args: Vec<String>,

    /// Images are scaled down so their longest side is at most this many
    /// pixels before upload.
    #[clap(long, default_value_t = DEFAULT_MAX_SIDE)]
    pub max_side: u32,

    /// A timeout, in seconds, for each OCR request. Use 0 to wait forever.
    #[clap(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout: u64,
}

impl OcrOpts {
    /// Build a client for the configured engine.
    pub fn create_client(&self) -> Result<TextExtractionClient> {
        let engine: Arc<dyn OcrEngine> = if let Some(program) = &self.ocr_command {
            Arc::new(command::CommandOcrEngine::new(
                program.clone(),
                self.ocr_args.clone(),
            ))
        } else if let Some(url) = &self.ocr_url {
            Arc::new(http::HttpOcrEngine::new(url)?)
        } else {
            return Err(anyhow!(
                "No OCR service configured: pass --ocr-url or --ocr-command, or set PHOTOBOX_OCR_URL"
            ));
        };
        Ok(TextExtractionClient::new(
            engine,
            self.max_side,
            (self.timeout > 0).then(|| Duration::from_secs(self.timeout)),
        ))
    }
}

/// Extracts text from one image at a time. See the module docs.
pub struct TextExtractionClient {
    engine: Arc<dyn OcrEngine>,
    max_side: u32,
    quality: f32,
    timeout: Option<Duration>,
}

impl TextExtractionClient {
    pub fn new(engine: Arc<dyn OcrEngine>, max_side: u32, timeout: Option<Duration>) -> Self {
        Self {
            engine,
            max_side,
            quality: DEFAULT_UPLOAD_QUALITY,
            timeout,
        }
    }

    /// Shrink and re-encode an image, and wrap it in a request.
    #[instrument(level = "debug", skip_all, fields(name = %source.name))]
    pub async fn prepare(&self, source: &SourceImage) -> Result<OcrRequest, ExtractionError> {
        let image = source.clone();
        let (max_side, quality) = (self.max_side, self.quality);
        let encoded = spawn_blocking_propagating_panics(move || {
            image.encode_for_upload(max_side, quality)
        })
        .await
        .map_err(|err| ExtractionError::Encode(format!("{err:#}")))?;
        debug!(
            width = encoded.width,
            height = encoded.height,
            bytes = encoded.data.len(),
            "Encoded image for upload"
        );
        Ok(OcrRequest {
            image: encoded.to_data_url(),
            filename: Some(source.name.clone()),
        })
    }

    /// Send a prepared request.
    #[instrument(level = "debug", skip_all, fields(filename = ?request.filename))]
    pub async fn send(&self, request: &OcrRequest) -> Extraction {
        let future = self.engine.recognize(request);
        let result = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, future)
                .await
                .unwrap_or(Err(ExtractionError::Timeout)),
            None => future.await,
        };
        match result {
            Ok(response) => response.into_extraction(),
            Err(err) => {
                debug!("OCR request failed: {err}");
                Extraction::Failed(err.to_string())
            }
        }
    }

    /// Prepare and send in one step.
    #[allow(dead_code)]
    pub async fn extract(&self, source: &SourceImage) -> Extraction {
        match self.prepare(source).await {
            Ok(request) => self.send(&request).await,
            Err(err) => Extraction::Failed(err.to_string()),
        }
    }
}
