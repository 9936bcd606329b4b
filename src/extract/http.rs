//! OCR over HTTP.

use reqwest::Client;

use super::{OcrEngine, OcrRequest, OcrResponse};
use crate::{errors::ExtractionError, prelude::*};

/// How much of an error body we keep.
const MAX_ERROR_BODY_CHARS: usize = 500;

/// Posts [`OcrRequest`]s as JSON to `<base>/ocr`.
pub struct HttpOcrEngine {
    client: Client,
    endpoint: String,
}

impl HttpOcrEngine {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(anyhow!("OCR service URL is empty"));
        }
        let client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{base_url}/ocr"),
        })
    }
}

#[async_trait]
impl OcrEngine for HttpOcrEngine {
    #[instrument(level = "debug", skip_all, fields(endpoint = %self.endpoint))]
    async fn recognize(&self, request: &OcrRequest) -> Result<OcrResponse, ExtractionError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|err| ExtractionError::Transport(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ExtractionError::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(ExtractionError::Status {
                status: status.as_u16(),
                body: truncate(body.trim(), MAX_ERROR_BODY_CHARS),
            });
        }
        serde_json::from_str(&body).map_err(|err| {
            debug!(body = %body, "Could not parse OCR response");
            ExtractionError::InvalidResponse(err.to_string())
        })
    }
}

/// Truncate to at most `max` characters.
pub(crate) fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, method, path},
    };

    use super::*;
    use crate::extract::Extraction;

    fn request() -> OcrRequest {
        OcrRequest {
            image: "data:image/jpeg;base64,AAAA".to_owned(),
            filename: Some("receipt.jpg".to_owned()),
        }
    }

    #[tokio::test]
    async fn test_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ocr"))
            .and(body_partial_json(serde_json::json!({
                "image": "data:image/jpeg;base64,AAAA",
                "filename": "receipt.jpg",
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"success": true, "text": "TOTAL 12.00"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        // A trailing slash on the base URL is fine.
        let engine = HttpOcrEngine::new(&format!("{}/", server.uri())).unwrap();
        let response = engine.recognize(&request()).await.unwrap();
        assert_eq!(
            response.into_extraction(),
            Extraction::Text("TOTAL 12.00".to_owned())
        );
    }

    #[tokio::test]
    async fn test_reported_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ocr"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"success": false, "error": "blurry"})),
            )
            .mount(&server)
            .await;

        let engine = HttpOcrEngine::new(&server.uri()).unwrap();
        let response = engine.recognize(&request()).await.unwrap();
        assert_eq!(
            response.into_extraction(),
            Extraction::Failed("blurry".to_owned())
        );
    }

    #[tokio::test]
    async fn test_http_error_includes_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ocr"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .expect(1)
            .mount(&server)
            .await;

        let engine = HttpOcrEngine::new(&server.uri()).unwrap();
        let err = engine.recognize(&request()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "OCR service returned HTTP 502: bad gateway"
        );
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ocr"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let engine = HttpOcrEngine::new(&server.uri()).unwrap();
        let err = engine.recognize(&request()).await.unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_unreachable_service() {
        // Nothing listens on port 9 locally.
        let engine = HttpOcrEngine::new("http://127.0.0.1:9").unwrap();
        let err = engine.recognize(&request()).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Transport(_)));
    }

    #[test]
    fn test_empty_url_rejected() {
        assert!(HttpOcrEngine::new("  ").is_err());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("héllo", 2), "hé…");
    }
}
