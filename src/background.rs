//! Client for a background-replacement service, used for ID photos.

use std::{fmt, str::FromStr, sync::LazyLock, time::Duration};

use regex::Regex;
use reqwest::{Client, StatusCode};
use schemars::JsonSchema;

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    errors::ValidationError,
    images::{DEFAULT_MAX_SIDE, DEFAULT_UPLOAD_QUALITY, SourceImage},
    prelude::*,
};

static HEX_COLOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^#([0-9A-F]{3}|[0-9A-F]{6})$").expect("bad color regex")
});

/// A validated `#RGB` or `#RRGGBB` color.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HexColor(String);

impl HexColor {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for HexColor {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if HEX_COLOR.is_match(s) {
            Ok(Self(s.to_owned()))
        } else {
            Err(ValidationError::InvalidColor(s.to_owned()))
        }
    }
}

impl fmt::Display for HexColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The request body sent to the background service.
#[derive(Clone, Debug, JsonSchema, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundRequest {
    /// The image as a `data:` URL.
    pub image: String,

    /// The new background color, as `#RGB` or `#RRGGBB`.
    pub new_bg_color: String,
}

/// An error body from the background service.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

/// Replaces image backgrounds with a solid color via `<base>/remove-background`.
pub struct BackgroundClient {
    client: Client,
    endpoint: String,
}

impl BackgroundClient {
    pub fn new(base_url: &str, timeout: Option<Duration>) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(anyhow!("background service URL is empty"));
        }
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{base_url}/remove-background"),
        })
    }

    /// Replace the background of `source` with `color`. Returns PNG data.
    #[instrument(level = "debug", skip_all, fields(name = %source.name, color = %color))]
    pub async fn replace_background(
        &self,
        source: &SourceImage,
        color: &HexColor,
    ) -> Result<Vec<u8>> {
        source.validate()?;
        let image = source.clone();
        let encoded = spawn_blocking_propagating_panics(move || {
            image.encode_for_upload(DEFAULT_MAX_SIDE, DEFAULT_UPLOAD_QUALITY)
        })
        .await?;
        let request = BackgroundRequest {
            image: encoded.to_data_url(),
            new_bg_color: color.as_str().to_owned(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Could not reach background service at {}", self.endpoint))?;
        let status = response.status();
        if status.is_success() {
            let data = response
                .bytes()
                .await
                .context("Failed to read background service response")?;
            debug!(bytes = data.len(), "Received image");
            return Ok(data.to_vec());
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }
}

/// Turn a failed response into a message a user can act on.
fn status_error(status: StatusCode, body: &str) -> anyhow::Error {
    match status {
        StatusCode::BAD_REQUEST => {
            anyhow!("Background service rejected the request: check the image and color")
        }
        StatusCode::PAYLOAD_TOO_LARGE => anyhow!("Image is too large for the background service"),
        StatusCode::INTERNAL_SERVER_ERROR => {
            let detail = serde_json::from_str::<ErrorBody>(body)
                .ok()
                .and_then(|body| body.error)
                .filter(|error| !error.trim().is_empty());
            match detail {
                Some(detail) => anyhow!("Background service failed: {detail}"),
                None => anyhow!("Background service failed, please try again later"),
            }
        }
        _ => anyhow!("Background replacement failed with HTTP {status}"),
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, method, path},
    };

    use super::*;
    use crate::images::tests::png_image;

    #[test]
    fn test_hex_colors() {
        for ok in ["#FFF", "#fff", "#1a2B3c", "#000000"] {
            assert_eq!(ok.parse::<HexColor>().unwrap().as_str(), ok);
        }
        for bad in ["FFF", "#FFFF", "#GGG", "#1234567", "", "#fff "] {
            assert_eq!(
                bad.parse::<HexColor>(),
                Err(ValidationError::InvalidColor(bad.to_owned()))
            );
        }
    }

    #[test]
    fn test_request_uses_camel_case() {
        let request = BackgroundRequest {
            image: "data:,".to_owned(),
            new_bg_color: "#FFF".to_owned(),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({"image": "data:,", "newBgColor": "#FFF"})
        );
    }

    async fn server_returning(template: ResponseTemplate) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/remove-background"))
            .respond_with(template)
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_success_returns_png() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/remove-background"))
            .and(body_partial_json(serde_json::json!({"newBgColor": "#438EDB"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(b"\x89PNG fake".to_vec(), "image/png"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = BackgroundClient::new(&server.uri(), None).unwrap();
        let color = "#438EDB".parse().unwrap();
        let data = client
            .replace_background(&png_image("id.png", 8, 8), &color)
            .await
            .unwrap();
        assert_eq!(data, b"\x89PNG fake");
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let color: HexColor = "#fff".parse().unwrap();
        let image = png_image("id.png", 4, 4);
        let cases = [
            (ResponseTemplate::new(400), "check the image and color"),
            (ResponseTemplate::new(413), "too large"),
            (
                ResponseTemplate::new(500)
                    .set_body_json(serde_json::json!({"error": "model not loaded"})),
                "Background service failed: model not loaded",
            ),
            (
                ResponseTemplate::new(500).set_body_string("oops"),
                "please try again later",
            ),
            (ResponseTemplate::new(503), "HTTP 503"),
        ];
        for (template, expected) in cases {
            let server = server_returning(template).await;
            let client = BackgroundClient::new(&server.uri(), None).unwrap();
            let err = client.replace_background(&image, &color).await.unwrap_err();
            assert!(err.to_string().contains(expected), "{err} !~ {expected}");
        }
    }

    #[tokio::test]
    async fn test_rejects_non_images_before_sending() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let client = BackgroundClient::new(&server.uri(), None).unwrap();
        let text = SourceImage::from_bytes("notes.txt", b"hello".to_vec());
        let err = client
            .replace_background(&text, &"#fff".parse().unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not an image"));
    }
}
