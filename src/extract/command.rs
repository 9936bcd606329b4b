//! OCR by running a local program.
//!
//! The program gets one [`OcrRequest`] as JSON on standard input and prints
//! one [`OcrResponse`] as JSON on standard output. Scripts that report a
//! failure and then exit non-zero are fine: a parseable response wins over the
//! exit code.

use std::process::Stdio;

use tokio::{io::AsyncWriteExt as _, process::Command};

use super::{OcrEngine, OcrRequest, OcrResponse, http::truncate};
use crate::{async_utils::check_for_command_failure, errors::ExtractionError, prelude::*};

/// Runs an external OCR program once per request.
pub struct CommandOcrEngine {
    program: String,
    args: Vec<String>,
}

impl CommandOcrEngine {
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

#[async_trait]
impl OcrEngine for CommandOcrEngine {
    #[instrument(level = "debug", skip_all, fields(program = %self.program))]
    async fn recognize(&self, request: &OcrRequest) -> Result<OcrResponse, ExtractionError> {
        let payload = serde_json::to_vec(request)
            .map_err(|err| ExtractionError::Command(err.to_string()))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                ExtractionError::Command(format!("could not run {}: {err}", self.program))
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            ExtractionError::Command("could not open standard input".to_owned())
        })?;
        let write = async move {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await
        };
        let (write_result, output) = tokio::join!(write, child.wait_with_output());
        let output = output.map_err(|err| ExtractionError::Command(err.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let last_line = stdout.lines().rev().find(|line| !line.trim().is_empty());
        if let Some(response) =
            last_line.and_then(|line| serde_json::from_str::<OcrResponse>(line).ok())
        {
            return Ok(response);
        }

        check_for_command_failure(&self.program, &output)
            .map_err(|err| ExtractionError::Command(format!("{err:#}")))?;
        if let Err(err) = write_result {
            return Err(ExtractionError::Command(format!(
                "could not write request: {err}"
            )));
        }
        Err(ExtractionError::InvalidResponse(truncate(
            stdout.trim(),
            200,
        )))
    }
}
