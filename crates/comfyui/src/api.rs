//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps every HTTP endpoint the orchestration core consumes (system
//! stats, node catalogue, image upload, workflow submission, history,
//! file download, queue inspection, cancellation) using [`reqwest`].

use std::collections::HashSet;

use reel_core::retry::{classify_status, ErrorClass, Retryable};
use serde::Deserialize;

use crate::history::{classify_history, HistoryState, OutputFile};
use crate::stats::{QueueSnapshot, SystemStats};

/// HTTP client for a single ComfyUI instance.
#[derive(Debug, Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Body of a successful `POST /prompt`.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub prompt_id: String,
    /// Queue number assigned by the server.
    #[serde(default)]
    pub number: i32,
}

/// Response of `POST /upload/image`.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    /// Name to reference from a `LoadImage` node.
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub folder_type: String,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// Transport failure: connect, timeout, TLS, decode.
    #[error("ComfyUI request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("ComfyUI returned {status}: {body}")]
    ApiError {
        status: u16,
        /// Server error message when the body carried one, else the raw body.
        body: String,
    },

    /// A 2xx response whose body did not have the expected shape.
    #[error("Unexpected ComfyUI response: {0}")]
    InvalidResponse(String),
}

impl Retryable for ComfyUIApiError {
    fn error_class(&self) -> ErrorClass {
        match self {
            Self::Request(e) => {
                if e.is_timeout() || e.is_connect() {
                    ErrorClass::Retryable
                } else if e.is_decode() || e.is_builder() {
                    ErrorClass::Terminal
                } else if let Some(status) = e.status() {
                    classify_status(status.as_u16())
                } else {
                    ErrorClass::Retryable
                }
            }
            Self::ApiError { status, .. } => classify_status(*status),
            Self::InvalidResponse(_) => ErrorClass::Terminal,
        }
    }
}

impl ComfyUIApi {
    /// `api_url` is the server root, e.g. `http://host:8188`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// `GET /system_stats`: device list with VRAM figures.
    pub async fn system_stats(&self) -> Result<SystemStats, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/system_stats", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// `GET /object_info`: names of every installed node type.
    pub async fn node_types(&self) -> Result<HashSet<String>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/object_info", self.api_url))
            .send()
            .await?;

        let body: serde_json::Map<String, serde_json::Value> =
            Self::parse_response(response).await?;
        Ok(body.into_iter().map(|(name, _)| name).collect())
    }

    /// Upload an image to the server's input folder.
    ///
    /// Sends a multipart `POST /upload/image`. With `overwrite` set, an
    /// existing file of the same name is replaced instead of renamed.
    pub async fn upload_image(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        overwrite: bool,
    ) -> Result<UploadResponse, ComfyUIApiError> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("type", "input")
            .text("overwrite", overwrite.to_string());

        let response = self
            .client
            .post(format!("{}/upload/image", self.api_url))
            .multipart(form)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// `POST /prompt`. Progress messages for the prompt are only sent to
    /// the WebSocket connected with the same `client_id`. A graph the
    /// server rejects comes back as a 400 carrying its `error.message`.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// `POST /queue` with `delete`: drop a prompt that has not started.
    pub async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({
            "delete": [prompt_id],
        });

        let response = self
            .client
            .post(format!("{}/queue", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::expect_ok(response).await
    }

    /// `POST /interrupt`: stop whatever prompt is executing now.
    pub async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        let response = self
            .client
            .post(format!("{}/interrupt", self.api_url))
            .send()
            .await?;

        Self::expect_ok(response).await
    }

    /// Raw execution history for a specific prompt.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Execution history for a prompt, classified.
    pub async fn history_state(&self, prompt_id: &str) -> Result<HistoryState, ComfyUIApiError> {
        let body = self.get_history(prompt_id).await?;
        classify_history(prompt_id, &body)
            .map_err(|e| ComfyUIApiError::InvalidResponse(e.to_string()))
    }

    /// Download an output file via `GET /view`.
    pub async fn view(&self, file: &OutputFile) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", file.filename.as_str()),
                ("subfolder", file.subfolder.as_str()),
                ("type", file.folder_type.as_str()),
            ])
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// `GET /queue`: prompts the server is running or holding.
    pub async fn queue(&self) -> Result<QueueSnapshot, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/queue", self.api_url))
            .send()
            .await?;

        let body: serde_json::Value = Self::parse_response(response).await?;
        QueueSnapshot::from_json(body).map_err(|e| ComfyUIApiError::InvalidResponse(e.to_string()))
    }

    /// Map a non-2xx response to [`ComfyUIApiError::ApiError`], preferring
    /// the body's `error.message` over the raw text.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_default();
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body: error_message(&text).unwrap_or(text),
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn expect_ok(response: reqwest::Response) -> Result<(), ComfyUIApiError> {
        Self::ensure_success(response).await.map(drop)
    }
}

/// `error.message` (or a string `error`) from a ComfyUI error body.
fn error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    error
        .get("message")
        .and_then(|m| m.as_str())
        .or_else(|| error.as_str())
        .map(str::to_string)
}
