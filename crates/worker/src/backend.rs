//! The seam between orchestration and the generation server.
//!
//! [`GenerationBackend`] is what the admission controller, poller and
//! bookend runner talk to. [`ComfyUIBackend`] is the production
//! implementation; tests substitute an in-memory fake.

use std::collections::HashSet;

use async_trait::async_trait;
use reel_comfyui::api::{ComfyUIApi, ComfyUIApiError};
use reel_comfyui::client::ComfyUIClient;
use reel_comfyui::history::HistoryState;
use reel_comfyui::progress::{follow_prompt, FollowOutcome, ProgressUpdate};
use reel_comfyui::stats::{QueueSnapshot, SystemStats};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait GenerationBackend: Send + Sync + 'static {
    async fn system_stats(&self) -> Result<SystemStats, ComfyUIApiError>;

    /// Names of every node type the server can run.
    async fn node_types(&self) -> Result<HashSet<String>, ComfyUIApiError>;

    /// Stage an image on the server, returning the name to reference from
    /// an image-loader node.
    async fn upload_image(&self, bytes: Vec<u8>, filename: &str)
        -> Result<String, ComfyUIApiError>;

    /// Queue a workflow, returning its prompt id.
    async fn submit(&self, workflow: &Value) -> Result<String, ComfyUIApiError>;

    async fn history(&self, prompt_id: &str) -> Result<HistoryState, ComfyUIApiError>;

    async fn queue(&self) -> Result<QueueSnapshot, ComfyUIApiError>;

    /// Remove a pending prompt or interrupt it if it is running.
    async fn cancel(&self, prompt_id: &str) -> Result<(), ComfyUIApiError>;

    /// Forward live progress for `prompt_id` until it finishes or `cancel`
    /// fires. Backends without a live channel return
    /// [`FollowOutcome::Closed`] immediately.
    async fn follow_progress(
        &self,
        _prompt_id: &str,
        _sink: mpsc::Sender<ProgressUpdate>,
        _cancel: CancellationToken,
    ) -> FollowOutcome {
        FollowOutcome::Closed
    }
}

/// [`GenerationBackend`] over a ComfyUI server's REST and WebSocket APIs.
#[derive(Debug, Clone)]
pub struct ComfyUIBackend {
    api: ComfyUIApi,
    ws: ComfyUIClient,
}

impl ComfyUIBackend {
    pub fn new(api_url: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            api: ComfyUIApi::new(api_url),
            ws: ComfyUIClient::new(ws_url),
        }
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }

    /// Client id prompts are submitted under.
    pub fn client_id(&self) -> &str {
        self.ws.client_id()
    }
}

#[async_trait]
impl GenerationBackend for ComfyUIBackend {
    async fn system_stats(&self) -> Result<SystemStats, ComfyUIApiError> {
        self.api.system_stats().await
    }

    async fn node_types(&self) -> Result<HashSet<String>, ComfyUIApiError> {
        self.api.node_types().await
    }

    async fn upload_image(
        &self,
        bytes: Vec<u8>,
        filename: &str,
    ) -> Result<String, ComfyUIApiError> {
        let uploaded = self.api.upload_image(bytes, filename, true).await?;
        // LoadImage resolves names relative to the input folder.
        Ok(if uploaded.subfolder.is_empty() {
            uploaded.name
        } else {
            format!("{}/{}", uploaded.subfolder, uploaded.name)
        })
    }

    async fn submit(&self, workflow: &Value) -> Result<String, ComfyUIApiError> {
        let response = self
            .api
            .submit_workflow(workflow, self.ws.client_id())
            .await?;
        tracing::info!(
            prompt_id = %response.prompt_id,
            queue_position = response.number,
            "Workflow submitted",
        );
        Ok(response.prompt_id)
    }

    async fn history(&self, prompt_id: &str) -> Result<HistoryState, ComfyUIApiError> {
        self.api.history_state(prompt_id).await
    }

    async fn queue(&self) -> Result<QueueSnapshot, ComfyUIApiError> {
        self.api.queue().await
    }

    async fn cancel(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let queue = self.api.queue().await?;
        if queue.running.iter().any(|id| id == prompt_id) {
            tracing::info!(prompt_id, "Interrupting running prompt");
            self.api.interrupt().await
        } else {
            tracing::info!(prompt_id, "Removing prompt from server queue");
            self.api.cancel_execution(prompt_id).await
        }
    }

    async fn follow_progress(
        &self,
        prompt_id: &str,
        sink: mpsc::Sender<ProgressUpdate>,
        cancel: CancellationToken,
    ) -> FollowOutcome {
        let mut conn = match self.ws.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(prompt_id, error = %e, "Live progress unavailable");
                return FollowOutcome::Closed;
            }
        };
        follow_prompt(&mut conn.ws_stream, prompt_id, &sink, &cancel).await
    }
}
