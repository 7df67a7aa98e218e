//! WebSocket endpoint of a ComfyUI server, used for live progress only.

use tokio_tungstenite::{connect_async, MaybeTlsStream};

/// Raw WebSocket stream type used by [`ComfyUIConnection`].
pub type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Configuration handle for a ComfyUI instance's WebSocket endpoint.
///
/// The `client_id` is fixed for the handle's lifetime: ComfyUI only sends
/// per-prompt messages to the client id the prompt was submitted with,
/// so the same id must be passed to
/// [`ComfyUIApi::submit_workflow`](crate::api::ComfyUIApi::submit_workflow).
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
    client_id: String,
}

/// A live WebSocket connection to a ComfyUI instance.
pub struct ComfyUIConnection {
    /// Client ID sent during the WebSocket handshake.
    pub client_id: String,
    /// The raw WebSocket stream for reading/writing frames.
    pub ws_stream: WsStream,
}

impl ComfyUIClient {
    /// Create a client with a fresh UUID v4 client id.
    ///
    /// * `ws_url` - WebSocket base URL, e.g. `ws://host:8188`.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self::with_client_id(ws_url, uuid::Uuid::new_v4().to_string())
    }

    pub fn with_client_id(ws_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
        }
    }

    /// WebSocket base URL (e.g. `ws://host:8188`).
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Connect to the ComfyUI WebSocket endpoint, passing the client id
    /// as the `clientId` query parameter.
    pub async fn connect(&self) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let url = format!("{}/ws?clientId={}", self.ws_url, self.client_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::debug!(client_id = %self.client_id, ws_url = %self.ws_url, "Progress socket open");

        Ok(ComfyUIConnection {
            client_id: self.client_id.clone(),
            ws_stream,
        })
    }
}

/// Derive the WebSocket base URL from an HTTP base URL
/// (`http` -> `ws`, `https` -> `wss`).
pub fn ws_url_from_http(api_url: &str) -> String {
    let trimmed = api_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        trimmed.to_string()
    }
}

/// The progress socket could not be opened.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    #[error("Connection error: {0}")]
    Connection(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_derivation() {
        assert_eq!(ws_url_from_http("http://127.0.0.1:8188"), "ws://127.0.0.1:8188");
        assert_eq!(ws_url_from_http("https://gpu.local/"), "wss://gpu.local");
        assert_eq!(ws_url_from_http("ws://already"), "ws://already");
    }

    #[test]
    fn client_ids_are_unique_per_handle() {
        let a = ComfyUIClient::new("ws://h:8188");
        let b = ComfyUIClient::new("ws://h:8188");
        assert_ne!(a.client_id(), b.client_id());
    }
}
