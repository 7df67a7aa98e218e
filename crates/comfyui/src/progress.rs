//! Live progress for a single prompt, read from the ComfyUI WebSocket.
//!
//! Progress is advisory: `/history` polling stays the authority on when a
//! prompt has finished. The follower forwards updates into a bounded
//! channel and drops them rather than block when the consumer lags.

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use crate::messages::{parse_message, ComfyUIMessage};

/// A progress event for the followed prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressUpdate {
    Started,
    /// A node began executing.
    Node { node: String },
    Step { value: i32, max: i32, percent: u8 },
    Finished,
    Interrupted,
    Error { message: String },
}

/// How [`follow_prompt`] stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowOutcome {
    Finished,
    Failed(String),
    Interrupted,
    /// Cancelled by the caller, or the consumer hung up.
    Cancelled,
    /// The socket closed or errored before the prompt finished.
    Closed,
}

/// Filters the server-wide message stream down to one prompt.
///
/// Older servers send `progress` without a prompt id; those are attributed
/// to the followed prompt only while it is the one executing.
#[derive(Debug)]
pub struct PromptTracker {
    prompt_id: String,
    active: bool,
    done: bool,
}

impl PromptTracker {
    pub fn new(prompt_id: impl Into<String>) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            active: false,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Update from one message, returning the event to forward if any.
    pub fn observe(&mut self, msg: &ComfyUIMessage) -> Option<ProgressUpdate> {
        if self.done {
            return None;
        }
        let ours = msg.prompt_id() == Some(self.prompt_id.as_str());

        match msg {
            ComfyUIMessage::Status(_) | ComfyUIMessage::ExecutionCached(_) => None,
            ComfyUIMessage::Executed(_) => None,
            ComfyUIMessage::ExecutionStart(_) => {
                self.active = ours;
                ours.then_some(ProgressUpdate::Started)
            }
            ComfyUIMessage::Executing(data) => {
                self.active = ours;
                if !ours {
                    return None;
                }
                match &data.node {
                    Some(node) => Some(ProgressUpdate::Node { node: node.clone() }),
                    None => self.finish(ProgressUpdate::Finished),
                }
            }
            ComfyUIMessage::Progress(data) => {
                let relevant = match data.prompt_id {
                    Some(_) => ours,
                    None => self.active,
                };
                relevant.then(|| ProgressUpdate::Step {
                    value: data.value,
                    max: data.max,
                    percent: data.percent(),
                })
            }
            ComfyUIMessage::ExecutionSuccess(_) if ours => self.finish(ProgressUpdate::Finished),
            ComfyUIMessage::ExecutionInterrupted(_) if ours => {
                self.finish(ProgressUpdate::Interrupted)
            }
            ComfyUIMessage::ExecutionError(data) if ours => {
                let message = match &data.node_type {
                    Some(node) => format!("{node}: {}", data.exception_message.trim()),
                    None => data.exception_message.trim().to_string(),
                };
                self.finish(ProgressUpdate::Error { message })
            }
            ComfyUIMessage::ExecutionSuccess(_)
            | ComfyUIMessage::ExecutionInterrupted(_)
            | ComfyUIMessage::ExecutionError(_) => None,
        }
    }

    fn finish(&mut self, update: ProgressUpdate) -> Option<ProgressUpdate> {
        self.done = true;
        self.active = false;
        Some(update)
    }
}

/// Read frames until the prompt finishes, the socket closes, or `cancel`
/// fires, forwarding updates for `prompt_id` into `sink`.
pub async fn follow_prompt<S>(
    stream: &mut S,
    prompt_id: &str,
    sink: &mpsc::Sender<ProgressUpdate>,
    cancel: &CancellationToken,
) -> FollowOutcome
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let mut tracker = PromptTracker::new(prompt_id);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return FollowOutcome::Cancelled,
            frame = stream.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(prompt_id, ?frame, "ComfyUI WebSocket closed");
                return FollowOutcome::Closed;
            }
            // Binary frames carry preview images.
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::warn!(prompt_id, error = %e, "WebSocket receive error");
                return FollowOutcome::Closed;
            }
            None => return FollowOutcome::Closed,
        };

        let msg = match parse_message(&text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unrecognised ComfyUI message");
                continue;
            }
        };

        let Some(update) = tracker.observe(&msg) else {
            continue;
        };
        let outcome = match &update {
            ProgressUpdate::Finished => Some(FollowOutcome::Finished),
            ProgressUpdate::Interrupted => Some(FollowOutcome::Interrupted),
            ProgressUpdate::Error { message } => Some(FollowOutcome::Failed(message.clone())),
            _ => None,
        };

        match sink.try_send(update) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(update)) => {
                tracing::warn!(prompt_id, ?update, "Progress channel full, dropping update");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return FollowOutcome::Cancelled,
        }

        if let Some(outcome) = outcome {
            return outcome;
        }
    }
}
