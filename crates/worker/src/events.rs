//! Progress and status events emitted to the caller over a bounded channel.
//!
//! Lifecycle events (task status, bookend phases) wait for channel capacity
//! so none are lost; step progress is best-effort and dropped with a
//! warning when the consumer falls behind.

use reel_core::bookend::BookendPhase;
use reel_core::scheduling::{TaskKind, TaskStatus};
use reel_core::types::{SceneId, ShotId};
use serde::Serialize;
use tokio::sync::mpsc;

/// Default channel capacity for [`EventSink::channel`].
pub const DEFAULT_EVENT_BUFFER: usize = 256;

pub type TaskId = String;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GenerationEvent {
    TaskStatus {
        task_id: TaskId,
        kind: TaskKind,
        scene_id: SceneId,
        shot_id: Option<ShotId>,
        status: TaskStatus,
        error: Option<String>,
    },
    TaskProgress {
        task_id: TaskId,
        percent: Option<u8>,
        message: String,
    },
    BookendPhase {
        scene_id: SceneId,
        phase: BookendPhase,
        label: &'static str,
        reason: Option<String>,
    },
}

/// Sending half of the event channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<GenerationEvent>>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<GenerationEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Deliver a lifecycle event, waiting for capacity. A closed receiver
    /// is not an error.
    pub async fn send(&self, event: GenerationEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).await.is_err() {
                tracing::debug!("Event receiver dropped");
            }
        }
    }

    /// Deliver a progress event without waiting.
    pub fn try_send(&self, event: GenerationEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(?event, "Event channel full, dropping progress event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}
