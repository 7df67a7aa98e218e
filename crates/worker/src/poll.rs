//! History polling: the authoritative completion check for a prompt.

use std::time::Duration;

use reel_comfyui::api::ComfyUIApiError;
use reel_comfyui::history::{HistoryState, OutputFile};
use reel_core::retry::{ErrorClass, Retryable};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::GenerationBackend;

/// How often and for how long to poll `/history`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    /// Deadline measured from the first poll.
    pub max_wait: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_wait: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// The server recorded an execution failure.
    #[error("Generation failed: {0}")]
    Failed(String),

    #[error("Timed out waiting for prompt {prompt_id} after {}s", .waited.as_secs())]
    TimedOut { prompt_id: String, waited: Duration },

    #[error("Polling cancelled")]
    Cancelled,

    #[error(transparent)]
    Backend(#[from] ComfyUIApiError),
}

/// Resubmitting cannot fix a failed or stuck render, so nothing here is
/// retried.
impl Retryable for PollError {
    fn error_class(&self) -> ErrorClass {
        ErrorClass::Terminal
    }
}

/// Poll `prompt_id` until it completes, fails, times out, or `cancel` fires.
///
/// A history answer without the prompt id is "not yet registered" and keeps
/// polling. Transient request failures are logged and retried on the next
/// tick; terminal ones end the poll.
pub async fn poll_until_complete<B>(
    backend: &B,
    prompt_id: &str,
    config: &PollConfig,
    cancel: &CancellationToken,
) -> Result<Vec<OutputFile>, PollError>
where
    B: GenerationBackend + ?Sized,
{
    let started = Instant::now();
    let deadline = started + config.max_wait;
    let mut polls = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }
        polls += 1;

        match backend.history(prompt_id).await {
            Ok(HistoryState::Completed { outputs }) => {
                tracing::info!(prompt_id, polls, outputs = outputs.len(), "Prompt completed");
                return Ok(outputs);
            }
            Ok(HistoryState::Failed { reason }) => {
                tracing::error!(prompt_id, polls, %reason, "Prompt failed");
                return Err(PollError::Failed(reason));
            }
            Ok(HistoryState::NotRegistered) => {
                tracing::debug!(prompt_id, polls, "Prompt not in history yet");
            }
            Ok(HistoryState::Pending { status_str }) => {
                tracing::debug!(prompt_id, polls, ?status_str, "Prompt pending");
            }
            Err(e) if e.error_class() == ErrorClass::Retryable => {
                tracing::warn!(prompt_id, polls, error = %e, "History poll failed, will retry");
            }
            Err(e) => return Err(e.into()),
        }

        let now = Instant::now();
        if now >= deadline {
            let waited = now - started;
            tracing::error!(prompt_id, polls, waited_secs = waited.as_secs(), "Gave up waiting");
            return Err(PollError::TimedOut {
                prompt_id: prompt_id.to_string(),
                waited,
            });
        }

        let pause = config.interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use reel_comfyui::history::OutputMedia;
    use reel_comfyui::stats::{QueueSnapshot, SystemStats};
    use serde_json::Value;

    /// Replays scripted history answers; repeats the last one forever.
    struct Scripted {
        answers: Mutex<VecDeque<Result<HistoryState, ComfyUIApiError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(answers: Vec<Result<HistoryState, ComfyUIApiError>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    fn unavailable() -> ComfyUIApiError {
        ComfyUIApiError::ApiError {
            status: 503,
            body: "busy".into(),
        }
    }

    #[async_trait]
    impl GenerationBackend for Scripted {
        async fn system_stats(&self) -> Result<SystemStats, ComfyUIApiError> {
            unimplemented!()
        }
        async fn node_types(&self) -> Result<HashSet<String>, ComfyUIApiError> {
            unimplemented!()
        }
        async fn upload_image(&self, _: Vec<u8>, _: &str) -> Result<String, ComfyUIApiError> {
            unimplemented!()
        }
        async fn submit(&self, _: &Value) -> Result<String, ComfyUIApiError> {
            unimplemented!()
        }
        async fn history(&self, _: &str) -> Result<HistoryState, ComfyUIApiError> {
            *self.calls.lock().unwrap() += 1;
            let mut answers = self.answers.lock().unwrap();
            if answers.len() > 1 {
                answers.pop_front().unwrap()
            } else {
                match answers.front().unwrap() {
                    Ok(state) => Ok(state.clone()),
                    Err(_) => Err(unavailable()),
                }
            }
        }
        async fn queue(&self) -> Result<QueueSnapshot, ComfyUIApiError> {
            unimplemented!()
        }
        async fn cancel(&self, _: &str) -> Result<(), ComfyUIApiError> {
            unimplemented!()
        }
    }

    fn clip() -> OutputFile {
        OutputFile {
            node_id: "9".into(),
            filename: "clip.mp4".into(),
            subfolder: "reel".into(),
            folder_type: "output".into(),
            media: OutputMedia::Video,
        }
    }

    fn config() -> PollConfig {
        PollConfig {
            interval: Duration::from_secs(2),
            max_wait: Duration::from_secs(10),
        }
    }

    // -- branches -------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn key_absent_keeps_polling_until_outputs() {
        let backend = Scripted::new(vec![
            Ok(HistoryState::NotRegistered),
            Ok(HistoryState::NotRegistered),
            Ok(HistoryState::NotRegistered),
            Ok(HistoryState::Completed {
                outputs: vec![clip()],
            }),
        ]);
        let out = poll_until_complete(&backend, "p1", &config(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, vec![clip()]);
        assert_eq!(backend.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn exception_details_fail_the_poll() {
        let backend = Scripted::new(vec![
            Ok(HistoryState::Pending { status_str: None }),
            Ok(HistoryState::Failed {
                reason: "KSampler: CUDA out of memory".into(),
            }),
        ]);
        let err = poll_until_complete(&backend, "p1", &config(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, PollError::Failed(ref r) if r == "KSampler: CUDA out of memory");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_times_out() {
        let backend = Scripted::new(vec![Ok(HistoryState::NotRegistered)]);
        let started = Instant::now();
        let err = poll_until_complete(&backend, "p1", &config(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, PollError::TimedOut { ref prompt_id, .. } if prompt_id == "p1");
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        // t = 0, 2, 4, 6, 8, 10
        assert_eq!(backend.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_tolerated() {
        let backend = Scripted::new(vec![
            Err(unavailable()),
            Ok(HistoryState::NotRegistered),
            Ok(HistoryState::Completed {
                outputs: vec![clip()],
            }),
        ]);
        assert!(
            poll_until_complete(&backend, "p1", &config(), &CancellationToken::new())
                .await
                .is_ok()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_error_ends_the_poll() {
        let backend = Scripted::new(vec![
            Err(ComfyUIApiError::InvalidResponse("not json".into())),
            Ok(HistoryState::NotRegistered),
        ]);
        let err = poll_until_complete(&backend, "p1", &config(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, PollError::Backend(ComfyUIApiError::InvalidResponse(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_the_sleep() {
        let backend = Scripted::new(vec![Ok(HistoryState::NotRegistered)]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let err = poll_until_complete(&backend, "p1", &config(), &cancel)
            .await
            .unwrap_err();
        assert_matches!(err, PollError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
