//! Runs a chained bookend video job: start render, end render, splice.
//!
//! Every phase is a task on the shared [`TaskQueue`], so bookend renders
//! are serialized with all other GPU work. Phase transitions are recorded
//! on the [`ChainedVideoJob`] and reported over the event channel.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use reel_comfyui::history::primary_video;
use reel_comfyui::progress::ProgressUpdate;
use reel_core::bookend::{BookendPhase, ChainedVideoJob};
use reel_core::error::CoreError;
use reel_core::retry::RetryPolicy;
use reel_core::scheduling::TaskPriority;
use reel_core::types::SceneId;
use reel_core::workflow::{inject_image, validate_graph};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::GenerationBackend;
use crate::events::{EventSink, GenerationEvent};
use crate::poll::{poll_until_complete, PollConfig, PollError};
use crate::queue::{GenerationTask, TaskContext, TaskError, TaskQueue};
use crate::splice::VideoSplicer;

/// Added to the polling budget to form a render attempt's timeout.
const RENDER_TIMEOUT_SLACK: Duration = Duration::from_secs(60);

/// Buffer between the WebSocket follower and the event forwarder.
const PROGRESS_BUFFER: usize = 32;

/// An image to stage on the server before a render.
#[derive(Debug, Clone)]
pub struct Keyframe {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct BookendRequest {
    pub scene_id: SceneId,
    /// Image-to-video workflow in API format, used for both segments.
    pub workflow: Value,
    pub start_keyframe: Keyframe,
    pub end_keyframe: Keyframe,
    /// Image-loader node to inject keyframes into; defaults to the first
    /// `LoadImage` node.
    pub image_node: Option<String>,
    pub priority: TaskPriority,
}

pub struct BookendRunner<B, S> {
    backend: Arc<B>,
    splicer: Arc<S>,
    queue: TaskQueue,
    poll: PollConfig,
    render_policy: RetryPolicy,
    events: EventSink,
}

impl<B: GenerationBackend, S: VideoSplicer> BookendRunner<B, S> {
    /// Renders use the engine's default policy with a per-attempt timeout
    /// that covers the whole polling budget.
    pub fn new(
        backend: Arc<B>,
        splicer: Arc<S>,
        queue: TaskQueue,
        poll: PollConfig,
        events: EventSink,
    ) -> Result<Self, CoreError> {
        let render_policy = queue
            .engine()
            .default_policy()
            .with_timeout(poll.max_wait + RENDER_TIMEOUT_SLACK)?;
        Ok(Self {
            backend,
            splicer,
            queue,
            poll,
            render_policy,
            events,
        })
    }

    pub fn with_render_policy(mut self, policy: RetryPolicy) -> Self {
        self.render_policy = policy;
        self
    }

    /// Drive `request` to `complete` or `failed`. Never returns a job in a
    /// non-terminal phase.
    pub async fn run(&self, request: BookendRequest, cancel: &CancellationToken) -> ChainedVideoJob {
        let mut job = ChainedVideoJob::new(request.scene_id.clone());
        tracing::info!(scene_id = %job.scene_id, "Bookend job started");
        self.announce(&job).await;

        for phase in [BookendPhase::Start, BookendPhase::End] {
            let keyframe = match phase {
                BookendPhase::Start => &request.start_keyframe,
                _ => &request.end_keyframe,
            };
            let prompt_slot = Arc::new(Mutex::new(None::<String>));
            let task = self.render_task(&request, keyframe.clone(), phase, Arc::clone(&prompt_slot));
            let result = self.run_task(task, cancel).await;

            let prompt_id = prompt_slot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(prompt_id) = &prompt_id {
                let recorded = job.record_prompt_id(prompt_id.clone());
                apply(&job.scene_id, recorded);
            }

            match result {
                Ok(artifact) => {
                    tracing::info!(scene_id = %job.scene_id, %phase, %artifact, "Segment rendered");
                    let advanced = match phase {
                        BookendPhase::Start => job.finish_start(artifact),
                        _ => job.finish_end(artifact),
                    };
                    apply(&job.scene_id, advanced);
                    self.announce(&job).await;
                }
                Err(failure) => {
                    if failure.cancelled {
                        self.cancel_on_server(prompt_id.as_deref()).await;
                    }
                    self.fail(&mut job, failure.reason).await;
                    return job;
                }
            }
        }

        let (Some(start), Some(end)) = (
            job.start_artifact_path().map(str::to_string),
            job.end_artifact_path().map(str::to_string),
        ) else {
            self.fail(&mut job, "Missing segment paths".to_string()).await;
            return job;
        };

        let splicer = Arc::clone(&self.splicer);
        let scene_id = job.scene_id.clone();
        let task = GenerationTask::video(
            job.scene_id.clone(),
            BookendPhase::Splice.label(),
            move |_ctx: TaskContext| {
                let splicer = Arc::clone(&splicer);
                let (scene_id, start, end) = (scene_id.clone(), start.clone(), end.clone());
                async move { Ok::<_, TaskError>(splicer.splice(&scene_id, &start, &end).await?) }
            },
        )
        .with_priority(request.priority)
        .with_policy(single_attempt(&self.render_policy));

        match self.run_task(task, cancel).await {
            Ok(final_path) => {
                let completed = job.complete(final_path);
                apply(&job.scene_id, completed);
                tracing::info!(
                    scene_id = %job.scene_id,
                    path = job.final_artifact_path().unwrap_or_default(),
                    "Bookend job complete",
                );
                self.announce(&job).await;
            }
            Err(failure) => self.fail(&mut job, failure.reason).await,
        }
        job
    }

    fn render_task(
        &self,
        request: &BookendRequest,
        keyframe: Keyframe,
        phase: BookendPhase,
        prompt_slot: Arc<Mutex<Option<String>>>,
    ) -> GenerationTask<String> {
        let backend = Arc::clone(&self.backend);
        let workflow = request.workflow.clone();
        let image_node = request.image_node.clone();
        let poll = self.poll;

        GenerationTask::video(request.scene_id.clone(), phase.label(), move |ctx: TaskContext| {
            let backend = Arc::clone(&backend);
            let mut workflow = workflow.clone();
            let keyframe = keyframe.clone();
            let image_node = image_node.clone();
            let prompt_slot = Arc::clone(&prompt_slot);
            async move {
                let staged = backend.upload_image(keyframe.bytes, &keyframe.filename).await?;
                inject_image(&mut workflow, image_node.as_deref(), &staged)?;
                validate_graph(&workflow)?;

                let prompt_id = backend.submit(&workflow).await?;
                *prompt_slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(prompt_id.clone());
                ctx.report_progress(Some(0), format!("Submitted prompt {prompt_id}"));

                let _follower = follow_progress(Arc::clone(&backend), &prompt_id, &ctx).drop_guard();
                let outputs = poll_until_complete(backend.as_ref(), &prompt_id, &poll, &ctx.cancel).await?;
                let video = primary_video(&outputs).ok_or_else(|| {
                    PollError::Failed(format!("Prompt {prompt_id} finished without a video output"))
                })?;
                Ok::<_, TaskError>(video.relative_path())
            }
        })
        .with_priority(request.priority)
        .with_policy(self.render_policy.clone())
    }

    async fn run_task(
        &self,
        task: GenerationTask<String>,
        cancel: &CancellationToken,
    ) -> Result<String, PhaseFailure> {
        let handle = self.queue.submit(task).await;
        let task_id = handle.id.clone();
        let wait = handle.wait();
        tokio::pin!(wait);

        let result = tokio::select! {
            result = &mut wait => result,
            _ = cancel.cancelled() => {
                self.queue.cancel(&task_id).await;
                wait.await
            }
        };

        let cancelled = result.is_cancelled();
        result.into_result().map_err(|reason| PhaseFailure { reason, cancelled })
    }

    async fn cancel_on_server(&self, prompt_id: Option<&str>) {
        let Some(prompt_id) = prompt_id else {
            return;
        };
        if let Err(e) = self.backend.cancel(prompt_id).await {
            tracing::warn!(prompt_id, error = %e, "Could not cancel prompt on server");
        }
    }

    async fn fail(&self, job: &mut ChainedVideoJob, reason: String) {
        tracing::error!(scene_id = %job.scene_id, phase = %job.phase(), %reason, "Bookend job failed");
        let failed = job.fail(reason);
        apply(&job.scene_id, failed);
        self.announce(job).await;
    }

    async fn announce(&self, job: &ChainedVideoJob) {
        self.events
            .send(GenerationEvent::BookendPhase {
                scene_id: job.scene_id.clone(),
                phase: job.phase(),
                label: job.phase().label(),
                reason: job.failure_reason().map(str::to_string),
            })
            .await;
    }
}

struct PhaseFailure {
    reason: String,
    cancelled: bool,
}

/// Job transitions only fail on a programming error; log and carry on.
fn apply(scene_id: &str, result: Result<(), CoreError>) {
    if let Err(e) = result {
        tracing::error!(scene_id, error = %e, "Rejected bookend transition");
    }
}

fn single_attempt(policy: &RetryPolicy) -> RetryPolicy {
    RetryPolicy::new(
        1,
        policy.initial_delay(),
        policy.max_delay(),
        policy.backoff_multiplier(),
        policy.timeout(),
    )
    .unwrap_or_else(|_| policy.clone())
}

/// Forward live progress for `prompt_id` into the task's events until the
/// returned token is cancelled.
fn follow_progress<B: GenerationBackend>(
    backend: Arc<B>,
    prompt_id: &str,
    ctx: &TaskContext,
) -> CancellationToken {
    let stop = ctx.cancel.child_token();
    let token = stop.clone();
    let prompt_id = prompt_id.to_string();
    let ctx = ctx.clone();

    tokio::spawn(async move {
        let (tx, mut rx) = mpsc::channel(PROGRESS_BUFFER);
        let forward = async {
            while let Some(update) = rx.recv().await {
                let (percent, message) = describe(&update);
                ctx.report_progress(percent, message);
            }
        };
        let (outcome, ()) = tokio::join!(backend.follow_progress(&prompt_id, tx, token), forward);
        tracing::debug!(%prompt_id, ?outcome, "Progress follower stopped");
    });
    stop
}

fn describe(update: &ProgressUpdate) -> (Option<u8>, String) {
    match update {
        ProgressUpdate::Started => (Some(0), "Started".to_string()),
        ProgressUpdate::Node { node } => (None, format!("Running node {node}")),
        ProgressUpdate::Step {
            value,
            max,
            percent,
        } => (Some(*percent), format!("Step {value}/{max}")),
        ProgressUpdate::Finished => (Some(100), "Finished".to_string()),
        ProgressUpdate::Interrupted => (None, "Interrupted".to_string()),
        ProgressUpdate::Error { message } => (None, message.clone()),
    }
}
