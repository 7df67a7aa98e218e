//! Single-slot priority queue for GPU generation tasks.
//!
//! One long-lived worker drains the queue, running each task through the
//! [`ExecutionEngine`]. Pending tasks are ordered `high -> normal -> low`,
//! FIFO within a priority; a running task is never preempted.
//!
//! ```text
//! submit ──► pending (BTreeMap by (priority, seq)) ──► worker ──► engine
//!                 │                                      │
//!              cancel: removed                        cancel: token fired
//! ```

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use reel_comfyui::api::ComfyUIApiError;
use reel_core::circuit_breaker::CircuitBreakerSnapshot;
use reel_core::error::CoreError;
use reel_core::retry::{classify_message, ErrorClass, RetryPolicy, Retryable};
use reel_core::scheduling::{state_machine, TaskKind, TaskPriority, TaskStatus};
use reel_core::types::{SceneId, ShotId};
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::{ExecutionEngine, ExecutionResult, FailureKind, ServiceHealth};
use crate::events::{EventSink, GenerationEvent, TaskId};
use crate::poll::PollError;
use crate::splice::SpliceError;

// ---------------------------------------------------------------------------
// Task definition
// ---------------------------------------------------------------------------

/// Error type returned by task bodies.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Api(#[from] ComfyUIApiError),

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Splice(#[from] SpliceError),

    #[error("{0}")]
    Other(String),
}

impl Retryable for TaskError {
    fn error_class(&self) -> ErrorClass {
        match self {
            Self::Api(e) => e.error_class(),
            Self::Poll(e) => e.error_class(),
            Self::Core(e) => e.error_class(),
            Self::Splice(e) => e.error_class(),
            Self::Other(msg) => classify_message(msg),
        }
    }
}

/// Handed to every attempt of a task body.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    /// Fires when the task is cancelled or the queue shuts down.
    pub cancel: CancellationToken,
    events: EventSink,
}

impl TaskContext {
    /// Best-effort progress report; dropped if the consumer lags.
    pub fn report_progress(&self, percent: Option<u8>, message: impl Into<String>) {
        self.events.try_send(GenerationEvent::TaskProgress {
            task_id: self.task_id.clone(),
            percent,
            message: message.into(),
        });
    }
}

type TaskFn<T> = Box<dyn FnMut(TaskContext) -> BoxFuture<'static, Result<T, TaskError>> + Send>;

/// A unit of GPU work. `execute` is called once per attempt.
pub struct GenerationTask<T> {
    pub id: TaskId,
    pub kind: TaskKind,
    pub priority: TaskPriority,
    pub scene_id: SceneId,
    pub shot_id: Option<ShotId>,
    pub label: String,
    /// Overrides the engine's default policy.
    pub policy: Option<RetryPolicy>,
    execute: TaskFn<T>,
}

impl<T: Send + 'static> GenerationTask<T> {
    fn new<F, Fut>(kind: TaskKind, scene_id: SceneId, label: String, mut execute: F) -> Self
    where
        F: FnMut(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            priority: TaskPriority::default(),
            scene_id,
            shot_id: None,
            label,
            policy: None,
            execute: Box::new(move |ctx| execute(ctx).boxed()),
        }
    }

    pub fn image<F, Fut>(scene_id: impl Into<SceneId>, label: impl Into<String>, execute: F) -> Self
    where
        F: FnMut(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        Self::new(TaskKind::Image, scene_id.into(), label.into(), execute)
    }

    pub fn video<F, Fut>(scene_id: impl Into<SceneId>, label: impl Into<String>, execute: F) -> Self
    where
        F: FnMut(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        Self::new(TaskKind::Video, scene_id.into(), label.into(), execute)
    }

    pub fn with_shot(mut self, shot_id: impl Into<ShotId>) -> Self {
        self.shot_id = Some(shot_id.into());
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

/// Resolves with the task's result once it finishes or is cancelled.
#[derive(Debug)]
pub struct TaskHandle<T> {
    pub id: TaskId,
    rx: oneshot::Receiver<ExecutionResult<T>>,
}

impl<T> TaskHandle<T> {
    pub async fn wait(self) -> ExecutionResult<T> {
        self.rx.await.unwrap_or_else(|_| {
            ExecutionResult::failed(
                FailureKind::Cancelled,
                "Task cancelled before it ran",
                0,
                Duration::ZERO,
            )
        })
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueHealth {
    pub state: WorkerState,
    /// Pending tasks, excluding the running one.
    pub depth: usize,
    pub running_task: Option<TaskId>,
    pub circuit_breaker: CircuitBreakerSnapshot,
    pub service: ServiceHealth,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct TaskMeta {
    id: TaskId,
    kind: TaskKind,
    scene_id: SceneId,
    shot_id: Option<ShotId>,
    label: String,
}

struct RunEnv {
    engine: ExecutionEngine,
    cancel: CancellationToken,
    events: EventSink,
}

/// What a finished job reports back to the worker. `deliver` resolves the
/// caller's handle and runs after the slot is released.
struct RunOutcome {
    status: TaskStatus,
    error: Option<String>,
    deliver: Box<dyn FnOnce() + Send>,
}

type Job = Box<dyn FnOnce(RunEnv) -> BoxFuture<'static, RunOutcome> + Send>;

type PendingKey = (Reverse<u8>, u64);

struct Pending {
    meta: TaskMeta,
    job: Job,
}

struct Running {
    id: TaskId,
    cancel: CancellationToken,
}

struct Inner {
    pending: BTreeMap<PendingKey, Pending>,
    index: HashMap<TaskId, PendingKey>,
    running: Option<Running>,
    next_seq: u64,
    accepting: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    notify: Notify,
    engine: ExecutionEngine,
    events: EventSink,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pop the highest-priority pending task and mark it running.
    fn take_next(&self) -> Option<(TaskMeta, Job, CancellationToken)> {
        if self.shutdown.is_cancelled() {
            return None;
        }
        let mut inner = self.lock();
        let (_, next) = inner.pending.pop_first()?;
        inner.index.remove(&next.meta.id);
        let cancel = self.shutdown.child_token();
        inner.running = Some(Running {
            id: next.meta.id.clone(),
            cancel: cancel.clone(),
        });
        Some((next.meta, next.job, cancel))
    }

    async fn transition(
        &self,
        meta: &TaskMeta,
        from: Option<TaskStatus>,
        to: TaskStatus,
        error: Option<String>,
    ) {
        if let Some(from) = from {
            if let Err(e) = state_machine::validate_transition(from, to) {
                tracing::error!(task_id = %meta.id, error = %e, "Unexpected task transition");
            }
        }
        self.events
            .send(GenerationEvent::TaskStatus {
                task_id: meta.id.clone(),
                kind: meta.kind,
                scene_id: meta.scene_id.clone(),
                shot_id: meta.shot_id.clone(),
                status: to,
                error,
            })
            .await;
    }
}

/// Handle to the queue. Clones share the same worker.
#[derive(Clone)]
pub struct TaskQueue {
    shared: Arc<Shared>,
}

impl TaskQueue {
    /// Spawn the worker on the current runtime.
    ///
    /// Lifecycle events wait for channel capacity, so the caller must keep
    /// draining the event receiver while tasks run.
    pub fn start(engine: ExecutionEngine, events: EventSink) -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                pending: BTreeMap::new(),
                index: HashMap::new(),
                running: None,
                next_seq: 0,
                accepting: true,
            }),
            notify: Notify::new(),
            engine,
            events,
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        });
        let worker = tokio::spawn(run_worker(Arc::clone(&shared)));
        *shared.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(worker);
        Self { shared }
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.shared.engine
    }

    /// Queue a task and return a handle to its result.
    pub async fn submit<T: Send + 'static>(&self, task: GenerationTask<T>) -> TaskHandle<T> {
        let GenerationTask {
            id,
            kind,
            priority,
            scene_id,
            shot_id,
            label,
            policy,
            mut execute,
        } = task;
        let (tx, rx) = oneshot::channel();
        let handle = TaskHandle { id: id.clone(), rx };
        let meta = TaskMeta {
            id,
            kind,
            scene_id,
            shot_id,
            label,
        };

        let task_id = meta.id.clone();
        let label = meta.label.clone();
        let job: Job = Box::new(move |env: RunEnv| {
            async move {
                let ctx = TaskContext {
                    task_id,
                    cancel: env.cancel.clone(),
                    events: env.events,
                };
                let result = env
                    .engine
                    .execute_cancellable(
                        || execute(ctx.clone()),
                        &label,
                        policy.as_ref(),
                        &env.cancel,
                    )
                    .await;
                let status = if result.success {
                    TaskStatus::Completed
                } else if result.is_cancelled() {
                    TaskStatus::Cancelled
                } else {
                    TaskStatus::Failed
                };
                RunOutcome {
                    status,
                    error: result.error.clone(),
                    deliver: Box::new(move || {
                        // The caller may have dropped its handle.
                        let _ = tx.send(result);
                    }),
                }
            }
            .boxed()
        });

        if !self.shared.lock().accepting {
            tracing::warn!(task_id = %meta.id, "Queue is shut down, rejecting task");
            return handle;
        }

        self.shared
            .transition(&meta, None, TaskStatus::Queued, None)
            .await;

        let depth = {
            let mut inner = self.shared.lock();
            if !inner.accepting {
                return handle;
            }
            let key = (Reverse(priority.rank()), inner.next_seq);
            inner.next_seq += 1;
            inner.index.insert(meta.id.clone(), key);
            tracing::info!(
                task_id = %meta.id,
                kind = %meta.kind,
                priority = priority.as_str(),
                label = %meta.label,
                "Task queued",
            );
            inner.pending.insert(key, Pending { meta, job });
            inner.pending.len()
        };
        tracing::debug!(depth, "Queue depth");
        self.shared.notify.notify_one();
        handle
    }

    /// Queue a task and wait for it to finish or be cancelled.
    pub async fn enqueue<T: Send + 'static>(&self, task: GenerationTask<T>) -> ExecutionResult<T> {
        self.submit(task).await.wait().await
    }

    /// Cancel a pending or running task. Returns `false` if the id is
    /// unknown or already finished.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let removed = {
            let mut inner = self.shared.lock();
            if let Some(key) = inner.index.remove(task_id) {
                inner.pending.remove(&key)
            } else if let Some(running) = inner.running.as_ref().filter(|r| r.id == task_id) {
                running.cancel.cancel();
                tracing::info!(task_id, "Cancelling running task");
                return true;
            } else {
                return false;
            }
        };

        match removed {
            Some(pending) => {
                tracing::info!(task_id, "Removed pending task");
                self.shared
                    .transition(
                        &pending.meta,
                        Some(TaskStatus::Queued),
                        TaskStatus::Cancelled,
                        None,
                    )
                    .await;
                true
            }
            None => false,
        }
    }

    pub fn depth(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn health(&self) -> QueueHealth {
        let (depth, running_task) = {
            let inner = self.shared.lock();
            (inner.pending.len(), inner.running.as_ref().map(|r| r.id.clone()))
        };
        let circuit_breaker = self.shared.engine.circuit_snapshot();
        QueueHealth {
            state: if running_task.is_some() {
                WorkerState::Running
            } else {
                WorkerState::Idle
            },
            depth,
            running_task,
            service: ServiceHealth::from_snapshot(&circuit_breaker),
            circuit_breaker,
        }
    }

    /// Stop accepting work, cancel everything, and wait for the worker.
    pub async fn shutdown(&self) {
        let drained = {
            let mut inner = self.shared.lock();
            inner.accepting = false;
            inner.index.clear();
            std::mem::take(&mut inner.pending)
        };
        self.shared.shutdown.cancel();
        self.shared.notify.notify_one();

        for (_, pending) in drained {
            self.shared
                .transition(
                    &pending.meta,
                    Some(TaskStatus::Queued),
                    TaskStatus::Cancelled,
                    Some("Queue shut down".to_string()),
                )
                .await;
        }

        let worker = self
            .shared
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Task queue worker panicked");
            }
        }
    }
}

async fn run_worker(shared: Arc<Shared>) {
    tracing::info!("Task queue worker started");

    loop {
        let Some((meta, job, cancel)) = shared.take_next() else {
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                _ = shared.notify.notified() => continue,
            }
        };

        shared
            .transition(&meta, Some(TaskStatus::Queued), TaskStatus::Running, None)
            .await;
        tracing::info!(task_id = %meta.id, kind = %meta.kind, label = %meta.label, "Task started");

        let env = RunEnv {
            engine: shared.engine.clone(),
            cancel,
            events: shared.events.clone(),
        };
        let outcome = match tokio::spawn(job(env)).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::error!(task_id = %meta.id, error = %e, "Task panicked");
                None
            }
        };

        shared.lock().running = None;

        match outcome {
            Some(RunOutcome {
                status,
                error,
                deliver,
            }) => {
                tracing::info!(task_id = %meta.id, %status, "Task finished");
                shared
                    .transition(&meta, Some(TaskStatus::Running), status, error)
                    .await;
                deliver();
            }
            None => {
                shared
                    .transition(
                        &meta,
                        Some(TaskStatus::Running),
                        TaskStatus::Failed,
                        Some("Task panicked".to_string()),
                    )
                    .await;
            }
        }
    }

    tracing::info!("Task queue worker stopped");
}
