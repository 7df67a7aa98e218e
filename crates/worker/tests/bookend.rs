//! Bookend runner scenarios against the in-memory backend.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{completed, drain, engine, i2v_workflow, FakeBackend, FakeSplicer};
use reel_comfyui::history::HistoryState;
use reel_core::bookend::BookendPhase;
use reel_core::node_profiles::PROFILE_WAN_I2V;
use reel_core::scheduling::{TaskPriority, TaskStatus};
use reel_worker::bookend::{BookendRequest, BookendRunner, Keyframe};
use reel_worker::events::{EventSink, GenerationEvent};
use reel_worker::poll::PollConfig;
use reel_worker::queue::TaskQueue;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Harness {
    backend: FakeBackend,
    splicer: Arc<FakeSplicer>,
    queue: TaskQueue,
    runner: BookendRunner<FakeBackend, FakeSplicer>,
    events: mpsc::Receiver<GenerationEvent>,
}

fn harness(splicer: FakeSplicer) -> Harness {
    let backend = FakeBackend::with_gpu(24, PROFILE_WAN_I2V);
    let splicer = Arc::new(splicer);
    let (sink, events) = EventSink::channel(512);
    let queue = TaskQueue::start(engine(), sink.clone());
    let poll = PollConfig {
        interval: Duration::from_secs(1),
        max_wait: Duration::from_secs(20),
    };
    let runner = BookendRunner::new(
        Arc::new(backend.clone()),
        Arc::clone(&splicer),
        queue.clone(),
        poll,
        sink,
    )
    .unwrap();
    Harness {
        backend,
        splicer,
        queue,
        runner,
        events,
    }
}

fn request() -> BookendRequest {
    BookendRequest {
        scene_id: "scene-7".into(),
        workflow: i2v_workflow(),
        start_keyframe: Keyframe {
            filename: "scene-7_start.png".into(),
            bytes: b"START".to_vec(),
        },
        end_keyframe: Keyframe {
            filename: "scene-7_end.png".into(),
            bytes: b"END".to_vec(),
        },
        image_node: None,
        priority: TaskPriority::Normal,
    }
}

fn phases(events: &[GenerationEvent]) -> Vec<(BookendPhase, &'static str)> {
    events
        .iter()
        .filter_map(|e| match e {
            GenerationEvent::BookendPhase { phase, label, .. } => Some((*phase, *label)),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Test: end-phase history lacks the prompt id for three polls, then completes
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn completes_after_end_phase_is_late_to_register() {
    let mut h = harness(FakeSplicer::default());
    h.backend.script("p-1", vec![completed("start_00001.mp4")]);
    h.backend.script(
        "p-2",
        vec![
            HistoryState::NotRegistered,
            HistoryState::NotRegistered,
            HistoryState::NotRegistered,
            completed("end_00001.mp4"),
        ],
    );

    let job = h.runner.run(request(), &CancellationToken::new()).await;

    assert_eq!(job.phase(), BookendPhase::Complete);
    assert_eq!(job.start_prompt_id(), Some("p-1"));
    assert_eq!(job.end_prompt_id(), Some("p-2"));
    assert_eq!(job.start_artifact_path(), Some("reel/start_00001.mp4"));
    assert_eq!(job.end_artifact_path(), Some("reel/end_00001.mp4"));
    assert_eq!(job.final_artifact_path(), Some("final/scene-7_bookend.mp4"));
    assert!(job.finished_at().is_some());
    assert_eq!(h.backend.polls("p-2"), 4);

    assert_eq!(
        *h.splicer.calls.lock().unwrap(),
        vec![(
            "scene-7".to_string(),
            "reel/start_00001.mp4".to_string(),
            "reel/end_00001.mp4".to_string()
        )]
    );

    let s = h.backend.state.lock().unwrap();
    assert_eq!(s.uploads, vec!["scene-7_start.png", "scene-7_end.png"]);
    assert_eq!(s.submitted[0]["2"]["inputs"]["image"], json!("scene-7_start.png"));
    assert_eq!(s.submitted[1]["2"]["inputs"]["image"], json!("scene-7_end.png"));
    drop(s);

    let events = drain(&mut h.events);
    assert_eq!(
        phases(&events),
        vec![
            (BookendPhase::Start, "Generating start video"),
            (BookendPhase::End, "Generating end video"),
            (BookendPhase::Splice, "Splicing"),
            (BookendPhase::Complete, "Complete"),
        ]
    );
    let completed_tasks = events
        .iter()
        .filter(|e| matches!(e, GenerationEvent::TaskStatus { status: TaskStatus::Completed, .. }))
        .count();
    assert_eq!(completed_tasks, 3);
    h.queue.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: exception details in history fail the job with the server's reason
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn execution_error_fails_without_splicing() {
    let mut h = harness(FakeSplicer::default());
    h.backend.script(
        "p-2",
        vec![
            HistoryState::NotRegistered,
            HistoryState::Failed {
                reason: "KSampler: CUDA out of memory".into(),
            },
        ],
    );

    let job = h.runner.run(request(), &CancellationToken::new()).await;

    assert_eq!(job.phase(), BookendPhase::Failed);
    assert_eq!(job.end_prompt_id(), Some("p-2"));
    assert_eq!(job.start_artifact_path(), Some("reel/p-1.mp4"));
    assert!(job.failure_reason().unwrap().contains("KSampler: CUDA out of memory"));
    assert!(h.splicer.calls.lock().unwrap().is_empty());
    // Poll failures are not resubmitted.
    assert_eq!(h.backend.state.lock().unwrap().submitted.len(), 2);

    let events = drain(&mut h.events);
    let last = phases(&events).pop().unwrap();
    assert_eq!(last, (BookendPhase::Failed, "Failed"));
    h.queue.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: a prompt that never registers times out
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn stuck_render_times_out() {
    let h = harness(FakeSplicer::default());
    h.backend.script("p-1", vec![HistoryState::NotRegistered]);

    let job = h.runner.run(request(), &CancellationToken::new()).await;

    assert_eq!(job.phase(), BookendPhase::Failed);
    assert_eq!(job.start_prompt_id(), Some("p-1"));
    assert!(job.failure_reason().unwrap().starts_with("Timed out waiting for prompt p-1"));
    assert_eq!(h.backend.polls("p-1"), 21);
    h.queue.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: splice failure text is surfaced verbatim
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn splice_failure_reason_is_verbatim() {
    let h = harness(FakeSplicer {
        stderr: Some("[xfade] First input link main timebase do not match".into()),
        ..Default::default()
    });

    let job = h.runner.run(request(), &CancellationToken::new()).await;

    assert_eq!(job.phase(), BookendPhase::Failed);
    assert_eq!(
        job.failure_reason(),
        Some("[xfade] First input link main timebase do not match")
    );
    assert_eq!(job.end_artifact_path(), Some("reel/p-2.mp4"));
    assert_eq!(h.splicer.calls.lock().unwrap().len(), 1);
    h.queue.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: a dangling node reference is rejected before submission
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn broken_workflow_is_never_submitted() {
    let h = harness(FakeSplicer::default());
    let mut req = request();
    req.workflow["9"]["inputs"]["images"] = json!(["42", 0]);

    let job = h.runner.run(req, &CancellationToken::new()).await;

    assert_eq!(job.phase(), BookendPhase::Failed);
    assert!(job.failure_reason().unwrap().contains("9.images -> 42"));
    assert!(job.start_prompt_id().is_none());
    let s = h.backend.state.lock().unwrap();
    assert!(s.submitted.is_empty());
    assert_eq!(s.uploads.len(), 1);
    drop(s);
    h.queue.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: cancelling mid-render fails the job and cancels the prompt on the server
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancel_mid_render_cancels_on_server() {
    let h = harness(FakeSplicer::default());
    h.backend.script("p-1", vec![HistoryState::NotRegistered]);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let job = h.runner.run(request(), &cancel).await;

    assert_eq!(job.phase(), BookendPhase::Failed);
    assert_eq!(job.failure_reason(), Some("Cancelled"));
    assert_eq!(h.backend.state.lock().unwrap().cancelled, vec!["p-1"]);
    assert!(h.backend.polls("p-1") < 10);
    assert_eq!(h.queue.health().depth, 0);
    h.queue.shutdown().await;
}
