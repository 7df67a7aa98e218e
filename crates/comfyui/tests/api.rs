//! Integration tests for the ComfyUI REST client against a fake server.

mod common;

use assert_matches::assert_matches;
use reel_comfyui::api::{ComfyUIApi, ComfyUIApiError};
use reel_comfyui::history::{primary_video, HistoryState};
use reel_core::retry::{ErrorClass, Retryable};
use serde_json::json;

fn workflow() -> serde_json::Value {
    json!({
        "2": { "class_type": "LoadImage", "inputs": { "image": "placeholder.png" } },
        "9": { "class_type": "VHS_VideoCombine", "inputs": { "images": ["2", 0] } }
    })
}

// ---------------------------------------------------------------------------
// Test: system stats decode into a VRAM status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn system_stats_report_primary_gpu() {
    let (url, _state) = common::spawn_fake_comfyui(0).await;
    let api = ComfyUIApi::new(url);

    let vram = api.system_stats().await.unwrap().vram_status();

    assert!(vram.available);
    assert_eq!(vram.total_mb, 24 * 1024);
    assert_eq!(vram.free_mb, 12 * 1024);
}

// ---------------------------------------------------------------------------
// Test: node catalogue is the set of object_info keys
// ---------------------------------------------------------------------------

#[tokio::test]
async fn node_types_lists_catalogue_keys() {
    let (url, _state) = common::spawn_fake_comfyui(0).await;
    let api = ComfyUIApi::new(url);

    let nodes = api.node_types().await.unwrap();

    assert!(nodes.contains("LoadImage"));
    assert!(nodes.contains("WanImageToVideo"));
    assert!(!nodes.contains("VHS_VideoCombine"));
}

// ---------------------------------------------------------------------------
// Test: upload, submit, poll, download
// ---------------------------------------------------------------------------

#[tokio::test]
async fn render_round_trip() {
    let (url, state) = common::spawn_fake_comfyui(2).await;
    let api = ComfyUIApi::new(url);

    let uploaded = api
        .upload_image(b"PNGDATA".to_vec(), "scene1_start.png", true)
        .await
        .unwrap();
    assert_eq!(uploaded.name, "scene1_start.png");

    let submitted = api.submit_workflow(&workflow(), "client-1").await.unwrap();
    assert_eq!(submitted.prompt_id, "p-1");

    assert_eq!(
        api.history_state("p-1").await.unwrap(),
        HistoryState::NotRegistered
    );
    assert_eq!(
        api.history_state("p-1").await.unwrap(),
        HistoryState::NotRegistered
    );
    let HistoryState::Completed { outputs } = api.history_state("p-1").await.unwrap() else {
        panic!("expected completed history on the third poll");
    };

    let video = primary_video(&outputs).unwrap();
    assert_eq!(video.relative_path(), "reel/clip_00001.mp4");
    assert_eq!(api.view(video).await.unwrap(), b"MP4DATA");

    let s = state.lock().unwrap();
    assert_eq!(s.uploaded, vec!["scene1_start.png".to_string()]);
    assert_eq!(s.submitted.len(), 1);
}

// ---------------------------------------------------------------------------
// Test: prompt rejection surfaces the server's message and is terminal
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rejected_prompt_is_terminal_with_message() {
    let (url, _state) = common::spawn_fake_comfyui(0).await;
    let api = ComfyUIApi::new(url);

    let err = api.submit_workflow(&json!({}), "client-1").await.unwrap_err();

    assert_matches!(
        &err,
        ComfyUIApiError::ApiError { status: 400, body } if body == "Prompt has no outputs"
    );
    assert_eq!(err.error_class(), ErrorClass::Terminal);
}

// ---------------------------------------------------------------------------
// Test: queue inspection and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queue_and_cancel() {
    let (url, state) = common::spawn_fake_comfyui(0).await;
    let api = ComfyUIApi::new(url);

    let q = api.queue().await.unwrap();
    assert_eq!(q.running, vec!["p-1"]);
    assert_eq!(q.pending, vec!["p-2"]);

    api.cancel_execution("p-2").await.unwrap();
    api.interrupt().await.unwrap();

    let s = state.lock().unwrap();
    assert_eq!(s.deleted, vec!["p-2".to_string()]);
    assert_eq!(s.interrupts, 1);
}

// ---------------------------------------------------------------------------
// Test: missing file is a 404
// ---------------------------------------------------------------------------

#[tokio::test]
async fn view_missing_file_is_terminal() {
    let (url, _state) = common::spawn_fake_comfyui(0).await;
    let api = ComfyUIApi::new(url);
    let file = reel_comfyui::history::OutputFile {
        node_id: "9".into(),
        filename: "nope.mp4".into(),
        subfolder: String::new(),
        folder_type: "output".into(),
        media: reel_comfyui::history::OutputMedia::Video,
    };

    let err = api.view(&file).await.unwrap_err();

    assert_matches!(err, ComfyUIApiError::ApiError { status: 404, .. });
}

// ---------------------------------------------------------------------------
// Test: unreachable server is retryable
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connection_refused_is_retryable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let api = ComfyUIApi::new(format!("http://{addr}"));

    let err = api.system_stats().await.unwrap_err();

    assert_eq!(err.error_class(), ErrorClass::Retryable);
}
