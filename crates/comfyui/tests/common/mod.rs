//! A fake ComfyUI HTTP server for exercising the REST client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

/// What the fake server has been asked to do.
#[derive(Default)]
pub struct FakeState {
    pub submitted: Vec<Value>,
    pub uploaded: Vec<String>,
    pub deleted: Vec<String>,
    pub interrupts: u32,
    /// Number of `/history` polls that answer `{}` before the entry appears.
    pub history_delay: u32,
    pub history_polls: u32,
}

pub type Shared = Arc<Mutex<FakeState>>;

/// Bind on an ephemeral port and serve in the background.
/// Returns the base URL and the shared state.
pub async fn spawn_fake_comfyui(history_delay: u32) -> (String, Shared) {
    let state: Shared = Arc::new(Mutex::new(FakeState {
        history_delay,
        ..Default::default()
    }));

    let app = Router::new()
        .route("/system_stats", get(system_stats))
        .route("/object_info", get(object_info))
        .route("/upload/image", post(upload_image))
        .route("/prompt", post(submit_prompt))
        .route("/history/{prompt_id}", get(history))
        .route("/view", get(view))
        .route("/queue", get(queue).post(delete_from_queue))
        .route("/interrupt", post(interrupt))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), state)
}

async fn system_stats() -> Json<Value> {
    Json(json!({
        "system": { "os": "posix", "comfyui_version": "0.3.40" },
        "devices": [{
            "name": "cuda:0 NVIDIA GeForce RTX 4090 : cudaMallocAsync",
            "type": "cuda",
            "index": 0,
            "vram_total": 25_769_803_776u64,
            "vram_free": 12_884_901_888u64
        }]
    }))
}

async fn object_info() -> Json<Value> {
    Json(json!({
        "LoadImage": { "input": {} },
        "KSampler": { "input": {} },
        "WanImageToVideo": { "input": {} }
    }))
}

async fn upload_image(State(state): State<Shared>, mut multipart: Multipart) -> Json<Value> {
    let mut name = String::new();
    while let Some(field) = multipart.next_field().await.unwrap() {
        if field.name() == Some("image") {
            name = field.file_name().unwrap_or("upload.png").to_string();
            let _ = field.bytes().await.unwrap();
        }
    }
    state.lock().unwrap().uploaded.push(name.clone());
    Json(json!({ "name": name, "subfolder": "", "type": "input" }))
}

async fn submit_prompt(State(state): State<Shared>, Json(body): Json<Value>) -> impl IntoResponse {
    let prompt = body.get("prompt").cloned().unwrap_or(Value::Null);
    if prompt.as_object().map_or(true, |o| o.is_empty()) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": {
                    "type": "prompt_no_outputs",
                    "message": "Prompt has no outputs",
                    "details": ""
                },
                "node_errors": {}
            })),
        );
    }
    let mut s = state.lock().unwrap();
    s.submitted.push(prompt);
    let n = s.submitted.len();
    (
        StatusCode::OK,
        Json(json!({ "prompt_id": format!("p-{n}"), "number": n - 1, "node_errors": {} })),
    )
}

async fn history(State(state): State<Shared>, Path(prompt_id): Path<String>) -> Json<Value> {
    let mut s = state.lock().unwrap();
    s.history_polls += 1;
    if s.history_polls <= s.history_delay {
        return Json(json!({}));
    }
    Json(json!({
        (prompt_id): {
            "status": { "status_str": "success", "completed": true, "messages": [] },
            "outputs": {
                "9": { "gifs": [{
                    "filename": "clip_00001.mp4",
                    "subfolder": "reel",
                    "type": "output",
                    "format": "video/h264-mp4"
                }] }
            }
        }
    }))
}

async fn view(Query(q): Query<HashMap<String, String>>) -> impl IntoResponse {
    match q.get("filename").map(String::as_str) {
        Some("clip_00001.mp4") if q.get("subfolder").map(String::as_str) == Some("reel") => {
            (StatusCode::OK, b"MP4DATA".to_vec())
        }
        _ => (StatusCode::NOT_FOUND, b"404: Not Found".to_vec()),
    }
}

async fn queue() -> Json<Value> {
    Json(json!({
        "queue_running": [[0, "p-1", {}, {}, ["9"]]],
        "queue_pending": [[1, "p-2", {}, {}, ["9"]]]
    }))
}

async fn delete_from_queue(State(state): State<Shared>, Json(body): Json<Value>) -> StatusCode {
    if let Some(ids) = body.get("delete").and_then(Value::as_array) {
        let mut s = state.lock().unwrap();
        s.deleted
            .extend(ids.iter().filter_map(Value::as_str).map(str::to_string));
    }
    StatusCode::OK
}

async fn interrupt(State(state): State<Shared>) -> StatusCode {
    state.lock().unwrap().interrupts += 1;
    StatusCode::OK
}
