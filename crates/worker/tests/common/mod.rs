//! In-memory generation backend and splicer for worker integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reel_comfyui::api::ComfyUIApiError;
use reel_comfyui::history::{HistoryState, OutputFile, OutputMedia};
use reel_comfyui::stats::{QueueSnapshot, SystemStats};
use reel_core::circuit_breaker::CircuitBreakerConfig;
use reel_core::node_profiles::find_profile;
use reel_core::retry::RetryPolicy;
use reel_worker::backend::GenerationBackend;
use reel_worker::engine::ExecutionEngine;
use reel_worker::events::GenerationEvent;
use reel_worker::splice::{SpliceError, VideoSplicer};
use serde_json::{json, Value};
use tokio::sync::mpsc;

pub const MB: u64 = 1024 * 1024;

/// What the fake backend has seen, plus its scripted answers.
#[derive(Default)]
pub struct FakeState {
    /// Free VRAM reported by `system_stats`; `None` makes the server
    /// unreachable.
    pub free_vram_mb: Option<u64>,
    pub nodes: HashSet<String>,
    pub uploads: Vec<String>,
    pub submitted: Vec<Value>,
    /// History answers per prompt id; the last one repeats.
    pub scripts: HashMap<String, VecDeque<HistoryState>>,
    pub history_polls: HashMap<String, u32>,
    pub cancelled: Vec<String>,
    pub stats_calls: u32,
}

#[derive(Clone, Default)]
pub struct FakeBackend {
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    /// A reachable server with 24 GB total, `free_gb` free, and every node
    /// of `profile` installed.
    pub fn with_gpu(free_gb: u64, profile: &str) -> Self {
        let backend = Self::default();
        {
            let mut s = backend.state.lock().unwrap();
            s.free_vram_mb = Some(free_gb * 1024);
            s.nodes = find_profile(profile)
                .unwrap()
                .required_nodes
                .iter()
                .map(|n| n.to_string())
                .collect();
        }
        backend
    }

    pub fn unreachable() -> Self {
        Self::default()
    }

    /// Script the history answers for `prompt_id`. Prompts are numbered
    /// `p-1`, `p-2`, ... in submission order; unscripted ones complete at once.
    pub fn script(&self, prompt_id: &str, answers: Vec<HistoryState>) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(prompt_id.to_string(), answers.into());
    }

    pub fn polls(&self, prompt_id: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .history_polls
            .get(prompt_id)
            .copied()
            .unwrap_or(0)
    }
}

fn unavailable() -> ComfyUIApiError {
    ComfyUIApiError::ApiError {
        status: 503,
        body: "Service Unavailable".into(),
    }
}

#[async_trait]
impl GenerationBackend for FakeBackend {
    async fn system_stats(&self) -> Result<SystemStats, ComfyUIApiError> {
        let mut s = self.state.lock().unwrap();
        s.stats_calls += 1;
        let free_mb = s.free_vram_mb.ok_or_else(unavailable)?;
        Ok(serde_json::from_value(json!({
            "devices": [{
                "name": "cuda:0 NVIDIA GeForce RTX 4090",
                "type": "cuda",
                "vram_total": 24 * 1024 * MB,
                "vram_free": free_mb * MB
            }]
        }))
        .unwrap())
    }

    async fn node_types(&self) -> Result<HashSet<String>, ComfyUIApiError> {
        let s = self.state.lock().unwrap();
        if s.free_vram_mb.is_none() {
            return Err(unavailable());
        }
        Ok(s.nodes.clone())
    }

    async fn upload_image(&self, _bytes: Vec<u8>, filename: &str) -> Result<String, ComfyUIApiError> {
        self.state.lock().unwrap().uploads.push(filename.to_string());
        Ok(filename.to_string())
    }

    async fn submit(&self, workflow: &Value) -> Result<String, ComfyUIApiError> {
        let mut s = self.state.lock().unwrap();
        s.submitted.push(workflow.clone());
        Ok(format!("p-{}", s.submitted.len()))
    }

    async fn history(&self, prompt_id: &str) -> Result<HistoryState, ComfyUIApiError> {
        let mut s = self.state.lock().unwrap();
        *s.history_polls.entry(prompt_id.to_string()).or_default() += 1;
        let Some(script) = s.scripts.get_mut(prompt_id) else {
            return Ok(completed(&format!("{prompt_id}.mp4")));
        };
        Ok(if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap_or(HistoryState::NotRegistered)
        })
    }

    async fn queue(&self) -> Result<QueueSnapshot, ComfyUIApiError> {
        Ok(QueueSnapshot::default())
    }

    async fn cancel(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        self.state.lock().unwrap().cancelled.push(prompt_id.to_string());
        Ok(())
    }
}

/// A completed history answer with one video output in `reel/`.
pub fn completed(filename: &str) -> HistoryState {
    HistoryState::Completed {
        outputs: vec![OutputFile {
            node_id: "9".into(),
            filename: filename.into(),
            subfolder: "reel".into(),
            folder_type: "output".into(),
            media: OutputMedia::Video,
        }],
    }
}

/// Records splice calls; fails with `stderr` when set.
#[derive(Default)]
pub struct FakeSplicer {
    pub calls: Mutex<Vec<(String, String, String)>>,
    pub stderr: Option<String>,
}

#[async_trait]
impl VideoSplicer for FakeSplicer {
    async fn splice(&self, scene_id: &str, start: &str, end: &str) -> Result<String, SpliceError> {
        self.calls
            .lock()
            .unwrap()
            .push((scene_id.into(), start.into(), end.into()));
        match &self.stderr {
            Some(stderr) => Err(SpliceError::ExecutionFailed {
                exit_code: Some(1),
                stderr: stderr.clone(),
            }),
            None => Ok(format!("final/{scene_id}_bookend.mp4")),
        }
    }
}

/// Minimal image-to-video workflow in API format.
pub fn i2v_workflow() -> Value {
    json!({
        "2": { "class_type": "LoadImage", "inputs": { "image": "placeholder.png" } },
        "5": {
            "class_type": "WanImageToVideo",
            "inputs": { "start_image": ["2", 0], "length": 81 }
        },
        "9": { "class_type": "VHS_VideoCombine", "inputs": { "images": ["5", 0] } }
    })
}

pub fn engine() -> ExecutionEngine {
    ExecutionEngine::new(
        CircuitBreakerConfig::default(),
        RetryPolicy::new(
            3,
            Duration::from_millis(100),
            Duration::from_secs(1),
            2.0,
            Duration::from_secs(30),
        )
        .unwrap(),
    )
}

/// Everything currently buffered on the event channel.
pub fn drain(rx: &mut mpsc::Receiver<GenerationEvent>) -> Vec<GenerationEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}
