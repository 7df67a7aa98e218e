//! Decoders for `/system_stats` and `/queue`.

use reel_core::hardware::vram::VramStatus;
use serde::Deserialize;

/// Response of `GET /system_stats`.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemStats {
    #[serde(default)]
    pub system: Option<SystemInfo>,
    #[serde(default)]
    pub devices: Vec<DeviceStats>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemInfo {
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub comfyui_version: Option<String>,
    #[serde(default)]
    pub python_version: Option<String>,
}

/// One compute device. Memory figures are in bytes.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceStats {
    pub name: String,
    #[serde(rename = "type", default)]
    pub device_type: String,
    #[serde(default)]
    pub index: Option<u32>,
    pub vram_total: u64,
    pub vram_free: u64,
}

impl SystemStats {
    /// The device generation runs on: the first CUDA device, otherwise the
    /// first device listed.
    pub fn primary_device(&self) -> Option<&DeviceStats> {
        self.devices
            .iter()
            .find(|d| d.device_type == "cuda")
            .or_else(|| self.devices.first())
    }

    /// VRAM status of the primary device, or [`VramStatus::unavailable`]
    /// when the server lists none.
    pub fn vram_status(&self) -> VramStatus {
        match self.primary_device() {
            Some(d) => VramStatus::from_bytes(d.name.clone(), d.vram_total, d.vram_free),
            None => VramStatus::unavailable(),
        }
    }
}

/// Prompt ids in the server's own execution queue (`GET /queue`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub running: Vec<String>,
    pub pending: Vec<String>,
}

#[derive(Deserialize)]
struct RawQueue {
    #[serde(default)]
    queue_running: Vec<serde_json::Value>,
    #[serde(default)]
    queue_pending: Vec<serde_json::Value>,
}

impl QueueSnapshot {
    /// Decode a `/queue` body. Each entry is an array
    /// `[number, prompt_id, prompt, extra_data, outputs]`; entries without
    /// a string prompt id are skipped.
    pub fn from_json(body: serde_json::Value) -> Result<Self, serde_json::Error> {
        let raw: RawQueue = serde_json::from_value(body)?;
        Ok(Self {
            running: prompt_ids(&raw.queue_running),
            pending: prompt_ids(&raw.queue_pending),
        })
    }

    pub fn is_idle(&self) -> bool {
        self.running.is_empty() && self.pending.is_empty()
    }

    pub fn contains(&self, prompt_id: &str) -> bool {
        self.running.iter().chain(&self.pending).any(|p| p == prompt_id)
    }
}

fn prompt_ids(entries: &[serde_json::Value]) -> Vec<String> {
    entries
        .iter()
        .filter_map(|e| e.get(1).and_then(|v| v.as_str()).map(str::to_string))
        .collect()
}
