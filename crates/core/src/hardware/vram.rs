//! VRAM status derived from a live device probe.

use serde::Serialize;

pub const BYTES_PER_MB: u64 = 1024 * 1024;

/// Free/total GPU memory of the generation server's primary device.
///
/// Built fresh for every admission check and never cached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VramStatus {
    /// `false` when the server reported no usable GPU.
    pub available: bool,
    pub free_mb: u64,
    pub total_mb: u64,
    /// Share of total memory in use, `0.0..=100.0`.
    pub utilization_percent: f64,
    pub gpu_name: String,
}

impl VramStatus {
    /// Build from raw byte counts as reported by the server.
    ///
    /// `free` is clamped to `total` so a misreporting driver cannot
    /// produce negative utilization.
    pub fn from_bytes(gpu_name: impl Into<String>, total_bytes: u64, free_bytes: u64) -> Self {
        let total_mb = total_bytes / BYTES_PER_MB;
        let free_mb = free_bytes.min(total_bytes) / BYTES_PER_MB;
        Self {
            available: total_mb > 0,
            free_mb,
            total_mb,
            utilization_percent: utilization(free_mb, total_mb),
            gpu_name: gpu_name.into(),
        }
    }

    /// Placeholder for a server that exposes no GPU device.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            free_mb: 0,
            total_mb: 0,
            utilization_percent: 0.0,
            gpu_name: String::new(),
        }
    }

    pub fn free_gb(&self) -> f64 {
        self.free_mb as f64 / 1024.0
    }
}

/// Used share in percent, rounded to one decimal.
fn utilization(free_mb: u64, total_mb: u64) -> f64 {
    if total_mb == 0 {
        return 0.0;
    }
    let used = (total_mb - free_mb) as f64 / total_mb as f64 * 100.0;
    (used * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1024 * BYTES_PER_MB;

    #[test]
    fn converts_bytes_to_megabytes() {
        let s = VramStatus::from_bytes("RTX 4090", 24 * GB, 12 * GB);
        assert!(s.available);
        assert_eq!(s.total_mb, 24 * 1024);
        assert_eq!(s.free_mb, 12 * 1024);
        assert_eq!(s.utilization_percent, 50.0);
        assert_eq!(s.free_gb(), 12.0);
    }

    #[test]
    fn free_clamped_to_total() {
        let s = VramStatus::from_bytes("gpu", 8 * GB, 9 * GB);
        assert_eq!(s.free_mb, s.total_mb);
        assert_eq!(s.utilization_percent, 0.0);
    }

    #[test]
    fn zero_total_is_unavailable() {
        let s = VramStatus::from_bytes("cpu", 0, 0);
        assert!(!s.available);
        assert_eq!(s.utilization_percent, 0.0);
    }
}
