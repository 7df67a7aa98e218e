//! Admission control: can the server take this job at this preset?
//!
//! Probes run through the execution engine with a short probe policy, so
//! an unreachable server also counts against the circuit breaker. None of
//! this takes the execution slot.

use std::sync::Arc;

use reel_core::hardware::vram::VramStatus;
use reel_core::node_profiles::{find_profile, resolve_profile};
use reel_core::preflight::{
    assemble_preflight, MessageLevel, NodeProbe, PreflightOptions, PreflightResult, VramProbe,
};
use reel_core::preset::{is_vram_sufficient, QualityPreset};
use reel_core::retry::RetryPolicy;
use serde::Serialize;

use crate::backend::GenerationBackend;
use crate::engine::ExecutionEngine;

/// Result of [`AdmissionController::check_vram_for_preset`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VramCheck {
    pub sufficient: bool,
    /// `None` when the server could not be probed.
    pub vram_status: Option<VramStatus>,
    pub message: String,
}

/// Result of [`AdmissionController::check_nodes_for_profile`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeCheck {
    pub success: bool,
    pub profile: String,
    /// Profile that can run, possibly a fallback.
    pub usable_profile: Option<&'static str>,
    /// Nodes of the requested profile absent on the server.
    pub missing: Vec<String>,
    pub error: Option<String>,
}

/// Go/no-go answer for the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProceedDecision {
    pub can_proceed: bool,
    pub reason: String,
    /// `None` when a probe failed and the decision failed open.
    pub preflight: Option<PreflightResult>,
}

pub struct AdmissionController<B> {
    backend: Arc<B>,
    engine: ExecutionEngine,
    probe_policy: RetryPolicy,
}

impl<B: GenerationBackend> AdmissionController<B> {
    pub fn new(backend: Arc<B>, engine: ExecutionEngine) -> Self {
        Self {
            backend,
            engine,
            probe_policy: RetryPolicy::probe(),
        }
    }

    pub fn with_probe_policy(mut self, policy: RetryPolicy) -> Self {
        self.probe_policy = policy;
        self
    }

    pub async fn check_vram_for_preset(&self, preset: QualityPreset) -> VramCheck {
        let required = preset.required_with_headroom_mb();
        match self.probe_vram().await {
            VramProbe::Measured(status) if !status.available => VramCheck {
                sufficient: false,
                message: "Generation server reports no GPU device".to_string(),
                vram_status: Some(status),
            },
            VramProbe::Measured(status) => {
                let sufficient = is_vram_sufficient(status.free_mb, preset);
                let message = if sufficient {
                    format!("{} MB free, '{preset}' needs {required} MB", status.free_mb)
                } else {
                    format!(
                        "Insufficient VRAM: {} MB free, '{preset}' needs {required} MB",
                        status.free_mb
                    )
                };
                VramCheck {
                    sufficient,
                    vram_status: Some(status),
                    message,
                }
            }
            VramProbe::Unreachable(err) => VramCheck {
                sufficient: false,
                vram_status: None,
                message: format!("Could not read VRAM: {err}"),
            },
            VramProbe::Skipped => VramCheck {
                sufficient: true,
                vram_status: None,
                message: "VRAM check skipped".to_string(),
            },
        }
    }

    pub async fn check_nodes_for_profile(&self, profile_id: &str) -> NodeCheck {
        let mut check = NodeCheck {
            success: false,
            profile: profile_id.to_string(),
            usable_profile: None,
            missing: Vec::new(),
            error: None,
        };
        match self.probe_nodes(profile_id).await {
            NodeProbe::Checked(resolution) => {
                check.success = resolution.missing.is_empty();
                check.usable_profile = resolution.usable_profile;
                check.missing = resolution.missing;
            }
            NodeProbe::UnknownProfile(id) => {
                check.error = Some(format!("Unknown workflow profile '{id}'"));
            }
            NodeProbe::Unreachable(err) => check.error = Some(err),
            NodeProbe::Skipped => check.success = true,
        }
        check
    }

    /// Probe VRAM and nodes concurrently and assemble a preflight result.
    pub async fn run_resource_preflight(
        &self,
        profile_id: &str,
        options: PreflightOptions,
    ) -> PreflightResult {
        let (vram, nodes) = self.probes(profile_id, options).await;
        let result = assemble_preflight(options, vram, nodes);
        log_preflight(profile_id, &result);
        result
    }

    /// Like [`run_resource_preflight`](Self::run_resource_preflight) but
    /// fails open: if the server cannot be probed the job is allowed and
    /// the reason says why.
    pub async fn can_proceed_with_generation(
        &self,
        profile_id: &str,
        options: PreflightOptions,
    ) -> ProceedDecision {
        let (vram, nodes) = self.probes(profile_id, options).await;
        let probe_error = match (&vram, &nodes) {
            (VramProbe::Unreachable(e), _) | (_, NodeProbe::Unreachable(e)) => Some(e.clone()),
            _ => None,
        };
        if let Some(err) = probe_error {
            tracing::warn!(profile_id, error = %err, "Preflight probe failed, proceeding anyway");
            return ProceedDecision {
                can_proceed: true,
                reason: format!("Preflight check failed ({err}); proceeding without it"),
                preflight: None,
            };
        }

        let result = assemble_preflight(options, vram, nodes);
        log_preflight(profile_id, &result);
        let reason = if result.can_proceed() {
            format!("Ready at '{}'", result.recommended_preset)
        } else {
            result
                .messages
                .iter()
                .filter(|m| m.level == MessageLevel::Error)
                .map(|m| m.message.as_str())
                .collect::<Vec<_>>()
                .join("; ")
        };
        ProceedDecision {
            can_proceed: result.can_proceed(),
            reason,
            preflight: Some(result),
        }
    }

    async fn probes(&self, profile_id: &str, options: PreflightOptions) -> (VramProbe, NodeProbe) {
        let vram = async {
            if options.skip_vram_check {
                VramProbe::Skipped
            } else {
                self.probe_vram().await
            }
        };
        let nodes = async {
            if options.skip_node_check {
                NodeProbe::Skipped
            } else {
                self.probe_nodes(profile_id).await
            }
        };
        tokio::join!(vram, nodes)
    }

    async fn probe_vram(&self) -> VramProbe {
        let result = self
            .engine
            .execute_with_retry(
                || self.backend.system_stats(),
                "system_stats",
                Some(&self.probe_policy),
            )
            .await;
        match result.into_result() {
            Ok(stats) => {
                let status = stats.vram_status();
                tracing::debug!(free_mb = status.free_mb, total_mb = status.total_mb, "VRAM probed");
                VramProbe::Measured(status)
            }
            Err(e) => VramProbe::Unreachable(e),
        }
    }

    async fn probe_nodes(&self, profile_id: &str) -> NodeProbe {
        let Some(profile) = find_profile(profile_id) else {
            return NodeProbe::UnknownProfile(profile_id.to_string());
        };
        let result = self
            .engine
            .execute_with_retry(
                || self.backend.node_types(),
                "object_info",
                Some(&self.probe_policy),
            )
            .await;
        match result.into_result() {
            Ok(available) => {
                tracing::debug!(profile_id, node_types = available.len(), "Node catalogue probed");
                NodeProbe::Checked(resolve_profile(profile, &available))
            }
            Err(e) => NodeProbe::Unreachable(e),
        }
    }
}

fn log_preflight(profile_id: &str, result: &PreflightResult) {
    if result.was_downgraded {
        tracing::warn!(
            profile_id,
            from = %result.original_preset,
            to = %result.recommended_preset,
            "Preset downgraded",
        );
    }
    tracing::info!(
        profile_id,
        status = ?result.status,
        preset = %result.recommended_preset,
        "Preflight complete",
    );
}
