//! Resource preflight: combine VRAM and node-catalogue probe outcomes into
//! a single ready / warning / blocked verdict.
//!
//! The probes themselves are performed by the worker; this module only
//! assembles their outcomes, so every admission rule is testable without a
//! server.

use serde::Serialize;

use crate::hardware::vram::VramStatus;
use crate::node_profiles::ProfileResolution;
use crate::preset::{select_preset, QualityPreset};

// ---------------------------------------------------------------------------
// Message codes
// ---------------------------------------------------------------------------

pub const CODE_SERVER_UNREACHABLE: &str = "SERVER_UNREACHABLE";
pub const CODE_NO_GPU: &str = "NO_GPU";
pub const CODE_VRAM_OK: &str = "VRAM_OK";
pub const CODE_INSUFFICIENT_VRAM: &str = "INSUFFICIENT_VRAM";
pub const CODE_PRESET_DOWNGRADED: &str = "PRESET_DOWNGRADED";
pub const CODE_VRAM_CHECK_SKIPPED: &str = "VRAM_CHECK_SKIPPED";
pub const CODE_NODES_OK: &str = "NODES_OK";
pub const CODE_NODES_MISSING: &str = "NODES_MISSING";
pub const CODE_PROFILE_FALLBACK: &str = "PROFILE_FALLBACK";
pub const CODE_UNKNOWN_PROFILE: &str = "UNKNOWN_PROFILE";
pub const CODE_NODE_CHECK_SKIPPED: &str = "NODE_CHECK_SKIPPED";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PreflightStatus {
    Ready,
    Warning,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreflightMessage {
    pub level: MessageLevel,
    pub code: &'static str,
    pub message: String,
}

/// Caller options for a preflight run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreflightOptions {
    pub requested_preset: QualityPreset,
    pub allow_downgrade: bool,
    pub skip_vram_check: bool,
    pub skip_node_check: bool,
}

impl PreflightOptions {
    pub fn new(requested_preset: QualityPreset) -> Self {
        Self {
            requested_preset,
            allow_downgrade: true,
            skip_vram_check: false,
            skip_node_check: false,
        }
    }
}

/// Outcome of the VRAM probe as seen by the assembler.
#[derive(Debug, Clone, PartialEq)]
pub enum VramProbe {
    Skipped,
    /// The server could not be reached; carries the probe error text.
    Unreachable(String),
    Measured(VramStatus),
}

/// Outcome of the node-catalogue probe.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeProbe {
    Skipped,
    Unreachable(String),
    /// The configured profile id is not in the profile table.
    UnknownProfile(String),
    Checked(ProfileResolution),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreflightResult {
    pub status: PreflightStatus,
    pub vram_status: Option<VramStatus>,
    pub was_downgraded: bool,
    pub original_preset: QualityPreset,
    pub recommended_preset: QualityPreset,
    /// Profile that will actually run; differs from the requested one on
    /// fallback, `None` when the node check was skipped or blocked.
    pub usable_profile: Option<&'static str>,
    pub missing_nodes: Vec<String>,
    pub messages: Vec<PreflightMessage>,
}

impl PreflightResult {
    pub fn can_proceed(&self) -> bool {
        self.status != PreflightStatus::Blocked
    }

    fn push(&mut self, level: MessageLevel, code: &'static str, message: String) {
        if self.messages.iter().any(|m| m.code == code) {
            return;
        }
        self.messages.push(PreflightMessage {
            level,
            code,
            message,
        });
    }
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// Combine probe outcomes into a [`PreflightResult`].
///
/// Status is derived from the worst message level: any error blocks, any
/// warning downgrades `ready` to `warning`.
pub fn assemble_preflight(
    options: PreflightOptions,
    vram: VramProbe,
    nodes: NodeProbe,
) -> PreflightResult {
    let mut result = PreflightResult {
        status: PreflightStatus::Ready,
        vram_status: None,
        was_downgraded: false,
        original_preset: options.requested_preset,
        recommended_preset: options.requested_preset,
        usable_profile: None,
        missing_nodes: Vec::new(),
        messages: Vec::new(),
    };

    match vram {
        VramProbe::Skipped => result.push(
            MessageLevel::Info,
            CODE_VRAM_CHECK_SKIPPED,
            "VRAM check skipped".to_string(),
        ),
        VramProbe::Unreachable(err) => result.push(
            MessageLevel::Error,
            CODE_SERVER_UNREACHABLE,
            format!("Generation server is unreachable: {err}"),
        ),
        VramProbe::Measured(status) => {
            apply_vram(&mut result, &options, &status);
            result.vram_status = Some(status);
        }
    }

    match nodes {
        NodeProbe::Skipped => result.push(
            MessageLevel::Info,
            CODE_NODE_CHECK_SKIPPED,
            "Node check skipped".to_string(),
        ),
        NodeProbe::Unreachable(err) => result.push(
            MessageLevel::Error,
            CODE_SERVER_UNREACHABLE,
            format!("Generation server is unreachable: {err}"),
        ),
        NodeProbe::UnknownProfile(id) => result.push(
            MessageLevel::Error,
            CODE_UNKNOWN_PROFILE,
            format!("Unknown workflow profile '{id}'"),
        ),
        NodeProbe::Checked(resolution) => apply_nodes(&mut result, resolution),
    }

    result.status = match result.messages.iter().map(|m| m.level).max() {
        Some(MessageLevel::Error) => PreflightStatus::Blocked,
        Some(MessageLevel::Warning) => PreflightStatus::Warning,
        _ => PreflightStatus::Ready,
    };
    result
}

fn apply_vram(result: &mut PreflightResult, options: &PreflightOptions, status: &VramStatus) {
    if !status.available {
        result.push(
            MessageLevel::Error,
            CODE_NO_GPU,
            "Generation server reports no GPU device".to_string(),
        );
        return;
    }

    let selection = select_preset(
        status.free_mb,
        options.requested_preset,
        options.allow_downgrade,
    );
    result.recommended_preset = selection.preset;
    result.was_downgraded = selection.was_downgraded;

    if !selection.satisfied {
        result.push(
            MessageLevel::Error,
            CODE_INSUFFICIENT_VRAM,
            format!(
                "{} MB free, '{}' needs {} MB",
                status.free_mb,
                selection.preset,
                selection.preset.required_with_headroom_mb()
            ),
        );
    } else if selection.was_downgraded {
        result.push(
            MessageLevel::Warning,
            CODE_PRESET_DOWNGRADED,
            format!(
                "{} MB free is not enough for '{}'; using '{}'",
                status.free_mb, options.requested_preset, selection.preset
            ),
        );
    } else {
        result.push(
            MessageLevel::Info,
            CODE_VRAM_OK,
            format!(
                "{} MB free on {} ({}% used)",
                status.free_mb, status.gpu_name, status.utilization_percent
            ),
        );
    }
}

fn apply_nodes(result: &mut PreflightResult, resolution: ProfileResolution) {
    result.usable_profile = resolution.usable_profile;
    match (resolution.usable_profile, resolution.used_fallback) {
        (None, _) => result.push(
            MessageLevel::Error,
            CODE_NODES_MISSING,
            format!("Missing nodes: {}", resolution.missing.join(", ")),
        ),
        (Some(profile), true) => result.push(
            MessageLevel::Warning,
            CODE_PROFILE_FALLBACK,
            format!(
                "Missing nodes ({}); falling back to '{profile}'",
                resolution.missing.join(", ")
            ),
        ),
        (Some(_), false) => result.push(
            MessageLevel::Info,
            CODE_NODES_OK,
            "All required nodes installed".to_string(),
        ),
    }
    result.missing_nodes = resolution.missing;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
