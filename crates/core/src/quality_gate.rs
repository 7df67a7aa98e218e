//! Video quality gate: threshold evaluation with a warning margin.
//!
//! Scores are continuous and noisy, so a score just short of its threshold
//! is only a warning. A shortfall larger than `warning_margin` is an error,
//! and any error fails the gate.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_MIN_START_FRAME_MATCH: f64 = 30.0;
pub const DEFAULT_MIN_END_FRAME_MATCH: f64 = 30.0;
pub const DEFAULT_MIN_MOTION_QUALITY: f64 = 60.0;
pub const DEFAULT_MIN_PROMPT_ADHERENCE: f64 = 60.0;
pub const DEFAULT_MIN_VIDEO_OVERALL_SCORE: f64 = 70.0;
/// Artifact severity is inverted: lower is better.
pub const DEFAULT_MAX_ARTIFACT_SEVERITY: f64 = 40.0;
pub const DEFAULT_WARNING_MARGIN: f64 = 10.0;

/// Upper bound of every score and threshold.
pub const MAX_SCORE: f64 = 100.0;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    pub min_start_frame_match: f64,
    pub min_end_frame_match: f64,
    pub min_motion_quality: f64,
    pub min_prompt_adherence: f64,
    pub min_video_overall_score: f64,
    pub max_artifact_severity: f64,
    pub warning_margin: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_start_frame_match: DEFAULT_MIN_START_FRAME_MATCH,
            min_end_frame_match: DEFAULT_MIN_END_FRAME_MATCH,
            min_motion_quality: DEFAULT_MIN_MOTION_QUALITY,
            min_prompt_adherence: DEFAULT_MIN_PROMPT_ADHERENCE,
            min_video_overall_score: DEFAULT_MIN_VIDEO_OVERALL_SCORE,
            max_artifact_severity: DEFAULT_MAX_ARTIFACT_SEVERITY,
            warning_margin: DEFAULT_WARNING_MARGIN,
        }
    }
}

impl QualityThresholds {
    /// Every threshold must lie in `0..=100` and the margin must be
    /// non-negative.
    pub fn validate(&self) -> Result<(), CoreError> {
        for metric in ALL_METRICS {
            let value = self.threshold_for(*metric);
            if !(0.0..=MAX_SCORE).contains(&value) {
                return Err(CoreError::Validation(format!(
                    "{} threshold must be between 0 and {MAX_SCORE}, got {value}",
                    metric.as_str()
                )));
            }
        }
        if !(self.warning_margin >= 0.0 && self.warning_margin.is_finite()) {
            return Err(CoreError::Validation(format!(
                "warning_margin must be >= 0, got {}",
                self.warning_margin
            )));
        }
        Ok(())
    }

    pub fn threshold_for(&self, metric: QualityMetric) -> f64 {
        match metric {
            QualityMetric::StartFrameMatch => self.min_start_frame_match,
            QualityMetric::EndFrameMatch => self.min_end_frame_match,
            QualityMetric::MotionQuality => self.min_motion_quality,
            QualityMetric::PromptAdherence => self.min_prompt_adherence,
            QualityMetric::OverallScore => self.min_video_overall_score,
            QualityMetric::ArtifactSeverity => self.max_artifact_severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityMetric {
    StartFrameMatch,
    EndFrameMatch,
    MotionQuality,
    PromptAdherence,
    OverallScore,
    ArtifactSeverity,
}

pub const ALL_METRICS: &[QualityMetric] = &[
    QualityMetric::StartFrameMatch,
    QualityMetric::EndFrameMatch,
    QualityMetric::MotionQuality,
    QualityMetric::PromptAdherence,
    QualityMetric::OverallScore,
    QualityMetric::ArtifactSeverity,
];

impl QualityMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartFrameMatch => "start_frame_match",
            Self::EndFrameMatch => "end_frame_match",
            Self::MotionQuality => "motion_quality",
            Self::PromptAdherence => "prompt_adherence",
            Self::OverallScore => "overall_score",
            Self::ArtifactSeverity => "artifact_severity",
        }
    }

    /// Inverted metrics fail when the score is *above* the threshold.
    pub fn is_inverted(&self) -> bool {
        matches!(self, Self::ArtifactSeverity)
    }
}

/// Measured scores for one video. Unmeasured metrics are skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoQualityScores {
    pub start_frame_match: Option<f64>,
    pub end_frame_match: Option<f64>,
    pub motion_quality: Option<f64>,
    pub prompt_adherence: Option<f64>,
    pub overall_score: Option<f64>,
    pub artifact_severity: Option<f64>,
}

impl VideoQualityScores {
    pub fn score_for(&self, metric: QualityMetric) -> Option<f64> {
        match metric {
            QualityMetric::StartFrameMatch => self.start_frame_match,
            QualityMetric::EndFrameMatch => self.end_frame_match,
            QualityMetric::MotionQuality => self.motion_quality,
            QualityMetric::PromptAdherence => self.prompt_adherence,
            QualityMetric::OverallScore => self.overall_score,
            QualityMetric::ArtifactSeverity => self.artifact_severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityViolation {
    pub metric: QualityMetric,
    pub score: f64,
    pub threshold: f64,
    pub severity: Severity,
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Classify a single score. `None` means no violation.
pub fn classify_score(
    metric: QualityMetric,
    score: f64,
    threshold: f64,
    warning_margin: f64,
) -> Option<Severity> {
    let diff = if metric.is_inverted() {
        score - threshold
    } else {
        threshold - score
    };
    if diff <= 0.0 {
        None
    } else if diff <= warning_margin {
        Some(Severity::Warning)
    } else {
        Some(Severity::Error)
    }
}

/// All violations among the measured scores, in metric order.
pub fn check_violations(
    scores: &VideoQualityScores,
    thresholds: &QualityThresholds,
) -> Vec<QualityViolation> {
    ALL_METRICS
        .iter()
        .filter_map(|&metric| {
            let score = scores.score_for(metric)?;
            let threshold = thresholds.threshold_for(metric);
            classify_score(metric, score, threshold, thresholds.warning_margin).map(|severity| {
                QualityViolation {
                    metric,
                    score,
                    threshold,
                    severity,
                }
            })
        })
        .collect()
}

/// Gate with the default thresholds.
pub fn video_passes_quality_gate(scores: &VideoQualityScores) -> bool {
    video_passes_quality_gate_with(scores, &QualityThresholds::default())
}

/// Passes iff no violation has error severity.
pub fn video_passes_quality_gate_with(
    scores: &VideoQualityScores,
    thresholds: &QualityThresholds,
) -> bool {
    !check_violations(scores, thresholds)
        .iter()
        .any(|v| v.severity == Severity::Error)
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityVerdict {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualitySummary {
    pub total_checks: usize,
    pub passed: usize,
    pub warned: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub verdict: QualityVerdict,
    pub summary: QualitySummary,
    pub violations: Vec<QualityViolation>,
}

impl QualityReport {
    pub fn passes(&self) -> bool {
        self.verdict != QualityVerdict::Fail
    }
}

/// Evaluate scores into a full report.
pub fn evaluate(scores: &VideoQualityScores, thresholds: &QualityThresholds) -> QualityReport {
    let violations = check_violations(scores, thresholds);
    let total_checks = ALL_METRICS
        .iter()
        .filter(|m| scores.score_for(**m).is_some())
        .count();
    let warned = violations
        .iter()
        .filter(|v| v.severity == Severity::Warning)
        .count();
    let failed = violations.len() - warned;

    let verdict = if failed > 0 {
        QualityVerdict::Fail
    } else if warned > 0 {
        QualityVerdict::Warn
    } else {
        QualityVerdict::Pass
    };

    QualityReport {
        verdict,
        summary: QualitySummary {
            total_checks,
            passed: total_checks - violations.len(),
            warned,
            failed,
        },
        violations,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
