//! Chained "bookend" video job: a start render, an end render, and a splice
//! that merges them, tracked as one logical unit.
//!
//! Phases only move forward (`start -> end -> splice -> complete`); any
//! non-terminal phase may fail. Terminal jobs reject every mutation.

use std::fmt;

use serde::Serialize;

use crate::error::CoreError;
use crate::types::{SceneId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BookendPhase {
    Start,
    End,
    Splice,
    Complete,
    Failed,
}

impl BookendPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Progress label shown to the user while the phase runs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Start => "Generating start video",
            Self::End => "Generating end video",
            Self::Splice => "Splicing",
            Self::Complete => "Complete",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for BookendPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Splice => "splice",
            Self::Complete => "complete",
            Self::Failed => "failed",
        })
    }
}

pub mod state_machine {
    use super::BookendPhase;

    pub fn valid_transitions(from: BookendPhase) -> &'static [BookendPhase] {
        match from {
            BookendPhase::Start => &[BookendPhase::End, BookendPhase::Failed],
            BookendPhase::End => &[BookendPhase::Splice, BookendPhase::Failed],
            BookendPhase::Splice => &[BookendPhase::Complete, BookendPhase::Failed],
            BookendPhase::Complete | BookendPhase::Failed => &[],
        }
    }

    pub fn can_transition(from: BookendPhase, to: BookendPhase) -> bool {
        valid_transitions(from).contains(&to)
    }
}

/// Run state of one bookend job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainedVideoJob {
    pub scene_id: SceneId,
    phase: BookendPhase,
    start_prompt_id: Option<String>,
    end_prompt_id: Option<String>,
    start_artifact_path: Option<String>,
    end_artifact_path: Option<String>,
    final_artifact_path: Option<String>,
    failure_reason: Option<String>,
    pub started_at: Timestamp,
    finished_at: Option<Timestamp>,
}

impl ChainedVideoJob {
    pub fn new(scene_id: impl Into<SceneId>) -> Self {
        Self {
            scene_id: scene_id.into(),
            phase: BookendPhase::Start,
            start_prompt_id: None,
            end_prompt_id: None,
            start_artifact_path: None,
            end_artifact_path: None,
            final_artifact_path: None,
            failure_reason: None,
            started_at: chrono::Utc::now(),
            finished_at: None,
        }
    }

    pub fn phase(&self) -> BookendPhase {
        self.phase
    }

    pub fn start_prompt_id(&self) -> Option<&str> {
        self.start_prompt_id.as_deref()
    }

    pub fn end_prompt_id(&self) -> Option<&str> {
        self.end_prompt_id.as_deref()
    }

    pub fn start_artifact_path(&self) -> Option<&str> {
        self.start_artifact_path.as_deref()
    }

    pub fn end_artifact_path(&self) -> Option<&str> {
        self.end_artifact_path.as_deref()
    }

    pub fn final_artifact_path(&self) -> Option<&str> {
        self.final_artifact_path.as_deref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn finished_at(&self) -> Option<Timestamp> {
        self.finished_at
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Store the prompt id of the render running in the current phase.
    pub fn record_prompt_id(&mut self, prompt_id: impl Into<String>) -> Result<(), CoreError> {
        let slot = match self.phase {
            BookendPhase::Start => &mut self.start_prompt_id,
            BookendPhase::End => &mut self.end_prompt_id,
            other => {
                return Err(CoreError::Conflict(format!(
                    "Cannot record a prompt id in phase '{other}'"
                )))
            }
        };
        *slot = Some(prompt_id.into());
        Ok(())
    }

    /// Record the start segment and advance to `end`.
    pub fn finish_start(&mut self, artifact_path: impl Into<String>) -> Result<(), CoreError> {
        self.transition(BookendPhase::End)?;
        self.start_artifact_path = Some(artifact_path.into());
        Ok(())
    }

    /// Record the end segment and advance to `splice`.
    pub fn finish_end(&mut self, artifact_path: impl Into<String>) -> Result<(), CoreError> {
        self.transition(BookendPhase::Splice)?;
        self.end_artifact_path = Some(artifact_path.into());
        Ok(())
    }

    /// Record the spliced video and complete the job.
    pub fn complete(&mut self, final_path: impl Into<String>) -> Result<(), CoreError> {
        if self.start_artifact_path.is_none() || self.end_artifact_path.is_none() {
            return Err(CoreError::Conflict(
                "Cannot complete a bookend job without both segment paths".to_string(),
            ));
        }
        self.transition(BookendPhase::Complete)?;
        self.final_artifact_path = Some(final_path.into());
        self.finished_at = Some(chrono::Utc::now());
        Ok(())
    }

    /// Mark the job failed with a human-readable reason.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), CoreError> {
        self.transition(BookendPhase::Failed)?;
        self.failure_reason = Some(reason.into());
        self.finished_at = Some(chrono::Utc::now());
        Ok(())
    }

    fn transition(&mut self, to: BookendPhase) -> Result<(), CoreError> {
        if !state_machine::can_transition(self.phase, to) {
            return Err(CoreError::Conflict(format!(
                "Invalid bookend transition: {} -> {to}",
                self.phase
            )));
        }
        self.phase = to;
        Ok(())
    }
}
