//! Quality presets, their VRAM floors, and the downgrade search.
//!
//! Presets are ordered by how much GPU memory their workflows need. When
//! the live free VRAM cannot host the requested preset, admission walks
//! down the chain towards [`QualityPreset::Fast`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// VRAM kept free on top of every preset floor for the server's own
/// allocations (model swaps, VAE decode spikes).
pub const VRAM_HEADROOM_MB: u64 = 2048;

/// Floor for [`QualityPreset::Fast`].
pub const FAST_VRAM_MB: u64 = 6 * 1024;
/// Floor for [`QualityPreset::Standard`].
pub const STANDARD_VRAM_MB: u64 = 8 * 1024;
/// Floor for [`QualityPreset::Cinematic`].
pub const CINEMATIC_VRAM_MB: u64 = 12 * 1024;
/// Custom workflows are caller-supplied; they are budgeted like standard.
pub const CUSTOM_VRAM_MB: u64 = STANDARD_VRAM_MB;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Fast,
    Standard,
    Cinematic,
    Custom,
}

/// All presets, for name validation messages.
pub const ALL_PRESETS: &[QualityPreset] = &[
    QualityPreset::Fast,
    QualityPreset::Standard,
    QualityPreset::Cinematic,
    QualityPreset::Custom,
];

impl QualityPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Standard => "standard",
            Self::Cinematic => "cinematic",
            Self::Custom => "custom",
        }
    }

    /// Minimum VRAM in MB the preset's workflow needs, excluding headroom.
    pub fn required_vram_mb(&self) -> u64 {
        match self {
            Self::Fast => FAST_VRAM_MB,
            Self::Standard => STANDARD_VRAM_MB,
            Self::Cinematic => CINEMATIC_VRAM_MB,
            Self::Custom => CUSTOM_VRAM_MB,
        }
    }

    /// Floor plus [`VRAM_HEADROOM_MB`].
    pub fn required_with_headroom_mb(&self) -> u64 {
        self.required_vram_mb() + VRAM_HEADROOM_MB
    }

    /// Presets to try, in order, starting with `self` and ending at fast.
    pub fn downgrade_chain(&self) -> &'static [QualityPreset] {
        match self {
            Self::Cinematic => &[Self::Cinematic, Self::Standard, Self::Fast],
            Self::Standard => &[Self::Standard, Self::Fast],
            Self::Custom => &[Self::Custom, Self::Fast],
            Self::Fast => &[Self::Fast],
        }
    }
}

impl fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityPreset {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_PRESETS
            .iter()
            .copied()
            .find(|p| p.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| {
                CoreError::Validation(format!(
                    "Unknown quality preset '{s}'. Valid presets: {}",
                    ALL_PRESETS
                        .iter()
                        .map(|p| p.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}

/// Whether `free_mb` can host `preset`. The boundary is inclusive.
pub fn is_vram_sufficient(free_mb: u64, preset: QualityPreset) -> bool {
    free_mb >= preset.required_with_headroom_mb()
}

/// Outcome of [`select_preset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresetSelection {
    pub preset: QualityPreset,
    pub was_downgraded: bool,
    /// Whether `preset` actually fits in the free VRAM.
    pub satisfied: bool,
}

/// Pick the preset to run given the live free VRAM.
///
/// The requested preset wins if it fits. Otherwise, with downgrade
/// allowed, the first fitting preset down the chain is chosen; when
/// nothing fits the result is `fast`, marked downgraded and unsatisfied.
pub fn select_preset(
    free_mb: u64,
    requested: QualityPreset,
    allow_downgrade: bool,
) -> PresetSelection {
    if is_vram_sufficient(free_mb, requested) {
        return PresetSelection {
            preset: requested,
            was_downgraded: false,
            satisfied: true,
        };
    }
    if !allow_downgrade {
        return PresetSelection {
            preset: requested,
            was_downgraded: false,
            satisfied: false,
        };
    }

    requested
        .downgrade_chain()
        .iter()
        .skip(1)
        .copied()
        .find(|p| is_vram_sufficient(free_mb, *p))
        .map(|preset| PresetSelection {
            preset,
            was_downgraded: true,
            satisfied: true,
        })
        .unwrap_or(PresetSelection {
            preset: QualityPreset::Fast,
            was_downgraded: true,
            satisfied: false,
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
