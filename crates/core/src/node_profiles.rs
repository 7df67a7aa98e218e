//! Workflow profiles and the ComfyUI node types each one needs.
//!
//! A profile names a family of workflow graphs. Before a job is queued,
//! admission compares the profile's required node types against the
//! server's `/object_info` catalogue. Some profiles declare a fallback
//! profile that can stand in when their own nodes are missing.

use std::collections::HashSet;

use serde::Serialize;

// ---------------------------------------------------------------------------
// Profile ids
// ---------------------------------------------------------------------------

/// Text-to-image keyframe generation.
pub const PROFILE_WAN_T2I: &str = "wan-t2i";
/// Image-to-video from a single keyframe.
pub const PROFILE_WAN_I2V: &str = "wan-i2v";
/// First/last-frame conditioned video (bookend segments).
pub const PROFILE_WAN_FLF2V: &str = "wan-flf2v";

/// A workflow profile and its node requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeProfile {
    pub id: &'static str,
    pub required_nodes: &'static [&'static str],
    /// Profile to run instead when this one's nodes are absent.
    pub fallback: Option<&'static str>,
}

/// Static profile table.
pub const NODE_PROFILES: &[NodeProfile] = &[
    NodeProfile {
        id: PROFILE_WAN_T2I,
        required_nodes: &[
            "UNETLoader",
            "CLIPLoader",
            "VAELoader",
            "CLIPTextEncode",
            "EmptySD3LatentImage",
            "KSampler",
            "VAEDecode",
            "SaveImage",
        ],
        fallback: None,
    },
    NodeProfile {
        id: PROFILE_WAN_I2V,
        required_nodes: &[
            "LoadImage",
            "UNETLoader",
            "CLIPLoader",
            "VAELoader",
            "CLIPTextEncode",
            "WanImageToVideo",
            "KSampler",
            "VAEDecode",
            "VHS_VideoCombine",
        ],
        fallback: None,
    },
    NodeProfile {
        id: PROFILE_WAN_FLF2V,
        required_nodes: &[
            "LoadImage",
            "UNETLoader",
            "CLIPLoader",
            "VAELoader",
            "CLIPTextEncode",
            "WanFirstLastFrameToVideo",
            "KSampler",
            "VAEDecode",
            "VHS_VideoCombine",
        ],
        fallback: Some(PROFILE_WAN_I2V),
    },
];

/// Look up a profile by id.
pub fn find_profile(id: &str) -> Option<&'static NodeProfile> {
    NODE_PROFILES.iter().find(|p| p.id == id)
}

/// Ids of every known profile.
pub fn profile_ids() -> Vec<&'static str> {
    NODE_PROFILES.iter().map(|p| p.id).collect()
}

/// Required node types of `profile` absent from `available`, in table order.
pub fn missing_nodes(profile: &NodeProfile, available: &HashSet<String>) -> Vec<String> {
    profile
        .required_nodes
        .iter()
        .filter(|n| !available.contains(**n))
        .map(|n| n.to_string())
        .collect()
}

/// Result of matching a profile (and its fallback) against the catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileResolution {
    /// The profile that can actually run, if any.
    pub usable_profile: Option<&'static str>,
    /// Nodes missing for the requested profile.
    pub missing: Vec<String>,
    pub used_fallback: bool,
}

/// Decide which profile can run given the server's node catalogue.
pub fn resolve_profile(profile: &NodeProfile, available: &HashSet<String>) -> ProfileResolution {
    let missing = missing_nodes(profile, available);
    if missing.is_empty() {
        return ProfileResolution {
            usable_profile: Some(profile.id),
            missing,
            used_fallback: false,
        };
    }

    let fallback = profile
        .fallback
        .and_then(find_profile)
        .filter(|fb| missing_nodes(fb, available).is_empty());

    ProfileResolution {
        usable_profile: fallback.map(|fb| fb.id),
        missing,
        used_fallback: fallback.is_some(),
    }
}
