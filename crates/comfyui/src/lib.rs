//! ComfyUI WebSocket and REST client library.
//!
//! Provides HTTP API wrappers for every endpoint the orchestration core
//! consumes, classification of `/history` responses, system-stats
//! decoding, typed WebSocket message parsing, and a per-prompt progress
//! follower.

pub mod api;
pub mod client;
pub mod history;
pub mod messages;
pub mod progress;
pub mod stats;
