//! Pure domain logic for the generation orchestration core.
//!
//! Nothing in this crate performs I/O. Policies, state machines and
//! evaluation functions live here so they can be tested in isolation;
//! the `worker` crate drives them against a live ComfyUI server.

pub mod bookend;
pub mod circuit_breaker;
pub mod error;
pub mod hardware;
pub mod node_profiles;
pub mod preflight;
pub mod preset;
pub mod quality_gate;
pub mod retry;
pub mod scheduling;
pub mod types;
pub mod workflow;
