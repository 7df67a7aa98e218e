//! Generation worker: admission control, retrying execution with circuit
//! breaking, a single-slot task queue, and the bookend video runner, all
//! driven against a ComfyUI server.

pub mod admission;
pub mod backend;
pub mod bookend;
pub mod config;
pub mod engine;
pub mod events;
pub mod poll;
pub mod queue;
pub mod splice;
