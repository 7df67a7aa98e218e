//! GPU resource accounting.
//!
//! Pure logic, no network access. The admission controller fetches the
//! server's device list and hands the numbers in here.

pub mod vram;
