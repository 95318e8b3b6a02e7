//! Session-local caches owned by the session worker.
//!
//! - `graph`: per-device graph versions and execution history.
//! - `tensor`: step-indexed tensor records under a byte budget.

pub mod graph;
pub mod tensor;
