//! Session orchestration modules.
//!
//! Covers the per-session state machine and its worker task, heartbeat
//! liveness, the caller-facing control handle, and the session table.

pub mod control;
pub mod heartbeat;
pub mod session;
pub mod session_manager;
pub(crate) mod worker;
