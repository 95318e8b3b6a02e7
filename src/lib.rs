#![forbid(unsafe_code)]

//! `tensorwatch`: live watchpoint debugger for distributed model training.
//!
//! A training process streams heartbeats, graph definitions, and tensor
//! chunks to the debugger; one worker per session reassembles tensors,
//! evaluates watchpoints, and drives the pause/step protocol while dashboard
//! readers poll published snapshots through [`api`].

pub mod api;
pub mod cache;
pub mod config;
pub mod errors;
pub mod ipc;
pub mod models;
pub mod orchestrator;
pub mod stream;
pub mod watchpoint;

pub use config::GlobalConfig;
pub use errors::{AppError, ErrorKind, Result};
pub use orchestrator::control::SessionHandle;
pub use orchestrator::session_manager::SessionManager;
