//! Watchpoint engine: registry, condition evaluation, and hit recording.
//!
//! - `pattern`: glob matching over hierarchical node names.
//! - `condition`: evaluation and validation of [`Condition`](crate::models::watchpoint::Condition)s.
//! - `engine`: the per-session registry and hit log.

pub mod condition;
pub mod engine;
pub mod pattern;
