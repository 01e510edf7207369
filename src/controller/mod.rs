//! Rollout scheduling.
//!
//! The [`RolloutController`] runs one rollout per task index. Each rollout
//! gets its own forked environment client, runs the configured strategy and
//! optionally persists what it produced. A failing index is reported and
//! never takes its siblings down.

mod controller;
mod task;

pub use controller::{RolloutController, RolloutFailure, RolloutReport, RolloutRequest};
pub use task::Task;
