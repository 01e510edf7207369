//! rlforge: rollout orchestration for training LLM agents
//!
//! Runs an agent against stateful text environments with a sequential,
//! tree-exploring or search-guided strategy, schedules many rollouts on a
//! bounded worker pool and stores the resulting trajectories.

pub mod agent;
pub mod config;
pub mod controller;
pub mod env;
pub mod error;
pub mod model;
pub mod storage;
pub mod strategy;
pub mod trajectory;

pub use error::{Error, Result};
