//! Trajectory types for recording agent-environment interactions.
//!
//! This module provides:
//! - [`types::ConversationMessage`] and [`types::Role`] -- individual turns.
//! - [`types::Transcript`] -- the incremental transcript builder every
//!   strategy uses, which also derives token masks.
//! - [`types::ExperienceOutput`] -- one finished rollout path.
//! - [`types::TrajectoryRecord`] -- the persisted body of an experience.
//! - [`types::TrajectoryNode`] -- the exploration tree of the tree strategy.

pub mod types;

pub use types::{
    ConversationMessage, ExperienceOutput, Role, TrajectoryNode, TrajectoryRecord, Transcript,
};
