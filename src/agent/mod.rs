//! Agent module: the policy the rollout strategies query.
//!
//! The [`Agent`] wraps an opaque generator and tokenizer together with the
//! plain and diversified sampling configurations and a generation timeout.

pub mod agent;

pub use agent::{Agent, split_thought};
