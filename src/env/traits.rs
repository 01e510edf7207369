//! Core environment-client trait and the step result type.
//!
//! Every environment the controller can roll out against implements
//! [`EnvClient`], so strategies drive episodes uniformly and the controller
//! can hand each worker its own copy through [`EnvClient::fork`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::trajectory::ConversationMessage;

/// Result of one environment transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub state: String,
    pub reward: f64,
    pub done: bool,
}

impl StepOutput {
    /// The terminal observation reported when a step could not be completed.
    pub fn failure(reason: impl std::fmt::Display) -> Self {
        Self {
            state: format!("Error: {reason}"),
            reward: 0.0,
            done: true,
        }
    }
}

/// A stateful environment the agent interacts with.
///
/// `step` never fails: transport problems come back as a terminal
/// [`StepOutput`] so rollout loops always run to completion. `reset` reports
/// [`crate::Error::EnvironmentUnavailable`] but still leaves a diagnostic
/// observation behind.
#[async_trait]
pub trait EnvClient: Send + Sync {
    /// Number of selectable task indices.
    fn size(&self) -> usize;

    /// Load task `idx` and make its initial state observable.
    async fn reset(&mut self, idx: usize) -> Result<()>;

    /// Last known state. Never touches the network.
    fn observe(&self) -> &str;

    /// Apply an action and return the resulting transition.
    async fn step(&mut self, action: &str) -> StepOutput;

    /// Fixed prefix prepended to every rollout's transcript.
    fn conversation_start(&self) -> &[ConversationMessage] {
        &[]
    }

    /// An independent copy of this client.
    ///
    /// Stepping the copy must not affect this client or any other copy.
    fn fork(&self) -> Box<dyn EnvClient>;
}
