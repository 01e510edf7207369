//! The rollout agent: a generator and tokenizer plus the sampling policy the
//! strategies use when they ask for the next utterance.
//!
//! Strategies never call the [`Generator`] directly. They call
//! [`Agent::act`] for the plain policy and [`Agent::explore`] when they want
//! diverse candidates; both honor the agent's generation timeout.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{Generator, SamplingConfig, Tokenizer};
use crate::trajectory::{ExperienceOutput, Transcript};

/// Default temperature used for diversified candidate generation.
pub const DEFAULT_EXPLORATION_TEMPERATURE: f64 = 0.7;

/// Default upper bound on a single generation call.
pub const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone)]
pub struct Agent {
    generator: Arc<dyn Generator>,
    tokenizer: Arc<dyn Tokenizer>,
    sampling: SamplingConfig,
    exploration_temperature: f64,
    timeout: Duration,
}

impl Agent {
    pub fn new(generator: Arc<dyn Generator>, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            generator,
            tokenizer,
            sampling: SamplingConfig::default(),
            exploration_temperature: DEFAULT_EXPLORATION_TEMPERATURE,
            timeout: DEFAULT_GENERATION_TIMEOUT,
        }
    }

    pub fn with_sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_exploration_temperature(mut self, temperature: f64) -> Self {
        self.exploration_temperature = temperature;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn sampling(&self) -> &SamplingConfig {
        &self.sampling
    }

    pub fn tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    /// Next utterance under the plain sampling configuration.
    pub async fn act(&self, transcript: &str) -> Result<String> {
        self.generate(transcript, &self.sampling).await
    }

    /// Next utterance under the diversified (higher temperature) configuration.
    pub async fn explore(&self, transcript: &str) -> Result<String> {
        let sampling = self.sampling.with_temperature(self.exploration_temperature);
        self.generate(transcript, &sampling).await
    }

    async fn generate(&self, transcript: &str, sampling: &SamplingConfig) -> Result<String> {
        match tokio::time::timeout(self.timeout, self.generator.generate(transcript, sampling)).await
        {
            Ok(result) => {
                let utterance = result?;
                debug!(len = utterance.len(), temperature = sampling.temperature, "agent generated");
                Ok(utterance)
            }
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs_f64(), "generation timed out");
                Err(Error::GenerationFailure(format!(
                    "generation timed out after {:?}",
                    self.timeout
                )))
            }
        }
    }

    /// Package a finished transcript with this agent's tokenizer.
    pub fn package(&self, transcript: Transcript, reward: f64) -> ExperienceOutput {
        transcript.into_experience(reward, self.tokenizer.as_ref())
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("sampling", &self.sampling)
            .field("exploration_temperature", &self.exploration_temperature)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Split a ReAct-style utterance into `(thought, action)`.
///
/// The last line starting with `Action:` (either case) carries the action and
/// everything before it is the thought. Without such a line the whole
/// utterance is the action and the thought is empty.
pub fn split_thought(utterance: &str) -> (String, String) {
    let lines: Vec<&str> = utterance.lines().collect();
    let action_line = lines.iter().rposition(|line| {
        let trimmed = line.trim_start();
        trimmed.starts_with("Action:") || trimmed.starts_with("action:")
    });

    match action_line {
        Some(idx) => {
            let thought = lines[..idx].join("\n").trim().to_string();
            let line = lines[idx].trim();
            let action = line
                .strip_prefix("Action:")
                .or_else(|| line.strip_prefix("action:"))
                .unwrap_or(line)
                .trim()
                .to_string();
            (thought, action)
        }
        None => (String::new(), utterance.trim().to_string()),
    }
}
