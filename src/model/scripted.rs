//! A deterministic [`Generator`] that replays canned utterances.
//!
//! Used by the test suites and by `--mock` runs so the full rollout pipeline
//! can be exercised without a model server.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{Generator, SamplingConfig};
use crate::error::{Error, Result};

/// How the next canned utterance is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptMode {
    /// The utterance for agent turn `n` is `responses[n]` (the last one is
    /// repeated once the script runs out). Depends only on the transcript.
    ByTurn,
    /// Every call returns the next utterance in rotation.
    Cycle,
}

#[derive(Debug)]
pub struct ScriptedGenerator {
    responses: Vec<String>,
    mode: ScriptMode,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn by_turn<S: Into<String>>(responses: impl IntoIterator<Item = S>) -> Self {
        Self::with_mode(responses, ScriptMode::ByTurn)
    }

    pub fn cycling<S: Into<String>>(responses: impl IntoIterator<Item = S>) -> Self {
        Self::with_mode(responses, ScriptMode::Cycle)
    }

    fn with_mode<S: Into<String>>(responses: impl IntoIterator<Item = S>, mode: ScriptMode) -> Self {
        Self {
            responses: responses.into_iter().map(Into::into).collect(),
            mode,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `generate` calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Number of agent turns already present in a rendered transcript.
pub fn agent_turns_in(transcript: &str) -> usize {
    transcript.matches("\nAssistant: ").count()
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, transcript: &str, _sampling: &SamplingConfig) -> Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.responses.is_empty() {
            return Err(Error::GenerationFailure("script has no responses".into()));
        }
        let index = match self.mode {
            ScriptMode::ByTurn => agent_turns_in(transcript).min(self.responses.len() - 1),
            ScriptMode::Cycle => call % self.responses.len(),
        };
        Ok(self.responses[index].clone())
    }
}
