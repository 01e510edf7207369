//! The generation capability consumed by the rollout strategies.
//!
//! The model and tokenizer are opaque to the rest of the crate: a
//! [`Generator`] turns transcript text into the next agent utterance and a
//! [`Tokenizer`] turns text into token ids. Concrete implementations:
//! - [`api::CompletionClient`] -- OpenAI-compatible `/completions` client.
//! - [`tokenizer::ByteTokenizer`] -- UTF-8 byte tokenizer.
//! - [`scripted::ScriptedGenerator`] -- canned utterances for tests and
//!   offline runs.

pub mod api;
pub mod scripted;
pub mod tokenizer;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use api::CompletionClient;
pub use scripted::ScriptedGenerator;
pub use tokenizer::ByteTokenizer;

/// Sampling parameters for a single generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: usize,
}

impl SamplingConfig {
    /// A copy of this configuration with a different temperature.
    pub fn with_temperature(&self, temperature: f64) -> Self {
        Self {
            temperature,
            ..self.clone()
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            max_tokens: 512,
        }
    }
}

/// Produces the next agent utterance for a transcript.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate the agent's next turn given the full transcript text.
    ///
    /// Failures are reported as [`crate::Error::GenerationFailure`].
    async fn generate(&self, transcript: &str, sampling: &SamplingConfig) -> Result<String>;
}

/// Pure text-to-token-ids function.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;
}

impl<F> Tokenizer for F
where
    F: Fn(&str) -> Vec<u32> + Send + Sync,
{
    fn encode(&self, text: &str) -> Vec<u32> {
        self(text)
    }
}
