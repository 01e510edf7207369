//! OpenAI-compatible text completion client.
//!
//! Rollouts work on raw transcript text, so the client talks to the plain
//! `/completions` endpoint (served by vLLM, TGI and most OpenAI-compatible
//! servers) instead of the chat endpoint. The transcript is sent as the prompt
//! with an `"\nAssistant:"` cue, and generation stops at the next human turn.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Generator, SamplingConfig};
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: String,
    temperature: f64,
    top_p: f64,
    max_tokens: usize,
    stop: [&'static str; 1],
}

/// A single completion choice returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: usize,
    pub text: String,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Token usage statistics for a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// A completion response from the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub id: String,
    pub choices: Vec<CompletionChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for an OpenAI-compatible completions API.
#[derive(Debug, Clone)]
pub struct CompletionClient {
    api_base: String,
    api_key: String,
    model_id: String,
    http: reqwest::Client,
}

impl CompletionClient {
    /// Create a client pointing at `api_base` (e.g. `"http://localhost:8000/v1"`).
    pub fn new(api_base: &str, api_key: &str, model_id: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model_id: model_id.to_string(),
            http,
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Calls `POST {api_base}/completions` and returns the parsed response.
    pub async fn complete(
        &self,
        transcript: &str,
        sampling: &SamplingConfig,
    ) -> Result<CompletionResponse> {
        let url = format!("{}/completions", self.api_base);
        debug!(
            model = %self.model_id,
            temperature = sampling.temperature,
            max_tokens = sampling.max_tokens,
            "sending completion request"
        );

        let body = CompletionRequest {
            model: &self.model_id,
            prompt: format!("{transcript}\nAssistant:"),
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            max_tokens: sampling.max_tokens,
            stop: ["\nHuman:"],
        };

        let mut request = self.http.post(&url).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| Error::GenerationFailure(format!("completion request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::GenerationFailure(format!(
                "completion API returned {status}: {text}"
            )));
        }

        let completion: CompletionResponse = resp.json().await.map_err(|e| {
            Error::GenerationFailure(format!("failed to parse completion response: {e}"))
        })?;

        if let Some(usage) = &completion.usage {
            debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "completion succeeded"
            );
        }
        Ok(completion)
    }
}

#[async_trait]
impl Generator for CompletionClient {
    async fn generate(&self, transcript: &str, sampling: &SamplingConfig) -> Result<String> {
        let completion = self.complete(transcript, sampling).await?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.text.trim().to_string())
            .ok_or_else(|| Error::GenerationFailure("completion returned no choices".into()))
    }
}
