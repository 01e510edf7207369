//! Environment client for environments served over HTTP.
//!
//! Expected endpoints:
//! - `POST {base_url}/reset` -- body `{"idx": <int>}`, returns `{"state": ...}`
//! - `POST {base_url}/step`  -- body `{"action": ..., "idx": <int>}`, returns
//!   `{"state": ..., "reward": <float>, "done": <bool>}`; missing `reward` and
//!   `done` default to `0.0` and `false`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::traits::{EnvClient, StepOutput};
use crate::error::{Error, Result};
use crate::trajectory::ConversationMessage;

#[derive(Debug, Serialize)]
struct ResetRequest {
    idx: usize,
}

#[derive(Debug, Serialize)]
struct StepRequest<'a> {
    action: &'a str,
    idx: usize,
}

#[derive(Debug, Deserialize)]
struct ResetResponse {
    state: String,
}

#[derive(Debug, Deserialize)]
struct StepResponse {
    state: String,
    #[serde(default)]
    reward: f64,
    #[serde(default)]
    done: bool,
}

/// An environment client that talks to a remote server.
///
/// Forking copies the client-side state (last state, current idx). Servers
/// that scope their state by `idx` keep one episode per idx, so isolation of
/// remote state is only as strong as the server's own bookkeeping.
#[derive(Debug, Clone)]
pub struct HttpEnvClient {
    base_url: String,
    http: reqwest::Client,
    data_len: usize,
    current_state: String,
    current_idx: usize,
    conversation_start: Arc<[ConversationMessage]>,
}

impl HttpEnvClient {
    /// Create a client for the server at `base_url` with `data_len` tasks.
    pub fn new(base_url: &str, timeout: Duration, data_len: usize) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            data_len,
            current_state: String::new(),
            current_idx: 0,
            conversation_start: Arc::from(Vec::new()),
        })
    }

    /// Prepend `prefix` to every rollout against this environment.
    pub fn with_conversation_start(mut self, prefix: Vec<ConversationMessage>) -> Self {
        self.conversation_start = Arc::from(prefix);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The idx set by the last `reset`, sent along with every step.
    pub fn current_idx(&self) -> usize {
        self.current_idx
    }

    async fn post<B, T>(&self, endpoint: &str, body: &B) -> std::result::Result<T, String>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}/{endpoint}", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| format!("request to {url} failed: {e}"))?
            .error_for_status()
            .map_err(|e| format!("{url} returned an error: {e}"))?;
        resp.json::<T>()
            .await
            .map_err(|e| format!("failed to decode response from {url}: {e}"))
    }
}

#[async_trait]
impl EnvClient for HttpEnvClient {
    fn size(&self) -> usize {
        self.data_len
    }

    async fn reset(&mut self, idx: usize) -> Result<()> {
        self.current_idx = idx;
        match self.post::<_, ResetResponse>("reset", &ResetRequest { idx }).await {
            Ok(resp) => {
                debug!(idx, "environment reset");
                self.current_state = resp.state;
                Ok(())
            }
            Err(reason) => {
                warn!(idx, error = %reason, "environment reset failed");
                self.current_state = format!("Error: {reason}");
                Err(Error::EnvironmentUnavailable(reason))
            }
        }
    }

    fn observe(&self) -> &str {
        &self.current_state
    }

    async fn step(&mut self, action: &str) -> StepOutput {
        let body = StepRequest {
            action,
            idx: self.current_idx,
        };
        match self.post::<_, StepResponse>("step", &body).await {
            Ok(resp) => {
                self.current_state = resp.state;
                StepOutput {
                    state: self.current_state.clone(),
                    reward: resp.reward,
                    done: resp.done,
                }
            }
            Err(reason) => {
                warn!(idx = self.current_idx, error = %reason, "environment step failed");
                StepOutput::failure(reason)
            }
        }
    }

    fn conversation_start(&self) -> &[ConversationMessage] {
        &self.conversation_start
    }

    fn fork(&self) -> Box<dyn EnvClient> {
        Box::new(self.clone())
    }
}
