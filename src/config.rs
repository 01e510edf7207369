use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::SamplingConfig;

/// Complete configuration for a rollout run.
///
/// Every section has defaults, so a config file only needs the fields it
/// changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    pub env: EnvConfig,
    pub model: ModelConfig,
    pub strategy: StrategyConfig,
    pub storage: StorageConfig,
    pub controller: ControllerConfig,
}

/// Where the environment server lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Name the trajectories are stored under (default: "webshop").
    pub name: String,
    /// Scheme and host of the environment server (default: "http://127.0.0.1").
    pub server_base: String,
    /// Port of the environment server (default: 8000).
    pub port: u16,
    /// Full base URL; overrides `server_base` and `port` when set.
    pub base_url: Option<String>,
    /// Per-request timeout in seconds (default: 60).
    pub timeout_secs: u64,
    /// Number of task indices the server exposes (default: 100).
    pub data_len: usize,
}

impl EnvConfig {
    pub fn base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.clone(),
            None => format!("{}:{}", self.server_base.trim_end_matches('/'), self.port),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            name: "webshop".into(),
            server_base: "http://127.0.0.1".into(),
            port: 8000,
            base_url: None,
            timeout_secs: 60,
            data_len: 100,
        }
    }
}

/// Policy model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Base URL of the OpenAI-compatible completions API.
    pub api_base: String,
    /// Model identifier (e.g., "Qwen/Qwen2.5-7B-Instruct").
    pub model_id: String,
    /// API key; filled from `OPENAI_API_KEY` when empty.
    pub api_key: String,
    /// Upper bound on one generation call, in seconds (default: 120).
    pub timeout_secs: u64,
    /// Base sampling used for committed actions.
    pub sampling: SamplingConfig,
    /// Temperature used when generating diverse candidates (default: 0.7).
    pub exploration_temperature: f64,
}

impl ModelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:8000/v1".into(),
            model_id: "Qwen/Qwen2.5-7B-Instruct".into(),
            api_key: String::new(),
            timeout_secs: 120,
            sampling: SamplingConfig::default(),
            exploration_temperature: 0.7,
        }
    }
}

/// Which rollout strategy to run and its parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// "StandardReAct", "ToT" or "MCTS" (default: "StandardReAct").
    pub name: String,
    /// Candidates per node for tree exploration (default: 3).
    pub branch_factor: usize,
    /// Depth limit for tree exploration (default: 2).
    pub max_depth: usize,
    /// Simulations per search round (default: 50).
    pub num_simulations: usize,
    /// UCB1 exploration constant (default: 1.0).
    pub exploration_weight: f64,
    /// Candidates scored per search round (default: 5).
    pub num_candidates: usize,
    /// Agent turns played after the candidate in one simulation (default: 5).
    pub simulation_depth: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            name: "StandardReAct".into(),
            branch_factor: 3,
            max_depth: 2,
            num_simulations: 50,
            exploration_weight: 1.0,
            num_candidates: 5,
            simulation_depth: 5,
        }
    }
}

/// Trajectory persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// "file" or "document" (default: "file").
    pub backend: String,
    /// Root directory for the file backend, database file for the document
    /// backend (default: "trajectories").
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "file".into(),
            path: "trajectories".into(),
        }
    }
}

/// Controller scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Rollouts allowed to run at once (default: 10).
    pub max_workers: usize,
    /// Task indices submitted per batch in parallel mode (default: 10).
    pub batch_size: usize,
    /// Round limit per rollout; `None` runs until the environment is done
    /// (default: 10).
    pub max_rounds: Option<usize>,
    /// Run rollouts on the worker pool (default: true).
    pub parallel: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            batch_size: 10,
            max_rounds: Some(10),
            parallel: true,
        }
    }
}
