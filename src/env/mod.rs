//! Environment clients.
//!
//! Every environment implements the [`EnvClient`] trait so that the rollout
//! strategies and the controller can interact with it uniformly.
//!
//! Included clients:
//! - **HTTP** ([`http`]) -- a remote environment exposing `/reset` and `/step`.
//! - **Scripted** ([`scripted`]) -- deterministic in-process tasks for tests
//!   and offline runs.

pub mod http;
pub mod scripted;
pub mod traits;

pub use http::HttpEnvClient;
pub use scripted::{ScriptedEnvClient, ScriptedTask};
pub use traits::{EnvClient, StepOutput};
