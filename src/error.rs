//! Error taxonomy shared by every rollout component.
//!
//! Environment transport failures are converted to terminal observations
//! inside the clients, so `EnvironmentUnavailable` only escapes from `reset`.
//! Generation failures abort a single rollout; storage failures surface to the
//! controller's caller; the `Unknown*` variants are startup configuration errors.

/// Errors produced by the rollout library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("environment unavailable: {0}")]
    EnvironmentUnavailable(String),

    #[error("generation failed: {0}")]
    GenerationFailure(String),

    #[error("failed to write trajectory: {0}")]
    StorageWriteFailure(String),

    #[error("failed to read trajectory: {0}")]
    StorageReadFailure(String),

    #[error("unknown rollout strategy: {0:?}")]
    UnknownStrategy(String),

    #[error("unknown storage backend: {0:?}")]
    UnknownStorageBackend(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;
