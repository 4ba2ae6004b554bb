//! Error types for the Tandem domain.
//!
//! Uses `thiserror` for ergonomic error definitions. Each bounded context
//! has its own error enum; `Error` aggregates them at the run boundary.
//!
//! The taxonomy is deliberate:
//! - configuration problems fail at construction (`ConfigError`)
//! - transport problems surface synchronously from `open_stream`
//! - protocol and model problems arrive as a single `Event::Error`
//! - tool handler failures are NOT errors at this level; they are rendered
//!   into the tool-result text so the model can react
//! - cancellation is a distinguished variant, not an application failure

use thiserror::Error;

/// The top-level error type returned by agent runs.
#[derive(Debug, Error)]
pub enum Error {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("run cancelled")]
    Cancelled,
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from a model adapter.
///
/// `Api` and `Network` are transport errors and are only ever returned
/// synchronously from `Model::open_stream`. The remaining variants travel
/// through the event channel as `Event::Error`.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("api error: status={status}, body={body}")]
    Api { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("stream interrupted: {0}")]
    Interrupted(String),
}

/// Errors from a session store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from a tool handler.
///
/// These never abort a run; the orchestrator renders them into the
/// tool-result text for the corresponding call id.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    Unknown(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("{0}")]
    Failed(String),
}

/// Errors detected while constructing an agent or adapter.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),

    #[error("unknown model id: {0}")]
    UnknownModel(String),

    #[error("invalid store path: {0}")]
    InvalidPath(String),
}
