//! Error taxonomy for the gateway core.
//!
//! `BackendError` is what a single RPC against a backend can produce. The
//! variants matter to the registry: a transport failure means the process is
//! unreachable and the handle must be probed (and possibly torn down) on the
//! next resolution, while an engine failure leaves the handle valid.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The backend endpoint could not be reached or the connection broke mid-call.
    #[error("backend unreachable: {0}")]
    Transport(String),

    /// The backend ran the call and reported a failure.
    #[error("{0}")]
    Engine(String),

    /// The backend answered with something that does not decode.
    #[error("invalid backend response: {0}")]
    Protocol(String),
}

impl BackendError {
    pub fn is_transport(&self) -> bool {
        matches!(self, BackendError::Transport(_))
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed loading backend for model {model}: {reason}")]
    Load { model: String, reason: String },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid backend descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("template {name}: {reason}")]
    Template { name: String, reason: String },

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn load(model: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        GatewayError::Load {
            model: model.into(),
            reason: reason.to_string(),
        }
    }
}
