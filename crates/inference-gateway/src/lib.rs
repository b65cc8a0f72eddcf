// inference-gateway/crates/inference-gateway/src/lib.rs

pub mod config;
pub mod error;
pub mod metrics;
pub mod model_runtime;
pub mod orchestrator;
pub mod protocol;
pub mod telemetry;
pub mod template;

#[cfg(test)]
mod test_support;

// Public API exports
pub use config::{GatewayConfig, ModelConfig};
pub use error::{BackendError, GatewayError};
pub use orchestrator::Orchestrator;

// Backend lifecycle exports
pub use model_runtime::{
    BackendDescriptor, BackendHandle, BackendKind, BackendLauncher, KindLocks, ModelLoader, ProcessLauncher,
};
pub use protocol::{Backend, EchoEngine, Engine, HttpBackendClient};
