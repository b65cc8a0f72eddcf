//! Bringing a backend from descriptor to a reachable client.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::descriptor::{BackendDescriptor, RetryPolicy};
use super::process::{BackendProcess, ProcessControl, ProcessState};
use crate::error::{BackendError, GatewayError};
use crate::protocol::{Backend, HttpBackendClient};

/// A backend that answered its health check. `process` is `None` for
/// external backends, which the gateway never stops.
pub struct LaunchedBackend {
    pub address: String,
    pub client: Arc<dyn Backend>,
    pub process: Option<Box<dyn ProcessControl>>,
}

impl std::fmt::Debug for LaunchedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedBackend")
            .field("address", &self.address)
            .field("supervised", &self.process.is_some())
            .finish()
    }
}

#[async_trait]
pub trait BackendLauncher: Send + Sync {
    /// Spawn (or attach to) the backend and wait until it is healthy. Does not
    /// issue `Load`. On failure nothing is left running.
    async fn launch(&self, descriptor: &BackendDescriptor) -> Result<LaunchedBackend, GatewayError>;
}

/// Launches backends as local subprocesses from the asset directory.
pub struct ProcessLauncher {
    stop_grace: Duration,
}

impl ProcessLauncher {
    pub fn new(stop_grace: Duration) -> Self {
        Self { stop_grace }
    }

    /// `<asset_dir>/backend-assets/grpc/<kind>`, falling back to `PATH`.
    pub fn executable_for(descriptor: &BackendDescriptor) -> Result<PathBuf, GatewayError> {
        let bundled = bundled_executable(&descriptor.asset_dir, descriptor.kind.name());
        if bundled.is_file() {
            return Ok(bundled);
        }

        which::which(descriptor.kind.name()).map_err(|_| {
            GatewayError::load(
                &descriptor.model,
                format!(
                    "no executable for backend {} (looked in {} and PATH)",
                    descriptor.kind,
                    bundled.display()
                ),
            )
        })
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

pub fn bundled_executable(asset_dir: &Path, kind: &str) -> PathBuf {
    asset_dir.join("backend-assets").join("grpc").join(kind)
}

#[async_trait]
impl BackendLauncher for ProcessLauncher {
    async fn launch(&self, descriptor: &BackendDescriptor) -> Result<LaunchedBackend, GatewayError> {
        if let Some(address) = &descriptor.external_address {
            info!("Using external backend {} at {}", descriptor.kind, address);
            let client = HttpBackendClient::new(address);
            wait_until_ready(&client, descriptor.retry, None)
                .await
                .map_err(|e| GatewayError::load(&descriptor.model, e))?;
            return Ok(LaunchedBackend {
                address: address.clone(),
                client: Arc::new(client),
                process: None,
            });
        }

        let executable = Self::executable_for(descriptor)?;
        let mut process = BackendProcess::spawn(&descriptor.model, &executable, self.stop_grace)?;
        let address = process.address().to_string();
        let client = HttpBackendClient::new(&address);

        info!("Backend process started, waiting for health check...");
        match wait_until_ready(&client, descriptor.retry, Some(&mut process)).await {
            Ok(()) => {
                process.set_state(ProcessState::Ready);
                Ok(LaunchedBackend {
                    address,
                    client: Arc::new(client),
                    process: Some(Box::new(process)),
                })
            }
            Err(e) => {
                process.stop().await;
                Err(GatewayError::load(&descriptor.model, e))
            }
        }
    }
}

/// Poll `Health` until it answers, up to `retry.attempts` times. Gives up early
/// when the supervised process has already exited.
async fn wait_until_ready(
    client: &HttpBackendClient,
    retry: RetryPolicy,
    mut process: Option<&mut BackendProcess>,
) -> Result<(), String> {
    let mut last_error = BackendError::Transport("no health check attempted".into());

    for attempt in 1..=retry.attempts {
        match client.health().await {
            Ok(_) => {
                info!("Backend at {} ready after {} attempt(s)", client.base_url(), attempt);
                return Ok(());
            }
            Err(e) => {
                debug!("Health check {}/{} failed: {}", attempt, retry.attempts, e);
                last_error = e;
            }
        }

        if let Some(process) = process.as_deref_mut() {
            if !process.is_alive() {
                return Err("backend process exited before becoming ready".to_string());
            }
        }

        if attempt < retry.attempts {
            sleep(retry.delay).await;
        }
    }

    warn!("Backend at {} never became ready", client.base_url());
    Err(format!(
        "backend not ready after {} attempts: {}",
        retry.attempts, last_error
    ))
}
