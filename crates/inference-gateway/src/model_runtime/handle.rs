use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use super::descriptor::BackendKind;
use super::launcher::LaunchedBackend;
use super::process::{ProcessControl, ProcessState};
use crate::protocol::Backend;

/// A live, loaded backend bound to one model name.
///
/// Shared by every request for that model. Health is soft state: callers mark
/// the handle unhealthy on transport failure and the registry decides on the
/// next resolution whether to reuse, restart or replace it.
pub struct BackendHandle {
    model_name: String,
    kind: BackendKind,
    address: String,
    client: Arc<dyn Backend>,
    process: Mutex<Option<Box<dyn ProcessControl>>>,
    external: bool,
    healthy: AtomicBool,
    unresponsive_strikes: AtomicU32,
}

impl BackendHandle {
    pub fn new(model_name: impl Into<String>, kind: BackendKind, launched: LaunchedBackend) -> Self {
        let external = launched.process.is_none();
        Self {
            model_name: model_name.into(),
            kind,
            address: launched.address,
            client: launched.client,
            process: Mutex::new(launched.process),
            external,
            healthy: AtomicBool::new(true),
            unresponsive_strikes: AtomicU32::new(0),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn kind(&self) -> &BackendKind {
        &self.kind
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn client(&self) -> &Arc<dyn Backend> {
        &self.client
    }

    pub fn is_external(&self) -> bool {
        self.external
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub async fn mark_healthy(&self) {
        self.healthy.store(true, Ordering::Release);
        self.unresponsive_strikes.store(0, Ordering::Release);
        self.set_process_state(ProcessState::Ready).await;
    }

    /// Called from inference paths when an RPC could not reach the backend.
    pub fn mark_unhealthy(&self) {
        if self.healthy.swap(false, Ordering::AcqRel) {
            warn!("Backend for {} marked unhealthy", self.model_name);
        }
    }

    /// Record a failed probe whose process is still running. Returns the
    /// number of consecutive failed probes.
    pub async fn record_unresponsive(&self) -> u32 {
        self.healthy.store(false, Ordering::Release);
        self.set_process_state(ProcessState::Unresponsive).await;
        self.unresponsive_strikes.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// External backends count as alive: their lifecycle is not ours to judge.
    pub async fn is_process_alive(&self) -> bool {
        if self.external {
            return true;
        }
        match self.process.lock().await.as_mut() {
            Some(process) => process.is_alive(),
            None => false,
        }
    }

    pub async fn process_state(&self) -> Option<ProcessState> {
        self.process.lock().await.as_ref().map(|p| p.state())
    }

    async fn set_process_state(&self, state: ProcessState) {
        if let Some(process) = self.process.lock().await.as_mut() {
            if process.state() != ProcessState::Stopped {
                process.set_state(state);
            }
        }
    }

    /// Stop the supervised process, if any. Idempotent.
    pub async fn stop(&self) {
        let process = self.process.lock().await.take();
        if let Some(mut process) = process {
            info!("Stopping backend for {} at {}", self.model_name, self.address);
            process.stop().await;
        }
    }
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("model_name", &self.model_name)
            .field("kind", &self.kind)
            .field("address", &self.address)
            .field("external", &self.external)
            .field("healthy", &self.is_healthy())
            .finish()
    }
}
