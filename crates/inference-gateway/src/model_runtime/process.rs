//! Backend process supervisor
//!
//! Owns the external process behind a backend handle: spawn on a derived
//! loopback address, OS-level liveness, and graceful stop with escalation.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Ready,
    Unresponsive,
    Stopped,
}

/// Control surface of a supervised process. Implemented by `BackendProcess`;
/// the registry only ever talks to this trait.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    fn state(&self) -> ProcessState;

    fn set_state(&mut self, state: ProcessState);

    /// OS-level liveness, independent of RPC health.
    fn is_alive(&mut self) -> bool;

    /// Best-effort graceful termination. Always leaves the process `Stopped`.
    async fn stop(&mut self);
}

pub struct BackendProcess {
    model: String,
    address: String,
    child: Option<Child>,
    state: ProcessState,
    stop_grace: Duration,
}

impl BackendProcess {
    /// Launch `executable --addr 127.0.0.1:<port>`. Does not wait for readiness.
    pub fn spawn(model: &str, executable: &Path, stop_grace: Duration) -> Result<Self, GatewayError> {
        let address = free_local_address()?;

        info!("Starting backend for model {}", model);
        info!("  Binary: {}", executable.display());
        info!("  Address: {}", address);

        let mut cmd = Command::new(executable);
        cmd.arg("--addr")
            .arg(&address)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            GatewayError::load(model, format!("failed to spawn {}: {}", executable.display(), e))
        })?;

        forward_output(model.to_string(), child.stdout.take());
        forward_output(model.to_string(), child.stderr.take());

        Ok(Self {
            model: model.to_string(),
            address,
            child: Some(child),
            state: ProcessState::Starting,
            stop_grace,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl ProcessControl for BackendProcess {
    fn state(&self) -> ProcessState {
        self.state
    }

    fn set_state(&mut self, state: ProcessState) {
        self.state = state;
    }

    fn is_alive(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };

        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!("Backend process for {} exited: {}", self.model, status);
                self.state = ProcessState::Stopped;
                false
            }
            Err(e) => {
                warn!("Could not query backend process for {}: {}", self.model, e);
                false
            }
        }
    }

    async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            self.state = ProcessState::Stopped;
            return;
        };

        if let Ok(Some(_)) = child.try_wait() {
            self.state = ProcessState::Stopped;
            return;
        }

        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok() {
                    match tokio::time::timeout(self.stop_grace, child.wait()).await {
                        Ok(_) => {
                            info!("Backend process for {} stopped", self.model);
                            self.state = ProcessState::Stopped;
                            return;
                        }
                        Err(_) => warn!(
                            "Backend process for {} ignored SIGTERM for {:?}, killing",
                            self.model, self.stop_grace
                        ),
                    }
                }
            }
        }

        match child.kill().await {
            Ok(()) => info!("Backend process for {} killed", self.model),
            Err(e) => warn!("Failed to kill backend process for {}: {}", self.model, e),
        }
        self.state = ProcessState::Stopped;
    }
}

/// Bind an ephemeral loopback port and release it for the child to take.
fn free_local_address() -> std::io::Result<String> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    Ok(format!("127.0.0.1:{}", port))
}

fn forward_output<R>(model: String, stream: Option<R>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(stream) = stream else {
        return;
    };
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(model = %model, "{}", line);
        }
    });
}
