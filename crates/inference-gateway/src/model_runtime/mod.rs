//! Backend lifecycle
//!
//! Everything between a model name and a live, loaded backend:
//!
//! - `descriptor`: what to launch and with which engine options
//! - `process`: the supervised OS process behind a backend
//! - `launcher`: spawn (or attach) and wait for health
//! - `handle`: the shared, health-tracked backend bound to a model
//! - `loader`: the model registry with exactly-once resolution
//! - `kind_locks`: one-call-at-a-time per backend kind
pub mod descriptor;
pub mod process;
pub mod launcher;
pub mod handle;
pub mod loader;
pub mod kind_locks;
pub use descriptor::{BackendDescriptor, BackendKind, DescriptorBuilder, RetryPolicy};
pub use process::{BackendProcess, ProcessControl, ProcessState};
pub use launcher::{BackendLauncher, LaunchedBackend, ProcessLauncher};
pub use handle::BackendHandle;
pub use loader::{LoaderOptions, ModelLoader};
pub use kind_locks::{KindGuard, KindLocks};
