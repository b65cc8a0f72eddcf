//! Model registry
//!
//! Maps model names to live backend handles and owns the prompt template cache.
//! Resolution is exactly-once per model: concurrent callers for the same name
//! wait on that model's slot while callers for other models proceed. The
//! registry-wide lock only ever guards map bookkeeping and is never held
//! across a spawn or an RPC.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use super::descriptor::BackendDescriptor;
use super::handle::BackendHandle;
use super::launcher::BackendLauncher;
use crate::error::GatewayError;
use crate::metrics;
use crate::template::PromptTemplate;

/// Files in the model directory that are never models.
const NON_MODEL_SUFFIXES: &[&str] = &[".tmpl", ".keep", ".yaml", ".yml"];

#[derive(Debug, Clone, Copy)]
pub struct LoaderOptions {
    /// How many consecutive failed probes a still-running backend survives
    /// before it is torn down and reloaded.
    pub unresponsive_reuse_limit: u32,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            unresponsive_reuse_limit: 1,
        }
    }
}

#[derive(Default)]
struct ModelSlot {
    handle: tokio::sync::Mutex<Option<Arc<BackendHandle>>>,
}

#[derive(Default)]
struct RegistryState {
    slots: HashMap<String, Arc<ModelSlot>>,
    loaded: HashSet<String>,
    templates: HashMap<String, Arc<PromptTemplate>>,
}

pub struct ModelLoader {
    model_path: PathBuf,
    launcher: Arc<dyn BackendLauncher>,
    options: LoaderOptions,
    state: Mutex<RegistryState>,
}

impl ModelLoader {
    pub fn new(model_path: impl Into<PathBuf>, launcher: Arc<dyn BackendLauncher>, options: LoaderOptions) -> Self {
        Self {
            model_path: model_path.into(),
            launcher,
            options,
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    fn registry(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, model_name: &str) -> Arc<ModelSlot> {
        self.registry()
            .slots
            .entry(model_name.to_string())
            .or_default()
            .clone()
    }

    /// Return the live handle for `model_name`, loading it with `descriptor`
    /// when there is none or the existing one has to be replaced.
    pub async fn resolve(
        &self,
        model_name: &str,
        descriptor: &BackendDescriptor,
    ) -> Result<Arc<BackendHandle>, GatewayError> {
        let slot = self.slot(model_name);
        let mut current = slot.handle.lock().await;

        if let Some(handle) = current.as_ref() {
            if self.keep_existing(handle).await {
                debug!("Model already loaded: {}", model_name);
                return Ok(handle.clone());
            }
            handle.stop().await;
            *current = None;
            self.forget(model_name);
        }

        let handle = match self.load(model_name, descriptor).await {
            Ok(handle) => handle,
            Err(e) => {
                self.prune(model_name, &slot);
                return Err(e);
            }
        };
        *current = Some(handle.clone());
        self.registry().loaded.insert(model_name.to_string());
        metrics::inc_active_backends();
        Ok(handle)
    }

    async fn keep_existing(&self, handle: &BackendHandle) -> bool {
        if handle.client().is_healthy().await {
            handle.mark_healthy().await;
            return true;
        }

        if !handle.is_process_alive().await {
            warn!("Backend process for {} is gone, reloading", handle.model_name());
            return false;
        }

        let strikes = handle.record_unresponsive().await;
        if strikes <= self.options.unresponsive_reuse_limit {
            warn!(
                "Backend for {} not responding ({} of {} tolerated), reusing",
                handle.model_name(),
                strikes,
                self.options.unresponsive_reuse_limit
            );
            true
        } else {
            warn!(
                "Backend for {} still not responding after {} probes, restarting",
                handle.model_name(),
                strikes
            );
            false
        }
    }

    async fn load(
        &self,
        model_name: &str,
        descriptor: &BackendDescriptor,
    ) -> Result<Arc<BackendHandle>, GatewayError> {
        let kind = descriptor.kind.clone();
        info!("Loading model {} with backend {}", model_name, kind);

        let launched = match self.launcher.launch(descriptor).await {
            Ok(launched) => launched,
            Err(e) => {
                metrics::inc_backend_load(kind.name(), "error");
                return Err(e);
            }
        };

        let handle = BackendHandle::new(model_name, kind.clone(), launched);
        if let Err(e) = self.initialize(&handle, descriptor).await {
            warn!("Load of {} failed: {}", model_name, e);
            handle.stop().await;
            metrics::inc_backend_load(kind.name(), "error");
            return Err(e);
        }

        info!("Model {} loaded on {}", model_name, handle.address());
        metrics::inc_backend_load(kind.name(), "ok");
        Ok(Arc::new(handle))
    }

    async fn initialize(&self, handle: &BackendHandle, descriptor: &BackendDescriptor) -> Result<(), GatewayError> {
        let model_name = handle.model_name();
        let result = handle
            .client()
            .load(&descriptor.load_request())
            .await
            .map_err(|e| GatewayError::load(model_name, e))?;
        if !result.success {
            return Err(GatewayError::load(model_name, result.message));
        }

        self.template_for(model_name)?;
        Ok(())
    }

    fn forget(&self, model_name: &str) {
        if self.registry().loaded.remove(model_name) {
            metrics::dec_active_backends();
        }
    }

    /// Drop the empty `slot` from the map unless another caller holds it.
    /// Clones are only taken under the registry lock, so the count is stable here.
    fn prune(&self, model_name: &str, slot: &Arc<ModelSlot>) {
        let mut registry = self.registry();
        let idle = registry
            .slots
            .get(model_name)
            .is_some_and(|s| Arc::ptr_eq(s, slot) && Arc::strong_count(slot) == 2);
        if idle {
            registry.slots.remove(model_name);
        }
    }

    /// Compiled `<name>.tmpl` from the model directory, cached after first
    /// read. `Ok(None)` when no such file exists.
    pub fn template_for(&self, name: &str) -> Result<Option<Arc<PromptTemplate>>, GatewayError> {
        if let Some(template) = self.registry().templates.get(name) {
            return Ok(Some(template.clone()));
        }

        let file_name = format!("{}.tmpl", name);
        let Some(path) = self.model_file(&file_name) else {
            return Ok(None);
        };
        if !path.is_file() {
            return Ok(None);
        }

        let source = std::fs::read_to_string(&path)?;
        let template = Arc::new(PromptTemplate::compile(name, &source)?);
        debug!("Compiled template {}", path.display());

        let mut registry = self.registry();
        let cached = registry.templates.entry(name.to_string()).or_insert(template);
        Ok(Some(cached.clone()))
    }

    /// Path of `file` inside the model directory. `None` for names that would
    /// escape it.
    pub fn model_file(&self, file: &str) -> Option<PathBuf> {
        let relative = Path::new(file);
        let confined = !file.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        confined.then(|| self.model_path.join(relative))
    }

    pub fn exists_in_model_path(&self, file: &str) -> bool {
        self.model_file(file).map(|p| p.exists()).unwrap_or(false)
    }

    /// Model files in the model directory, sorted.
    pub fn list_models(&self) -> Result<Vec<String>, GatewayError> {
        let mut models = Vec::new();
        for entry in std::fs::read_dir(&self.model_path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if NON_MODEL_SUFFIXES.iter().any(|s| name.ends_with(s)) {
                continue;
            }
            models.push(name);
        }
        models.sort();
        Ok(models)
    }

    /// Names with a registered handle, sorted.
    pub fn loaded_models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry().loaded.iter().cloned().collect();
        names.sort();
        names
    }

    /// Current handle for `model_name` without probing or loading it.
    pub async fn handle(&self, model_name: &str) -> Option<Arc<BackendHandle>> {
        let slot = self.registry().slots.get(model_name).cloned()?;
        let current = slot.handle.lock().await;
        current.clone()
    }

    /// Stop and drop the handle for `model_name`. Returns whether one existed.
    pub async fn evict(&self, model_name: &str) -> bool {
        let slot = self.registry().slots.get(model_name).cloned();
        let Some(slot) = slot else {
            return false;
        };

        let mut current = slot.handle.lock().await;
        let evicted = match current.take() {
            Some(handle) => {
                info!("Evicting model {}", model_name);
                handle.stop().await;
                self.forget(model_name);
                true
            }
            None => false,
        };
        self.prune(model_name, &slot);
        evicted
    }

    /// Stop every supervised backend.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.registry().slots.keys().cloned().collect();
        for name in names {
            self.evict(&name).await;
        }
    }
}
