//! Request orchestration
//!
//! Per-request-kind logic on top of the registry: build the descriptor from
//! the model's configuration, resolve the backend, prepare inputs, and run
//! the call under the per-kind lock.
//!
//! Every backend call goes through `Orchestrator::invoke` (or the streaming
//! producer in `chat`), which is the only place the kind lock is taken and
//! the only place call outcomes feed back into handle health.
pub mod chat;
pub mod embeddings;
pub mod finetune;
pub mod functions;
pub mod grammar;
pub mod image;
pub mod transcription;
pub mod tts;
pub use chat::{ChatDelta, ChatMessage, ChatRequest, ChatResponse, Choice, FunctionCall, FunctionCallMode};
pub use embeddings::EmbeddingInput;
pub use functions::{Selection, StructuredOutput};
pub use grammar::Function;
pub use image::{ImageOutput, ImageRequest};
pub use transcription::TranscriptionRequest;
pub use tts::SpeechRequest;

use std::future::Future;
use std::sync::Arc;

use tracing::error;

use crate::config::{GatewayConfig, ModelConfig};
use crate::error::{BackendError, GatewayError};
use crate::metrics;
use crate::model_runtime::{BackendDescriptor, BackendHandle, BackendKind, KindLocks, ModelLoader, ProcessLauncher};
use crate::protocol::{Backend, EngineOptions, LlmOptions, PredictOptions};

pub struct Orchestrator {
    config: GatewayConfig,
    loader: Arc<ModelLoader>,
    kind_locks: Arc<KindLocks>,
}

impl Orchestrator {
    pub fn new(config: GatewayConfig, loader: Arc<ModelLoader>) -> Self {
        Self {
            config,
            loader,
            kind_locks: Arc::new(KindLocks::new()),
        }
    }

    /// Backends launched as subprocesses from the configured asset directory.
    pub fn from_config(config: GatewayConfig) -> Self {
        let launcher = Arc::new(ProcessLauncher::new(config.stop_grace));
        let loader = Arc::new(ModelLoader::new(
            config.models_path.clone(),
            launcher,
            config.loader_options(),
        ));
        Self::new(config, loader)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn loader(&self) -> &Arc<ModelLoader> {
        &self.loader
    }

    /// Stop every supervised backend.
    pub async fn shutdown(&self) {
        self.loader.shutdown().await;
    }

    fn descriptor(
        &self,
        model: &ModelConfig,
        default_kind: BackendKind,
        options: EngineOptions,
    ) -> Result<BackendDescriptor, GatewayError> {
        let kind = model.backend.clone().unwrap_or(default_kind);
        let model_file = self
            .loader
            .model_file(&model.model)
            .ok_or_else(|| GatewayError::InvalidRequest(format!("invalid model name {:?}", model.model)))?;

        BackendDescriptor::builder(kind.clone(), &model.model)
            .model_file(model_file)
            .threads(model.threads.unwrap_or(self.config.threads))
            .asset_dir(&self.config.asset_dir)
            .external_address(self.config.external_backends.get(kind.name()).cloned())
            .retry(model.retry_policy(&self.config))
            .options(options)
            .build()
    }

    fn llm_options(&self, model: &ModelConfig) -> LlmOptions {
        let defaults = LlmOptions::default();
        LlmOptions {
            context_size: model.context_size.unwrap_or(self.config.context_size),
            seed: model.parameters.seed,
            batch: model.parameters.batch,
            f16_memory: model.f16.unwrap_or(self.config.f16),
            mmap: model.mmap.unwrap_or(defaults.mmap),
            mlock: model.mlock,
            embeddings: false,
            gpu_layers: model.gpu_layers,
            main_gpu: model.main_gpu.clone(),
            tensor_split: model.tensor_split.clone(),
            low_vram: model.low_vram,
        }
    }

    /// Sampling parameters from the model's defaults.
    fn base_predict_options(&self, model: &ModelConfig) -> PredictOptions {
        let params = &model.parameters;
        PredictOptions {
            tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            seed: params.seed,
            stop_prompts: params.stop.clone(),
            threads: model.threads.unwrap_or(self.config.threads),
            batch: params.batch,
            repeat_penalty: params.repeat_penalty,
            f16_kv: model.f16.unwrap_or(self.config.f16),
            ..Default::default()
        }
    }

    async fn resolve(&self, descriptor: &BackendDescriptor) -> Result<Arc<BackendHandle>, GatewayError> {
        self.loader.resolve(&descriptor.model, descriptor).await
    }

    /// Run one backend call while holding the lock for the handle's kind.
    async fn invoke<T, F, Fut>(&self, handle: &BackendHandle, call: F) -> Result<T, GatewayError>
    where
        F: FnOnce(Arc<dyn Backend>) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let _guard = self.kind_locks.acquire(handle.kind()).await;
        let result = call(handle.client().clone()).await;
        record_outcome(handle, result.as_ref().err());
        Ok(result?)
    }

    /// Blocking generation.
    pub async fn model_inference(
        &self,
        handle: &BackendHandle,
        options: PredictOptions,
    ) -> Result<String, GatewayError> {
        self.invoke(handle, |client| async move { client.predict(&options).await })
            .await
    }
}

fn record_outcome(handle: &BackendHandle, error: Option<&BackendError>) {
    let kind = handle.kind().name();
    match error {
        None => metrics::inc_inference(kind, "ok"),
        Some(e) => {
            metrics::inc_inference(kind, "error");
            error!("{} call for {} failed: {}", kind, handle.model_name(), e);
            if e.is_transport() {
                handle.mark_unhealthy();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_runtime::LoaderOptions;
    use crate::test_support::{FakeBackend, FakeLauncher};
    use std::time::Duration;

    pub(crate) struct Fixture {
        pub orchestrator: Orchestrator,
        pub launcher: Arc<FakeLauncher>,
        pub dir: tempfile::TempDir,
    }

    pub(crate) fn fixture(backend: FakeBackend) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new(backend));
        let config = GatewayConfig {
            models_path: dir.path().to_path_buf(),
            asset_dir: dir.path().join("assets"),
            image_dir: dir.path().join("images"),
            audio_dir: dir.path().join("audio"),
            grpc_attempts: 1,
            grpc_attempts_delay: Duration::from_millis(1),
            ..GatewayConfig::default()
        };
        let loader = Arc::new(ModelLoader::new(dir.path(), launcher.clone(), LoaderOptions::default()));
        Fixture {
            orchestrator: Orchestrator::new(config, loader),
            launcher,
            dir,
        }
    }

    #[tokio::test]
    async fn test_descriptor_merges_model_and_gateway_settings() {
        let fx = fixture(FakeBackend::new());
        let mut model = ModelConfig::new("m1.bin");
        model.threads = Some(2);
        model.context_size = Some(2048);

        let options = EngineOptions::Llm(fx.orchestrator.llm_options(&model));
        let descriptor = fx.orchestrator.descriptor(&model, BackendKind::Llama, options).unwrap();
        assert_eq!(descriptor.kind, BackendKind::Llama);
        assert_eq!(descriptor.threads, 2);
        assert_eq!(descriptor.model_file, fx.dir.path().join("m1.bin"));
        assert_eq!(descriptor.retry.attempts, 1);
        match descriptor.options {
            EngineOptions::Llm(llm) => assert_eq!(llm.context_size, 2048),
            other => panic!("unexpected options {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_descriptor_uses_external_address_for_kind() {
        let mut fx = fixture(FakeBackend::new());
        fx.orchestrator
            .config
            .external_backends
            .insert("remote-llm".into(), "10.0.0.2:9000".into());
        let mut model = ModelConfig::new("m1");
        model.backend = Some(BackendKind::Custom("remote-llm".into()));

        let options = EngineOptions::Llm(LlmOptions::default());
        let descriptor = fx.orchestrator.descriptor(&model, BackendKind::Llama, options).unwrap();
        assert_eq!(descriptor.external_address.as_deref(), Some("10.0.0.2:9000"));
    }

    #[tokio::test]
    async fn test_escaping_model_name_is_rejected() {
        let fx = fixture(FakeBackend::new());
        let model = ModelConfig::new("../outside.bin");
        let options = EngineOptions::Llm(LlmOptions::default());
        let err = fx.orchestrator.descriptor(&model, BackendKind::Llama, options).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_transport_failure_marks_handle_unhealthy() {
        let fx = fixture(FakeBackend::new());
        fx.launcher
            .backend()
            .push_reply(Err(BackendError::Transport("connection reset".into())));
        let model = ModelConfig::new("m1");
        let options = EngineOptions::Llm(fx.orchestrator.llm_options(&model));
        let descriptor = fx.orchestrator.descriptor(&model, BackendKind::Llama, options).unwrap();
        let handle = fx.orchestrator.resolve(&descriptor).await.unwrap();

        let err = fx
            .orchestrator
            .model_inference(&handle, PredictOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Backend(BackendError::Transport(_))));
        assert!(!handle.is_healthy());
    }

    #[tokio::test]
    async fn test_engine_failure_keeps_handle_healthy() {
        let fx = fixture(FakeBackend::new());
        fx.launcher
            .backend()
            .push_reply(Err(BackendError::Engine("bad grammar".into())));
        let model = ModelConfig::new("m1");
        let options = EngineOptions::Llm(fx.orchestrator.llm_options(&model));
        let descriptor = fx.orchestrator.descriptor(&model, BackendKind::Llama, options).unwrap();
        let handle = fx.orchestrator.resolve(&descriptor).await.unwrap();

        let err = fx
            .orchestrator
            .model_inference(&handle, PredictOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "bad grammar");
        assert!(handle.is_healthy());
    }

    #[tokio::test]
    async fn test_failed_call_releases_kind_lock() {
        let fx = fixture(FakeBackend::new());
        fx.launcher
            .backend()
            .push_reply(Err(BackendError::Engine("context overflow".into())));
        let model = ModelConfig::new("m1");
        let options = EngineOptions::Llm(fx.orchestrator.llm_options(&model));
        let descriptor = fx.orchestrator.descriptor(&model, BackendKind::Llama, options).unwrap();
        let handle = fx.orchestrator.resolve(&descriptor).await.unwrap();

        assert!(fx
            .orchestrator
            .model_inference(&handle, PredictOptions::default())
            .await
            .is_err());

        let retry = PredictOptions {
            prompt: "again".into(),
            ..Default::default()
        };
        let reply = tokio::time::timeout(Duration::from_secs(1), fx.orchestrator.model_inference(&handle, retry))
            .await
            .expect("kind lock still held after failed call")
            .unwrap();
        assert_eq!(reply, "again");
        assert_eq!(fx.launcher.backend().call_count(), 2);

        let guard = tokio::time::timeout(Duration::from_secs(1), fx.orchestrator.kind_locks.acquire(handle.kind())).await;
        assert!(guard.is_ok());
    }
}
