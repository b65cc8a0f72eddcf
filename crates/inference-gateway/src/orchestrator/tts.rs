use std::path::PathBuf;

use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use super::Orchestrator;
use crate::config::ModelConfig;
use crate::error::{BackendError, GatewayError};
use crate::model_runtime::BackendKind;
use crate::protocol::{EngineOptions, SpeechOptions, TtsRequest};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpeechRequest {
    /// Voice model file inside the model path.
    pub model: String,
    pub input: String,
    #[serde(default)]
    pub backend: Option<BackendKind>,
}

impl Orchestrator {
    /// Synthesize `request.input` and return the path of the written wav file.
    pub async fn tts(&self, request: SpeechRequest) -> Result<PathBuf, GatewayError> {
        let voice = self
            .loader
            .model_file(&request.model)
            .filter(|path| path.is_file())
            .ok_or_else(|| GatewayError::ModelNotFound(request.model.clone()))?;

        let mut model = ModelConfig::new(&request.model);
        model.backend = request.backend.clone();
        let options = SpeechOptions {
            library_search_path: self
                .config
                .asset_dir
                .join("backend-assets")
                .join("espeak-ng-data")
                .to_string_lossy()
                .to_string(),
        };
        let descriptor = self.descriptor(&model, BackendKind::Piper, EngineOptions::Speech(options))?;
        let handle = self.resolve(&descriptor).await?;

        tokio::fs::create_dir_all(&self.config.audio_dir).await?;
        let dst = self.config.audio_dir.join(format!("piper_{}.wav", Uuid::new_v4()));
        let call = TtsRequest {
            text: request.input,
            model: voice.to_string_lossy().to_string(),
            dst: dst.to_string_lossy().to_string(),
        };

        let reply = self
            .invoke(&handle, |client| async move { client.tts(&call).await })
            .await?;
        if !reply.success {
            return Err(GatewayError::Backend(BackendError::Engine(reply.message)));
        }
        debug!("Generated audio {}", dst.display());
        Ok(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::tests::fixture;
    use crate::test_support::FakeBackend;

    fn speech(voice: &str) -> SpeechRequest {
        SpeechRequest {
            model: voice.into(),
            input: "good morning".into(),
            backend: None,
        }
    }

    #[tokio::test]
    async fn test_missing_voice_is_model_not_found() {
        let fx = fixture(FakeBackend::new());
        let err = fx.orchestrator.tts(speech("en-us.onnx")).await.unwrap_err();
        assert!(matches!(err, GatewayError::ModelNotFound(ref m) if m == "en-us.onnx"));
        assert_eq!(fx.launcher.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_audio_written_to_audio_dir() {
        let fx = fixture(FakeBackend::new());
        std::fs::write(fx.dir.path().join("en-us.onnx"), b"voice").unwrap();

        let path = fx.orchestrator.tts(speech("en-us.onnx")).await.unwrap();
        assert!(path.starts_with(&fx.orchestrator.config().audio_dir));
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("piper_") && name.ends_with(".wav"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "good morning");
    }

    #[tokio::test]
    async fn test_voice_outside_model_path_is_rejected() {
        let fx = fixture(FakeBackend::new());
        std::fs::write(fx.dir.path().join("en-us.onnx"), b"voice").unwrap();

        let err = fx.orchestrator.tts(speech("../en-us.onnx")).await.unwrap_err();
        assert!(matches!(err, GatewayError::ModelNotFound(_)));
    }
}
