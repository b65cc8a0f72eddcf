use std::path::PathBuf;

use serde::Deserialize;

use super::Orchestrator;
use crate::config::ModelConfig;
use crate::error::GatewayError;
use crate::model_runtime::BackendKind;
use crate::protocol::{EngineOptions, TranscriptRequest, TranscriptResult};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranscriptionRequest {
    /// Audio file already on local disk.
    pub file: PathBuf,
    #[serde(default)]
    pub language: String,
}

impl Orchestrator {
    pub async fn transcribe(
        &self,
        model: &ModelConfig,
        request: TranscriptionRequest,
    ) -> Result<TranscriptResult, GatewayError> {
        if !request.file.is_file() {
            return Err(GatewayError::InvalidRequest(format!(
                "audio file {} does not exist",
                request.file.display()
            )));
        }

        let descriptor = self.descriptor(model, BackendKind::Whisper, EngineOptions::Transcription)?;
        let handle = self.resolve(&descriptor).await?;

        let call = TranscriptRequest {
            dst: request.file.to_string_lossy().to_string(),
            language: request.language,
            threads: descriptor.threads,
        };
        self.invoke(&handle, |client| async move { client.audio_transcription(&call).await })
            .await
    }
}
