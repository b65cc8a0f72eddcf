//! Reference engine that echoes its input.
//!
//! Served by the `echo-backend` binary. Every capability is implemented
//! without any model math, so the gateway can be exercised end to end.

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::server::{Engine, TokenSink};
use super::types::*;

#[derive(Default)]
pub struct EchoEngine {
    loaded: RwLock<Option<LoadRequest>>,
}

impl EchoEngine {
    pub fn new() -> Self {
        Self::default()
    }

    async fn ensure_loaded(&self) -> anyhow::Result<()> {
        if self.loaded.read().await.is_none() {
            anyhow::bail!("model not loaded");
        }
        Ok(())
    }
}

#[async_trait]
impl Engine for EchoEngine {
    async fn load(&self, request: LoadRequest) -> anyhow::Result<()> {
        if request.model.is_empty() {
            anyhow::bail!("no model given");
        }
        debug!("echo engine loaded {}", request.model);
        *self.loaded.write().await = Some(request);
        Ok(())
    }

    async fn predict(&self, options: PredictOptions) -> anyhow::Result<String> {
        self.ensure_loaded().await?;
        Ok(options.prompt)
    }

    async fn predict_stream(&self, options: PredictOptions, sink: TokenSink) -> anyhow::Result<()> {
        self.ensure_loaded().await?;
        for word in options.prompt.split_inclusive(' ') {
            if !sink.send(word).await {
                debug!("echo stream consumer went away");
                break;
            }
        }
        Ok(())
    }

    async fn embeddings(&self, options: PredictOptions) -> anyhow::Result<Vec<f32>> {
        self.ensure_loaded().await?;
        if !options.embedding_tokens.is_empty() {
            return Ok(options.embedding_tokens.iter().map(|t| *t as f32).collect());
        }
        Ok(options.embeddings.bytes().map(|b| b as f32 / 255.0).collect())
    }

    async fn generate_image(&self, request: GenerateImageRequest) -> anyhow::Result<()> {
        self.ensure_loaded().await?;
        let header = format!("P5 {} {} 255\n", request.width, request.height);
        tokio::fs::write(&request.dst, [header.as_bytes(), request.positive_prompt.as_bytes()].concat()).await?;
        Ok(())
    }

    async fn tts(&self, request: TtsRequest) -> anyhow::Result<()> {
        self.ensure_loaded().await?;
        tokio::fs::write(&request.dst, request.text.as_bytes()).await?;
        Ok(())
    }

    async fn audio_transcription(&self, request: TranscriptRequest) -> anyhow::Result<TranscriptResult> {
        self.ensure_loaded().await?;
        let text = tokio::fs::read_to_string(&request.dst).await?;
        let text = text.trim().to_string();
        Ok(TranscriptResult {
            segments: vec![TranscriptSegment {
                id: 0,
                start: 0,
                end: text.len() as i64,
                text: text.clone(),
                tokens: Vec::new(),
            }],
            text,
        })
    }
}
