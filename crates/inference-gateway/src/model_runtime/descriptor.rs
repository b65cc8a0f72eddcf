use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::protocol::{EngineFamily, EngineOptions, LoadRequest};

/// Engine implementation behind a backend process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BackendKind {
    Llama,
    Gpt4All,
    Rwkv,
    Falcon,
    BertEmbeddings,
    StableDiffusion,
    Piper,
    Whisper,
    /// Any other name, typically an externally supplied backend.
    Custom(String),
}

impl BackendKind {
    pub fn name(&self) -> &str {
        match self {
            BackendKind::Llama => "llama",
            BackendKind::Gpt4All => "gpt4all",
            BackendKind::Rwkv => "rwkv",
            BackendKind::Falcon => "falcon",
            BackendKind::BertEmbeddings => "bert-embeddings",
            BackendKind::StableDiffusion => "stablediffusion",
            BackendKind::Piper => "piper",
            BackendKind::Whisper => "whisper",
            BackendKind::Custom(name) => name,
        }
    }

    pub fn family(&self) -> EngineFamily {
        match self {
            BackendKind::StableDiffusion => EngineFamily::Diffusion,
            BackendKind::Piper => EngineFamily::Speech,
            BackendKind::Whisper => EngineFamily::Transcription,
            _ => EngineFamily::Llm,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_lowercase().as_str() {
            "" => return Err(GatewayError::InvalidDescriptor("empty backend name".into())),
            "llama" => BackendKind::Llama,
            "gpt4all" => BackendKind::Gpt4All,
            "rwkv" => BackendKind::Rwkv,
            "falcon" => BackendKind::Falcon,
            "bert-embeddings" => BackendKind::BertEmbeddings,
            "stablediffusion" => BackendKind::StableDiffusion,
            "piper" => BackendKind::Piper,
            "whisper" => BackendKind::Whisper,
            _ => BackendKind::Custom(s.trim().to_string()),
        };
        Ok(kind)
    }
}

impl TryFrom<String> for BackendKind {
    type Error = GatewayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BackendKind> for String {
    fn from(kind: BackendKind) -> Self {
        kind.name().to_string()
    }
}

/// Connect/health-check retries after spawning. Never applied to `Load`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 20,
            delay: Duration::from_secs(2),
        }
    }
}

/// Immutable description of how to bring up one backend instance.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendDescriptor {
    pub kind: BackendKind,
    /// Model file name, relative to the model directory.
    pub model: String,
    /// Resolved model path handed to the engine.
    pub model_file: PathBuf,
    pub threads: u32,
    pub asset_dir: PathBuf,
    /// Pre-launched endpoint. When set no process is spawned.
    pub external_address: Option<String>,
    pub retry: RetryPolicy,
    pub options: EngineOptions,
}

impl BackendDescriptor {
    pub fn builder(kind: BackendKind, model: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder::new(kind, model)
    }

    pub fn is_external(&self) -> bool {
        self.external_address.is_some()
    }

    pub fn load_request(&self) -> LoadRequest {
        LoadRequest {
            model: self.model_file.to_string_lossy().to_string(),
            threads: self.threads,
            asset_dir: self.asset_dir.to_string_lossy().to_string(),
            options: self.options.clone(),
        }
    }
}

pub struct DescriptorBuilder {
    kind: BackendKind,
    model: String,
    model_file: Option<PathBuf>,
    threads: u32,
    asset_dir: PathBuf,
    external_address: Option<String>,
    retry: RetryPolicy,
    options: EngineOptions,
}

impl DescriptorBuilder {
    fn new(kind: BackendKind, model: impl Into<String>) -> Self {
        let options = EngineOptions::default_for(kind.family());
        Self {
            kind,
            model: model.into(),
            model_file: None,
            threads: 4,
            asset_dir: PathBuf::new(),
            external_address: None,
            retry: RetryPolicy::default(),
            options,
        }
    }

    pub fn model_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_file = Some(path.into());
        self
    }

    pub fn threads(mut self, threads: u32) -> Self {
        self.threads = threads;
        self
    }

    pub fn asset_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.asset_dir = dir.into();
        self
    }

    pub fn external_address(mut self, address: Option<String>) -> Self {
        self.external_address = address;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<BackendDescriptor, GatewayError> {
        if self.model.is_empty() {
            return Err(GatewayError::InvalidDescriptor("model name is empty".into()));
        }
        if self.options.family() != self.kind.family() {
            return Err(GatewayError::InvalidDescriptor(format!(
                "{:?} options given for {} backend, which expects {:?}",
                self.options.family(),
                self.kind,
                self.kind.family()
            )));
        }
        if self.retry.attempts == 0 {
            return Err(GatewayError::InvalidDescriptor("retry attempts must be at least 1".into()));
        }

        let model_file = self.model_file.unwrap_or_else(|| PathBuf::from(&self.model));
        Ok(BackendDescriptor {
            kind: self.kind,
            model: self.model,
            model_file,
            threads: self.threads,
            asset_dir: self.asset_dir,
            external_address: self.external_address,
            retry: self.retry,
            options: self.options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DiffusionOptions, LlmOptions};

    #[test]
    fn test_kind_parsing_round_trips_known_names() {
        for name in ["llama", "rwkv", "bert-embeddings", "stablediffusion", "piper", "whisper"] {
            let kind: BackendKind = name.parse().unwrap();
            assert_eq!(kind.name(), name);
        }
        assert_eq!(
            "my-remote-llm".parse::<BackendKind>().unwrap(),
            BackendKind::Custom("my-remote-llm".into())
        );
        assert!("  ".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_builder_seeds_family_defaults() {
        let descriptor = BackendDescriptor::builder(BackendKind::StableDiffusion, "sd.bin")
            .build()
            .unwrap();
        assert_eq!(descriptor.options, EngineOptions::Diffusion(DiffusionOptions::default()));
        assert_eq!(descriptor.model_file, PathBuf::from("sd.bin"));
        assert!(!descriptor.is_external());
    }

    #[test]
    fn test_builder_rejects_foreign_family_options() {
        let result = BackendDescriptor::builder(BackendKind::Whisper, "ggml-base.bin")
            .options(EngineOptions::Llm(LlmOptions::default()))
            .build();
        assert!(matches!(result, Err(GatewayError::InvalidDescriptor(_))));
    }

    #[test]
    fn test_load_request_carries_resolved_path() {
        let descriptor = BackendDescriptor::builder(BackendKind::Llama, "m1")
            .model_file("/models/m1")
            .threads(8)
            .build()
            .unwrap();
        let request = descriptor.load_request();
        assert_eq!(request.model, "/models/m1");
        assert_eq!(request.threads, 8);
    }

    #[test]
    fn test_kind_serializes_as_plain_name() {
        let json = serde_json::to_string(&BackendKind::BertEmbeddings).unwrap();
        assert_eq!(json, "\"bert-embeddings\"");
        let kind: BackendKind = serde_json::from_str("\"piper\"").unwrap();
        assert_eq!(kind, BackendKind::Piper);
    }
}
