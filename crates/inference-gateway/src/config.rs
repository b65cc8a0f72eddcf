use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::model_runtime::{BackendKind, LoaderOptions, RetryPolicy};
use crate::protocol::DiffusionOptions;

/// Process-wide settings shared by every request.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub models_path: PathBuf,
    pub asset_dir: PathBuf,
    pub image_dir: PathBuf,
    pub audio_dir: PathBuf,
    pub threads: u32,
    pub context_size: u32,
    pub f16: bool,
    /// Backend name to pre-launched address.
    pub external_backends: HashMap<String, String>,
    pub grpc_attempts: u32,
    pub grpc_attempts_delay: Duration,
    pub stop_grace: Duration,
    pub unresponsive_reuse_limit: u32,
    pub stream_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            models_path: PathBuf::from("./models"),
            asset_dir: PathBuf::from("/tmp/localai/backend_data"),
            image_dir: env::temp_dir().join("generated").join("images"),
            audio_dir: env::temp_dir().join("generated").join("audio"),
            threads: 4,
            context_size: 512,
            f16: false,
            external_backends: HashMap::new(),
            grpc_attempts: 20,
            grpc_attempts_delay: Duration::from_secs(2),
            stop_grace: Duration::from_secs(10),
            unresponsive_reuse_limit: 1,
            stream_buffer: 32,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let threads = match get("THREADS").as_deref() {
            None | Some("auto") => Self::auto_detect_threads(),
            Some(value) => value.trim().parse().context("THREADS must be a number or \"auto\"")?,
        };

        let external_backends = match get("EXTERNAL_GRPC_BACKENDS") {
            Some(spec) => Self::parse_external_backends(&spec)?,
            None => HashMap::new(),
        };

        Ok(Self {
            models_path: get("MODELS_PATH").map(PathBuf::from).unwrap_or(defaults.models_path),
            asset_dir: get("BACKEND_ASSETS_PATH").map(PathBuf::from).unwrap_or(defaults.asset_dir),
            image_dir: get("IMAGE_PATH").map(PathBuf::from).unwrap_or(defaults.image_dir),
            audio_dir: get("AUDIO_PATH").map(PathBuf::from).unwrap_or(defaults.audio_dir),
            threads,
            context_size: parse_or(get("CONTEXT_SIZE"), defaults.context_size, "CONTEXT_SIZE")?,
            f16: parse_or(get("F16"), defaults.f16, "F16")?,
            external_backends,
            grpc_attempts: parse_or(get("GRPC_ATTEMPTS"), defaults.grpc_attempts, "GRPC_ATTEMPTS")?,
            grpc_attempts_delay: Duration::from_secs(parse_or(
                get("GRPC_ATTEMPTS_DELAY"),
                defaults.grpc_attempts_delay.as_secs(),
                "GRPC_ATTEMPTS_DELAY",
            )?),
            stop_grace: Duration::from_secs(parse_or(
                get("STOP_GRACE_SECONDS"),
                defaults.stop_grace.as_secs(),
                "STOP_GRACE_SECONDS",
            )?),
            unresponsive_reuse_limit: parse_or(
                get("UNRESPONSIVE_REUSE_LIMIT"),
                defaults.unresponsive_reuse_limit,
                "UNRESPONSIVE_REUSE_LIMIT",
            )?,
            stream_buffer: parse_or(get("STREAM_BUFFER"), defaults.stream_buffer, "STREAM_BUFFER")?.max(1),
        })
    }

    /// `name:address,name:address`. The address itself may contain colons.
    fn parse_external_backends(spec: &str) -> Result<HashMap<String, String>> {
        let mut backends = HashMap::new();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, address) = entry
                .split_once(':')
                .with_context(|| format!("external backend {:?} is not name:address", entry))?;
            if name.is_empty() || address.is_empty() {
                anyhow::bail!("external backend {:?} is not name:address", entry);
            }
            backends.insert(name.to_string(), address.to_string());
        }
        Ok(backends)
    }

    fn auto_detect_threads() -> u32 {
        let num_cpus = num_cpus::get() as u32;
        info!("Auto‑detected CPU cores: {}", num_cpus);

        match num_cpus {
            0..=2 => 1,
            3..=4 => (num_cpus * 2) / 3,
            5..=8 => (num_cpus * 3) / 5,
            9..=16 => num_cpus / 2,
            17..=32 => (num_cpus * 2) / 5,
            _ => 16,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.grpc_attempts.max(1),
            delay: self.grpc_attempts_delay,
        }
    }

    pub fn loader_options(&self) -> LoaderOptions {
        LoaderOptions {
            unresponsive_reuse_limit: self.unresponsive_reuse_limit,
        }
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Models Path: {}", self.models_path.display());
        info!("- Backend Assets: {}", self.asset_dir.display());
        info!("- Image Dir: {}", self.image_dir.display());
        info!("- Audio Dir: {}", self.audio_dir.display());
        info!("- Threads: {}", self.threads);
        info!("- Context Size: {}", self.context_size);
        info!("- External Backends: {:?}", self.external_backends);
        info!("- Connect Attempts: {} every {:?}", self.grpc_attempts, self.grpc_attempts_delay);
    }
}

fn parse_or<T>(value: Option<String>, default: T, key: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(v) => v.trim().parse().with_context(|| format!("invalid value for {}: {:?}", key, v)),
        None => Ok(default),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    /// Template used for unconstrained chat.
    pub chat: String,
    /// Template used while structured output is active.
    pub functions: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionsConfig {
    pub disable_no_action: bool,
    pub no_action_function_name: String,
    pub no_action_description_name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrpcConfig {
    pub attempts: u32,
    /// Seconds between connect attempts.
    pub attempts_sleep_time: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffusersConfig {
    #[serde(flatten)]
    pub options: DiffusionOptions,
    pub enable_parameters: String,
}

/// Sampling defaults for a model. Request values override these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionDefaults {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_tokens: u32,
    pub seed: i32,
    pub batch: u32,
    pub repeat_penalty: f32,
    pub stop: Vec<String>,
}

impl Default for PredictionDefaults {
    fn default() -> Self {
        Self {
            temperature: 0.9,
            top_p: 0.95,
            top_k: 40,
            max_tokens: 512,
            seed: -1,
            batch: 512,
            repeat_penalty: 1.1,
            stop: Vec::new(),
        }
    }
}

/// Per-model value bundle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    /// Model file, relative to the model directory.
    pub model: String,
    pub backend: Option<BackendKind>,
    pub threads: Option<u32>,
    pub context_size: Option<u32>,
    pub f16: Option<bool>,
    pub gpu_layers: u32,
    pub mmap: Option<bool>,
    pub mlock: bool,
    pub low_vram: bool,
    pub main_gpu: Option<String>,
    pub tensor_split: Option<String>,
    pub roles: HashMap<String, String>,
    pub template: TemplateConfig,
    pub functions: FunctionsConfig,
    pub parameters: PredictionDefaults,
    pub echo: bool,
    pub cutstrings: Vec<String>,
    pub trimspace: Vec<String>,
    pub grpc: GrpcConfig,
    pub diffusers: DiffusersConfig,
}

impl ModelConfig {
    pub fn new(model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            name: model.clone(),
            model,
            ..Default::default()
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading model config {}", path.display()))?;
        let mut config: ModelConfig = serde_json::from_str(&content)
            .with_context(|| format!("parsing model config {}", path.display()))?;
        if config.name.is_empty() {
            config.name = config.model.clone();
        }
        Ok(config)
    }

    /// Connect policy, falling back to the gateway's for unset fields.
    pub fn retry_policy(&self, gateway: &GatewayConfig) -> RetryPolicy {
        let base = gateway.retry_policy();
        RetryPolicy {
            attempts: if self.grpc.attempts != 0 { self.grpc.attempts } else { base.attempts },
            delay: if self.grpc.attempts_sleep_time != 0 {
                Duration::from_secs(self.grpc.attempts_sleep_time)
            } else {
                base.delay
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    // ===== Gateway configuration =====

    #[test]
    fn test_unset_environment_gives_defaults() {
        let config = GatewayConfig::from_lookup(lookup(&[("THREADS", "6")])).unwrap();
        assert_eq!(config.models_path, PathBuf::from("./models"));
        assert_eq!(config.asset_dir, PathBuf::from("/tmp/localai/backend_data"));
        assert_eq!(config.threads, 6);
        assert_eq!(config.context_size, 512);
        assert_eq!(config.grpc_attempts, 20);
        assert_eq!(config.grpc_attempts_delay, Duration::from_secs(2));
        assert_eq!(config.unresponsive_reuse_limit, 1);
        assert!(config.external_backends.is_empty());
    }

    #[test]
    fn test_auto_threads_is_at_least_one() {
        let config = GatewayConfig::from_lookup(lookup(&[("THREADS", "auto")])).unwrap();
        assert!(config.threads >= 1);
    }

    #[test]
    fn test_external_backends_keep_address_colons() {
        let config =
            GatewayConfig::from_lookup(lookup(&[("EXTERNAL_GRPC_BACKENDS", "my-llm:127.0.0.1:9000, tts:gpu-box:50051")]))
                .unwrap();
        assert_eq!(config.external_backends.get("my-llm").unwrap(), "127.0.0.1:9000");
        assert_eq!(config.external_backends.get("tts").unwrap(), "gpu-box:50051");
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        assert!(GatewayConfig::from_lookup(lookup(&[("EXTERNAL_GRPC_BACKENDS", "nocolon")])).is_err());
        assert!(GatewayConfig::from_lookup(lookup(&[("GRPC_ATTEMPTS", "many")])).is_err());
        assert!(GatewayConfig::from_lookup(lookup(&[("THREADS", "-2")])).is_err());
    }

    // ===== Model configuration =====

    #[test]
    fn test_model_config_from_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m1.json");
        std::fs::write(
            &path,
            r#"{"model": "m1.bin", "backend": "llama", "roles": {"user": "USER:"}, "parameters": {"temperature": 0.2}}"#,
        )
        .unwrap();

        let config = ModelConfig::from_file(&path).unwrap();
        assert_eq!(config.name, "m1.bin");
        assert_eq!(config.backend, Some(BackendKind::Llama));
        assert_eq!(config.roles.get("user").unwrap(), "USER:");
        assert_eq!(config.parameters.temperature, 0.2);
        assert_eq!(config.parameters.max_tokens, 512);
        assert!(!config.functions.disable_no_action);
    }

    #[test]
    fn test_model_retry_policy_overrides_gateway() {
        let gateway = GatewayConfig::default();
        let mut model = ModelConfig::new("m1");
        assert_eq!(model.retry_policy(&gateway), RetryPolicy::default());

        model.grpc = GrpcConfig {
            attempts: 3,
            attempts_sleep_time: 0,
        };
        let policy = model.retry_policy(&gateway);
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.delay, Duration::from_secs(2));
    }

    #[test]
    fn test_diffusers_options_flatten() {
        let config: ModelConfig =
            serde_json::from_str(r#"{"diffusers": {"cuda": true, "clip_skip": 2, "enable_parameters": "seed"}}"#).unwrap();
        assert!(config.diffusers.options.cuda);
        assert_eq!(config.diffusers.options.clip_skip, 2);
        assert_eq!(config.diffusers.enable_parameters, "seed");
    }
}
