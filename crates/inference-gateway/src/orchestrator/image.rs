use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::Orchestrator;
use crate::config::ModelConfig;
use crate::error::{BackendError, GatewayError};
use crate::model_runtime::BackendKind;
use crate::protocol::{EngineOptions, GenerateImageRequest};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PromptInput {
    One(String),
    Many(Vec<String>),
}

impl Default for PromptInput {
    fn default() -> Self {
        PromptInput::Many(Vec::new())
    }
}

impl PromptInput {
    fn prompts(&self) -> Vec<&str> {
        match self {
            PromptInput::One(prompt) => vec![prompt.as_str()],
            PromptInput::Many(prompts) => prompts.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImageRequest {
    /// Each prompt may carry a negative part after `|`.
    pub prompt: PromptInput,
    /// Images per prompt. 0 means 1.
    pub n: u32,
    /// `<width>x<height>`.
    pub size: String,
    /// `b64_json` returns the image inline.
    pub response_format: String,
    pub mode: i32,
    pub step: i32,
    pub seed: Option<i32>,
    /// Base64 source image for image-to-image pipelines.
    pub src: Option<String>,
}

impl Default for ImageRequest {
    fn default() -> Self {
        Self {
            prompt: PromptInput::default(),
            n: 0,
            size: String::new(),
            response_format: String::new(),
            mode: 0,
            step: 15,
            seed: None,
            src: None,
        }
    }
}

impl ImageRequest {
    fn inline(&self) -> bool {
        self.response_format == "b64_json"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageOutput {
    B64Json(String),
    /// File name inside the image directory.
    File(String),
}

/// Parse `<width>x<height>`.
pub fn parse_size(size: &str) -> Result<(i32, i32), GatewayError> {
    let invalid = || GatewayError::InvalidRequest(format!("invalid value for 'size': {:?}", size));
    let (width, height) = size.split_once('x').ok_or_else(invalid)?;
    let width: i32 = width.trim().parse().map_err(|_| invalid())?;
    let height: i32 = height.trim().parse().map_err(|_| invalid())?;
    if width <= 0 || height <= 0 {
        return Err(invalid());
    }
    Ok((width, height))
}

fn split_prompt(prompt: &str) -> (&str, &str) {
    match prompt.split_once('|') {
        Some((positive, negative)) => (positive, negative),
        None => (prompt, ""),
    }
}

impl Orchestrator {
    pub async fn image(&self, model: &ModelConfig, request: ImageRequest) -> Result<Vec<ImageOutput>, GatewayError> {
        let (width, height) = parse_size(&request.size)?;

        let descriptor = self.descriptor(
            model,
            BackendKind::StableDiffusion,
            EngineOptions::Diffusion(model.diffusers.options.clone()),
        )?;
        let handle = self.resolve(&descriptor).await?;

        let out_dir = if request.inline() {
            std::env::temp_dir()
        } else {
            self.config.image_dir.clone()
        };
        tokio::fs::create_dir_all(&out_dir).await?;

        let src = match &request.src {
            Some(encoded) => Some(write_source(encoded).await?),
            None => None,
        };
        let src_path = src.as_ref().map(|p| p.to_string_lossy().to_string()).unwrap_or_default();

        let mut outputs = Vec::new();
        let result = async {
            for prompt in request.prompt.prompts() {
                let (positive, negative) = split_prompt(prompt);
                for _ in 0..request.n.max(1) {
                    let file_name = format!("b64{}.png", Uuid::new_v4());
                    let dst = out_dir.join(&file_name);
                    let call = GenerateImageRequest {
                        height,
                        width,
                        mode: request.mode,
                        step: request.step,
                        seed: request.seed.unwrap_or(model.parameters.seed),
                        clip_skip: model.diffusers.options.clip_skip,
                        positive_prompt: positive.to_string(),
                        negative_prompt: negative.to_string(),
                        src: src_path.clone(),
                        dst: dst.to_string_lossy().to_string(),
                        enable_parameters: model.diffusers.enable_parameters.clone(),
                    };

                    let reply = self
                        .invoke(&handle, |client| async move { client.generate_image(&call).await })
                        .await?;
                    if !reply.success {
                        return Err(GatewayError::Backend(BackendError::Engine(reply.message)));
                    }
                    debug!("Generated image {}", dst.display());

                    outputs.push(if request.inline() {
                        ImageOutput::B64Json(read_and_remove(&dst).await?)
                    } else {
                        ImageOutput::File(file_name)
                    });
                }
            }
            Ok::<(), GatewayError>(())
        }
        .await;

        if let Some(src) = src {
            if let Err(e) = tokio::fs::remove_file(&src).await {
                warn!("Failed removing source image {}: {}", src.display(), e);
            }
        }
        if result.is_err() {
            for output in &outputs {
                if let ImageOutput::File(name) = output {
                    let path = out_dir.join(name);
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        warn!("Failed removing partial image {}: {}", path.display(), e);
                    }
                }
            }
        }
        result.map(|()| outputs)
    }
}

async fn write_source(encoded: &str) -> Result<PathBuf, GatewayError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| GatewayError::InvalidRequest(format!("invalid source image: {}", e)))?;
    let path = std::env::temp_dir().join(format!("img2img{}.png", Uuid::new_v4()));
    tokio::fs::write(&path, bytes).await?;
    Ok(path)
}

async fn read_and_remove(path: &Path) -> Result<String, GatewayError> {
    let bytes = tokio::fs::read(path).await?;
    tokio::fs::remove_file(path).await?;
    Ok(STANDARD.encode(bytes))
}
