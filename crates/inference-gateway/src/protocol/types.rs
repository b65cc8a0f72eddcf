//! Wire messages of the backend protocol.

use serde::{Deserialize, Serialize};

/// Capability family of an engine. Each family understands its own option set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineFamily {
    Llm,
    Diffusion,
    Speech,
    Transcription,
}

/// Load-time engine options, one variant per family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum EngineOptions {
    Llm(LlmOptions),
    Diffusion(DiffusionOptions),
    Speech(SpeechOptions),
    Transcription,
}

impl EngineOptions {
    pub fn family(&self) -> EngineFamily {
        match self {
            EngineOptions::Llm(_) => EngineFamily::Llm,
            EngineOptions::Diffusion(_) => EngineFamily::Diffusion,
            EngineOptions::Speech(_) => EngineFamily::Speech,
            EngineOptions::Transcription => EngineFamily::Transcription,
        }
    }

    pub fn default_for(family: EngineFamily) -> Self {
        match family {
            EngineFamily::Llm => EngineOptions::Llm(LlmOptions::default()),
            EngineFamily::Diffusion => EngineOptions::Diffusion(DiffusionOptions::default()),
            EngineFamily::Speech => EngineOptions::Speech(SpeechOptions::default()),
            EngineFamily::Transcription => EngineOptions::Transcription,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmOptions {
    pub context_size: u32,
    pub seed: i32,
    pub batch: u32,
    pub f16_memory: bool,
    pub mmap: bool,
    pub mlock: bool,
    pub embeddings: bool,
    pub gpu_layers: u32,
    pub main_gpu: Option<String>,
    pub tensor_split: Option<String>,
    pub low_vram: bool,
}

impl Default for LlmOptions {
    fn default() -> Self {
        Self {
            context_size: 512,
            seed: -1,
            batch: 512,
            f16_memory: false,
            mmap: true,
            mlock: false,
            embeddings: false,
            gpu_layers: 0,
            main_gpu: None,
            tensor_split: None,
            low_vram: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffusionOptions {
    pub cuda: bool,
    pub scheduler_type: String,
    pub pipeline_type: String,
    pub cfg_scale: f32,
    pub img2img: bool,
    pub clip_model: String,
    pub clip_subfolder: String,
    pub clip_skip: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechOptions {
    pub library_search_path: String,
}

/// Body of `Load`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadRequest {
    pub model: String,
    pub threads: u32,
    pub asset_dir: String,
    pub options: EngineOptions,
}

/// Result of every mutating call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResult {
    pub success: bool,
    pub message: String,
}

impl RpcResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub message: String,
}

/// One server-sent event of `PredictStream`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamFrame {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictOptions {
    pub prompt: String,
    pub tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub seed: i32,
    pub stop_prompts: Vec<String>,
    pub grammar: String,
    pub threads: u32,
    pub batch: u32,
    pub repeat_penalty: f32,
    pub f16_kv: bool,
    pub embeddings: String,
    pub embedding_tokens: Vec<i32>,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            tokens: 512,
            temperature: 0.9,
            top_p: 0.95,
            top_k: 40,
            seed: -1,
            stop_prompts: Vec::new(),
            grammar: String::new(),
            threads: 4,
            batch: 512,
            repeat_penalty: 1.1,
            f16_kv: false,
            embeddings: String::new(),
            embedding_tokens: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResult {
    pub embeddings: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateImageRequest {
    pub height: i32,
    pub width: i32,
    pub mode: i32,
    pub step: i32,
    pub seed: i32,
    pub clip_skip: i32,
    pub positive_prompt: String,
    pub negative_prompt: String,
    pub src: String,
    pub dst: String,
    pub enable_parameters: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TtsRequest {
    pub text: String,
    pub model: String,
    pub dst: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptRequest {
    pub dst: String,
    pub language: String,
    pub threads: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub id: i32,
    pub start: i64,
    pub end: i64,
    pub text: String,
    #[serde(default)]
    pub tokens: Vec<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptResult {
    pub segments: Vec<TranscriptSegment>,
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_options_are_tagged_by_family() {
        let opts = EngineOptions::Speech(SpeechOptions {
            library_search_path: "/assets/espeak-ng-data".into(),
        });
        let json = serde_json::to_value(&opts).unwrap();
        assert_eq!(json["family"], "speech");
        assert_eq!(json["library_search_path"], "/assets/espeak-ng-data");

        let back: EngineOptions = serde_json::from_value(json).unwrap();
        assert_eq!(back.family(), EngineFamily::Speech);
    }

    #[test]
    fn test_transcription_options_carry_no_fields() {
        let json = serde_json::to_string(&EngineOptions::Transcription).unwrap();
        assert_eq!(json, r#"{"family":"transcription"}"#);
    }

    #[test]
    fn test_predict_options_fill_defaults() {
        let opts: PredictOptions = serde_json::from_str(r#"{"prompt":"hi"}"#).unwrap();
        assert_eq!(opts.prompt, "hi");
        assert_eq!(opts.tokens, 512);
        assert!(opts.grammar.is_empty());
    }

    #[test]
    fn test_stream_frame_omits_absent_error() {
        let frame = StreamFrame {
            message: "tok".into(),
            error: None,
        };
        assert_eq!(serde_json::to_string(&frame).unwrap(), r#"{"message":"tok"}"#);
    }
}
