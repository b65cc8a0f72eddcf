//! Chat-style generation
//!
//! Renders the conversation into a prompt, optionally through the model's
//! template, then produces either up to `n` complete choices or a stream of
//! deltas that always ends with exactly one terminal event.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::finetune::finetune;
use super::functions::StructuredOutput;
use super::grammar::{schema_to_grammar, Function};
use super::{record_outcome, Orchestrator};
use crate::config::ModelConfig;
use crate::error::{BackendError, GatewayError};
use crate::model_runtime::{BackendHandle, BackendKind, KindLocks};
use crate::protocol::{EngineOptions, PredictOptions};

/// Role label used for assistant turns that carry a function call, when the
/// model configures one.
pub const ASSISTANT_FUNCTION_CALL_ROLE: &str = "assistant_function_call";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<Value>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(content.into()),
            function_call: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "FunctionCallRepr")]
pub enum FunctionCallMode {
    Auto,
    /// Never constrain output, even with functions declared.
    None,
    /// Force this function.
    Named(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FunctionCallRepr {
    Mode(String),
    Named { name: String },
}

impl From<FunctionCallRepr> for FunctionCallMode {
    fn from(repr: FunctionCallRepr) -> Self {
        match repr {
            FunctionCallRepr::Mode(mode) if mode == "none" => FunctionCallMode::None,
            FunctionCallRepr::Mode(_) => FunctionCallMode::Auto,
            FunctionCallRepr::Named { name } => FunctionCallMode::Named(name),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    /// Number of choices. 0 means 1.
    pub n: u32,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub max_tokens: Option<u32>,
    pub seed: Option<i32>,
    pub stop: Vec<String>,
    pub functions: Vec<Function>,
    pub function_call: Option<FunctionCallMode>,
    /// Raw grammar applied as-is.
    pub grammar: Option<String>,
    /// Pre-built JSON schema of a function call, applied without structured
    /// handling of the result.
    pub grammar_json_functions: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON text of the arguments object, exactly as the engine produced it.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Choice {
    pub index: usize,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    pub finish_reason: String,
}

impl Choice {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            index: 0,
            role: "assistant".into(),
            content: Some(content.into()),
            function_call: None,
            finish_reason: "stop".into(),
        }
    }

    pub fn function_call(call: FunctionCall) -> Self {
        Self {
            index: 0,
            role: "assistant".into(),
            content: None,
            function_call: Some(call),
            finish_reason: "function_call".into(),
        }
    }
}

/// One streaming event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl ChatDelta {
    fn start() -> Self {
        Self {
            role: Some("assistant".into()),
            content: String::new(),
            finish_reason: None,
        }
    }

    fn fragment(content: String) -> Self {
        Self {
            role: None,
            content,
            finish_reason: None,
        }
    }

    fn finish(reason: &str) -> Self {
        Self {
            role: None,
            content: String::new(),
            finish_reason: Some(reason.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some()
    }
}

pub enum ChatResponse {
    Complete(Vec<Choice>),
    /// Closed by the producer after the terminal event.
    Stream(mpsc::Receiver<ChatDelta>),
}

impl std::fmt::Debug for ChatResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatResponse::Complete(choices) => f.debug_tuple("Complete").field(choices).finish(),
            ChatResponse::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Concatenate the conversation, one message per line.
pub fn render_messages(messages: &[ChatMessage], roles: &HashMap<String, String>) -> String {
    messages
        .iter()
        .map(|m| render_message(m, roles))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_message(message: &ChatMessage, roles: &HashMap<String, String>) -> String {
    let label_for = |role: &str| roles.get(role).filter(|label| !label.is_empty()).cloned();

    let mut role = message.role.as_str();
    if message.function_call.is_some()
        && role == "assistant"
        && label_for(ASSISTANT_FUNCTION_CALL_ROLE).is_some()
    {
        role = ASSISTANT_FUNCTION_CALL_ROLE;
    }
    let label = label_for(role);
    let prefixed = |text: &str| match &label {
        Some(label) => format!("{} {}", label, text),
        None => text.to_string(),
    };

    let mut lines = Vec::new();
    if let Some(content) = message.content.as_deref().filter(|c| !c.is_empty()) {
        lines.push(prefixed(content));
    }
    if let Some(call) = message.function_call.as_ref().and_then(|c| serde_json::to_string(c).ok()) {
        lines.push(prefixed(&call));
    }
    lines.join("\n")
}

fn template_key(model: &ModelConfig, structured: bool) -> &str {
    if structured && !model.template.functions.is_empty() {
        &model.template.functions
    } else if !structured && !model.template.chat.is_empty() {
        &model.template.chat
    } else {
        &model.model
    }
}

impl Orchestrator {
    pub async fn chat(&self, model: &ModelConfig, request: ChatRequest) -> Result<ChatResponse, GatewayError> {
        let plan = StructuredOutput::plan(model, &request)?;
        let grammar = match (&plan, &request.grammar_json_functions) {
            (Some(plan), _) => plan.grammar.clone(),
            (None, Some(schema)) => schema_to_grammar(schema)?,
            (None, None) => request.grammar.clone().unwrap_or_default(),
        };
        let streaming = request.stream && plan.is_none();

        let descriptor = self.descriptor(model, BackendKind::Llama, EngineOptions::Llm(self.llm_options(model)))?;
        let handle = self.resolve(&descriptor).await?;

        let prompt = render_messages(&request.messages, &model.roles);
        debug!("Prompt (before templating): {}", prompt);
        let functions = plan.as_ref().map(|p| p.functions.as_slice()).unwrap_or(&[]);
        let prompt = self.apply_template(template_key(model, plan.is_some()), &prompt, functions);
        debug!("Prompt (after templating): {}", prompt);
        if plan.is_some() {
            debug!("Grammar: {}", grammar);
        }

        let options = self.chat_predict_options(model, &request, prompt.clone(), grammar);

        if streaming {
            debug!("Stream request received");
            return Ok(ChatResponse::Stream(self.stream(handle, options)));
        }

        let mut choices = Vec::new();
        for _ in 0..request.n.max(1) {
            let prediction = self.model_inference(&handle, options.clone()).await?;
            let prediction = finetune(model, &prompt, &prediction);
            match &plan {
                Some(plan) => {
                    if let Some(choice) = self
                        .function_choice(&handle, model, plan, &prompt, &options, &prediction)
                        .await
                    {
                        choices.push(choice);
                    }
                }
                None => choices.push(Choice::text(prediction)),
            }
        }

        for (index, choice) in choices.iter_mut().enumerate() {
            choice.index = index;
        }
        Ok(ChatResponse::Complete(choices))
    }

    fn apply_template(&self, key: &str, input: &str, functions: &[Function]) -> String {
        match self.loader.template_for(key) {
            Ok(Some(template)) => match template.render(input, functions) {
                Ok(rendered) => rendered,
                Err(e) => {
                    warn!("Template {} failed rendering: {}", key, e);
                    input.to_string()
                }
            },
            Ok(None) => {
                debug!("No template for {}, using raw input", key);
                input.to_string()
            }
            Err(e) => {
                warn!("Template {} failed loading: {}", key, e);
                input.to_string()
            }
        }
    }

    fn chat_predict_options(
        &self,
        model: &ModelConfig,
        request: &ChatRequest,
        prompt: String,
        grammar: String,
    ) -> PredictOptions {
        let mut options = self.base_predict_options(model);
        options.prompt = prompt;
        options.grammar = grammar;
        if let Some(temperature) = request.temperature {
            options.temperature = temperature;
        }
        if let Some(top_p) = request.top_p {
            options.top_p = top_p;
        }
        if let Some(top_k) = request.top_k {
            options.top_k = top_k;
        }
        if let Some(max_tokens) = request.max_tokens {
            options.tokens = max_tokens;
        }
        if let Some(seed) = request.seed {
            options.seed = seed;
        }
        options.stop_prompts.extend(request.stop.iter().cloned());
        options
    }

    fn stream(&self, handle: Arc<BackendHandle>, options: PredictOptions) -> mpsc::Receiver<ChatDelta> {
        let (tx, rx) = mpsc::channel(self.config.stream_buffer);
        let locks = self.kind_locks.clone();

        tokio::spawn(async move {
            if tx.send(ChatDelta::start()).await.is_err() {
                return;
            }
            let reason = match pump_fragments(&locks, &handle, &options, &tx).await {
                Ok(()) => "stop",
                Err(StreamEnd::ConsumerGone) => {
                    debug!("Stream consumer for {} went away", handle.model_name());
                    return;
                }
                Err(StreamEnd::Failed(e)) => {
                    error!("Stream prediction for {} failed: {}", handle.model_name(), e);
                    "error"
                }
            };
            let _ = tx.send(ChatDelta::finish(reason)).await;
        });

        rx
    }
}

enum StreamEnd {
    ConsumerGone,
    Failed(BackendError),
}

/// Forward backend fragments while holding the kind lock. Returning drops the
/// backend stream, which closes the connection to the backend.
async fn pump_fragments(
    locks: &KindLocks,
    handle: &BackendHandle,
    options: &PredictOptions,
    tx: &mpsc::Sender<ChatDelta>,
) -> Result<(), StreamEnd> {
    let _guard = locks.acquire(handle.kind()).await;

    let mut fragments = match handle.client().predict_stream(options).await {
        Ok(fragments) => fragments,
        Err(e) => {
            record_outcome(handle, Some(&e));
            return Err(StreamEnd::Failed(e));
        }
    };

    while let Some(fragment) = fragments.next().await {
        match fragment {
            Ok(text) => {
                if tx.send(ChatDelta::fragment(text)).await.is_err() {
                    return Err(StreamEnd::ConsumerGone);
                }
            }
            Err(e) => {
                record_outcome(handle, Some(&e));
                return Err(StreamEnd::Failed(e));
            }
        }
    }

    record_outcome(handle, None);
    Ok(())
}
