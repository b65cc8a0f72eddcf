//! Structured function selection
//!
//! When a chat request declares functions, generation is constrained by a
//! grammar that only admits `{"function": <name>, "arguments": {...}}`. An
//! extra no-action function lets the model answer in plain text instead.

use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::{json, Value};
use tracing::{debug, error};

use super::chat::{ChatRequest, Choice, FunctionCall, FunctionCallMode};
use super::finetune::finetune;
use super::grammar::{function_grammar, Function};
use super::Orchestrator;
use crate::config::ModelConfig;
use crate::error::GatewayError;
use crate::model_runtime::BackendHandle;
use crate::protocol::PredictOptions;

pub const DEFAULT_NO_ACTION_NAME: &str = "answer";
pub const DEFAULT_NO_ACTION_DESCRIPTION: &str = "use this action to answer without performing any action";

/// Functions offered to the model and the grammar that constrains it to them.
#[derive(Debug, Clone)]
pub struct StructuredOutput {
    pub functions: Vec<Function>,
    pub no_action: String,
    pub grammar: String,
}

/// What the model picked.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// The no-action function carrying the reply message.
    Reply(String),
    /// The no-action function without a message; the answer must be generated
    /// separately.
    NeedsReply,
    Call(FunctionCall),
}

#[derive(Deserialize)]
struct RawSelection {
    function: String,
    #[serde(default)]
    arguments: Option<Box<RawValue>>,
}

impl StructuredOutput {
    /// `None` when the request should be served as plain text.
    pub fn plan(model: &ModelConfig, request: &ChatRequest) -> Result<Option<Self>, GatewayError> {
        if request.functions.is_empty() || request.function_call == Some(FunctionCallMode::None) {
            return Ok(None);
        }

        let settings = &model.functions;
        let no_action = non_empty_or(&settings.no_action_function_name, DEFAULT_NO_ACTION_NAME);
        let mut functions = request.functions.clone();
        if !settings.disable_no_action {
            functions.push(Function {
                name: no_action.clone(),
                description: non_empty_or(&settings.no_action_description_name, DEFAULT_NO_ACTION_DESCRIPTION),
                parameters: json!({
                    "properties": {
                        "message": {
                            "type": "string",
                            "description": "The message to reply the user with",
                        }
                    }
                }),
            });
        }

        if let Some(FunctionCallMode::Named(name)) = &request.function_call {
            functions.retain(|f| &f.name == name);
            if functions.is_empty() {
                return Err(GatewayError::InvalidRequest(format!("function {:?} is not declared", name)));
            }
        }

        let grammar = function_grammar(&functions)?;
        Ok(Some(Self {
            functions,
            no_action,
            grammar,
        }))
    }

    /// Interpret constrained output. Arguments are kept as the exact JSON text
    /// the engine emitted.
    pub fn parse(&self, output: &str) -> Result<Selection, serde_json::Error> {
        let raw: RawSelection = serde_json::from_str(output.trim())?;
        if raw.function != self.no_action {
            let arguments = raw.arguments.map(|a| a.get().to_string()).unwrap_or_else(|| "{}".to_string());
            return Ok(Selection::Call(FunctionCall {
                name: raw.function,
                arguments,
            }));
        }

        let message = match raw.arguments {
            Some(arguments) => serde_json::from_str::<Value>(arguments.get())?
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            None => None,
        };
        Ok(match message {
            Some(message) if !message.is_empty() => Selection::Reply(message),
            _ => Selection::NeedsReply,
        })
    }
}

fn non_empty_or(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

impl Orchestrator {
    /// Turn one constrained prediction into a choice. `None` when the output
    /// cannot be interpreted or the follow-up generation fails.
    pub(crate) async fn function_choice(
        &self,
        handle: &BackendHandle,
        model: &ModelConfig,
        plan: &StructuredOutput,
        prompt: &str,
        options: &PredictOptions,
        prediction: &str,
    ) -> Option<Choice> {
        let selection = match plan.parse(prediction) {
            Ok(selection) => selection,
            Err(e) => {
                error!("Discarding unparsable function output {:?}: {}", prediction, e);
                return None;
            }
        };

        match selection {
            Selection::Call(call) => {
                debug!("Function call: {} {}", call.name, call.arguments);
                Some(Choice::function_call(call))
            }
            Selection::Reply(message) => Some(Choice::text(finetune(model, prompt, &message))),
            Selection::NeedsReply => {
                debug!("No action selected, generating a plain answer");
                let mut unconstrained = options.clone();
                unconstrained.grammar.clear();
                match self.model_inference(handle, unconstrained).await {
                    Ok(answer) => Some(Choice::text(finetune(model, prompt, &answer))),
                    Err(e) => {
                        error!("Plain answer generation failed: {}", e);
                        None
                    }
                }
            }
        }
    }
}
