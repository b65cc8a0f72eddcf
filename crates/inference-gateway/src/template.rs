//! Prompt templates
//!
//! A model may ship a `<name>.tmpl` file next to it that wraps the rendered
//! chat prompt. Templates use `{{ }}` actions over two fields:
//!
//! - `{{.Input}}`: the prompt built from the conversation
//! - `{{.Functions}}`: the active function set, rendered as JSON
//!
//! `{{- ` and ` -}}` trim surrounding whitespace and `{{/* ... */}}` is a
//! comment. Anything else is a compile error.

use serde::Serialize;

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Input,
    Functions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Field(Field),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    name: String,
    segments: Vec<Segment>,
}

impl PromptTemplate {
    pub fn compile(name: &str, source: &str) -> Result<Self, GatewayError> {
        let error = |reason: String| GatewayError::Template {
            name: name.to_string(),
            reason,
        };

        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(open) = rest.find("{{") {
            let mut text = &rest[..open];
            let after_open = &rest[open + 2..];
            let close = action_end(after_open)
                .ok_or_else(|| error(format!("unterminated action at byte {}", source.len() - rest.len() + open)))?;
            let mut action = &after_open[..close];
            rest = &after_open[close + 2..];

            if let Some(trimmed) = action.strip_prefix("- ") {
                text = text.trim_end();
                action = trimmed;
            }
            if let Some(trimmed) = action.strip_suffix(" -") {
                rest = rest.trim_start();
                action = trimmed;
            }

            if !text.is_empty() {
                segments.push(Segment::Text(text.to_string()));
            }

            let action = action.trim();
            if action.starts_with("/*") && action.ends_with("*/") {
                continue;
            }
            let field = match action {
                ".Input" => Field::Input,
                ".Functions" => Field::Functions,
                "" => return Err(error("empty action".to_string())),
                other => return Err(error(format!("unknown field {:?}", other))),
            };
            segments.push(Segment::Field(field));
        }

        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            segments,
        })
    }

    pub fn render<F: Serialize>(&self, input: &str, functions: &[F]) -> Result<String, GatewayError> {
        let mut out = String::with_capacity(input.len() + 64);
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Field(Field::Input) => out.push_str(input),
                Segment::Field(Field::Functions) => {
                    let json = serde_json::to_string(functions).map_err(|e| GatewayError::Template {
                        name: self.name.clone(),
                        reason: e.to_string(),
                    })?;
                    out.push_str(&json);
                }
            }
        }
        Ok(out)
    }
}

/// Offset of the `}}` closing the action that starts `after_open`. A comment
/// closes at the first `}}` after its `*/`.
fn action_end(after_open: &str) -> Option<usize> {
    let body = after_open.strip_prefix("- ").unwrap_or(after_open).trim_start();
    if !body.starts_with("/*") {
        return after_open.find("}}");
    }
    let comment = after_open.len() - body.len() + 2;
    let end = comment + after_open[comment..].find("*/")? + 2;
    Some(end + after_open[end..].find("}}")?)
}
