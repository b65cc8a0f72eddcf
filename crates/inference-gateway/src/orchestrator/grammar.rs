//! JSON schema to GBNF grammar
//!
//! Structured output constrains the engine with a grammar generated from the
//! declared functions. Each function becomes one alternative of the shape
//! `{"arguments": <parameters>, "function": "<name>"}`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::GatewayError;

/// A callable action declared by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

const SPACE_RULE: &str = "\" \"?";

fn primitive_rule(kind: &str) -> Option<&'static str> {
    let rule = match kind {
        "boolean" => r#"("true" | "false") space"#,
        "number" => r#"("-"? ([0-9] | [1-9] [0-9]*)) ("." [0-9]+)? ([eE] [-+]? [0-9]+)? space"#,
        "integer" => r#"("-"? ([0-9] | [1-9] [0-9]*)) space"#,
        "string" => r#""\"" ( [^"\\] | "\\" (["\\/bfnrt] | "u" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F]) )* "\"" space"#,
        "null" => r#""null" space"#,
        _ => return None,
    };
    Some(rule)
}

/// Schema accepting exactly one call to one of `functions`.
pub fn function_structure(functions: &[Function]) -> Value {
    let alternatives: Vec<Value> = functions
        .iter()
        .map(|f| {
            let mut arguments = f.parameters.clone();
            if let Some(object) = arguments.as_object_mut() {
                object.entry("type").or_insert_with(|| json!("object"));
            } else {
                arguments = json!({"type": "object"});
            }
            json!({
                "type": "object",
                "properties": {
                    "function": {"const": f.name},
                    "arguments": arguments,
                }
            })
        })
        .collect();
    json!({ "oneOf": alternatives })
}

pub fn function_grammar(functions: &[Function]) -> Result<String, GatewayError> {
    schema_to_grammar(&function_structure(functions))
}

pub fn schema_to_grammar(schema: &Value) -> Result<String, GatewayError> {
    let mut converter = Converter::new();
    converter.visit(schema, "")?;
    Ok(converter.format())
}

struct Converter {
    rules: BTreeMap<String, String>,
}

impl Converter {
    /// `space` is built in and `root` is held for the top-level rule, so
    /// properties with those names get a suffixed rule instead.
    fn new() -> Self {
        let mut rules = BTreeMap::new();
        rules.insert("space".to_string(), SPACE_RULE.to_string());
        rules.insert("root".to_string(), String::new());
        Self { rules }
    }

    fn set_rule(&mut self, name: &str, body: String) -> String {
        if name.is_empty() {
            self.rules.insert("root".to_string(), body);
            return "root".to_string();
        }
        self.add_rule(name, body)
    }

    fn add_rule(&mut self, name: &str, body: String) -> String {
        let key = sanitize_rule_name(name);
        let key = match self.rules.get(&key) {
            None => key,
            Some(existing) if *existing == body => return key,
            Some(_) => {
                let mut i = 0;
                while self.rules.contains_key(&format!("{}{}", key, i)) {
                    i += 1;
                }
                format!("{}{}", key, i)
            }
        };
        self.rules.insert(key.clone(), body);
        key
    }

    fn visit(&mut self, schema: &Value, name: &str) -> Result<String, GatewayError> {
        if let Some(alternatives) = schema.get("oneOf").or_else(|| schema.get("anyOf")).and_then(Value::as_array) {
            let mut rules = Vec::with_capacity(alternatives.len());
            for (i, alternative) in alternatives.iter().enumerate() {
                let alt_name = format!("{}{}", if name.is_empty() { "" } else { name }, i);
                rules.push(self.visit(alternative, &alt_name)?);
            }
            if rules.is_empty() {
                return Err(GatewayError::InvalidRequest("schema has no alternatives".into()));
            }
            return Ok(self.set_rule(name, rules.join(" | ")));
        }

        if let Some(constant) = schema.get("const") {
            let body = format!("{} space", format_literal(&constant.to_string()));
            return Ok(self.set_rule(name, body));
        }

        if let Some(values) = schema.get("enum").and_then(Value::as_array) {
            let body = values
                .iter()
                .map(|v| format_literal(&v.to_string()))
                .collect::<Vec<_>>()
                .join(" | ");
            return Ok(self.set_rule(name, format!("({}) space", body)));
        }

        let kind = schema.get("type").and_then(Value::as_str);
        let properties = schema.get("properties").and_then(Value::as_object);

        if kind == Some("object") || properties.is_some() {
            let mut body = String::from(r#""{" space"#);
            if let Some(properties) = properties {
                for (i, (prop_name, prop_schema)) in properties.iter().enumerate() {
                    let prefix = if name.is_empty() { String::new() } else { format!("{}-", name) };
                    let prop_rule = self.visit(prop_schema, &format!("{}{}", prefix, prop_name))?;
                    if i > 0 {
                        body.push_str(r#" "," space"#);
                    }
                    body.push_str(&format!(
                        r#" {} space ":" space {}"#,
                        format_literal(&Value::String(prop_name.clone()).to_string()),
                        prop_rule
                    ));
                }
            }
            body.push_str(r#" "}" space"#);
            return Ok(self.set_rule(name, body));
        }

        if kind == Some("array") {
            let items = schema.get("items").cloned().unwrap_or_else(|| json!({"type": "string"}));
            let item_rule = self.visit(&items, &format!("{}-item", if name.is_empty() { "root" } else { name }))?;
            let body = format!(r#""[" space ({} ("," space {})*)? "]" space"#, item_rule, item_rule);
            return Ok(self.set_rule(name, body));
        }

        let kind = kind.unwrap_or("string");
        let body = primitive_rule(kind).ok_or_else(|| {
            GatewayError::InvalidRequest(format!("unsupported schema type {:?}", kind))
        })?;
        if name.is_empty() {
            return Ok(self.set_rule("", body.to_string()));
        }
        Ok(self.add_rule(kind, body.to_string()))
    }

    fn format(self) -> String {
        self.rules
            .iter()
            .map(|(name, body)| format!("{} ::= {}\n", name, body))
            .collect()
    }
}

fn sanitize_rule_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('-');
            in_run = true;
        }
    }
    out
}

/// GBNF string literal matching `text` exactly.
fn format_literal(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 2);
    escaped.push('"');
    for c in text.chars() {
        match c {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            c => escaped.push(c),
        }
    }
    escaped.push('"');
    escaped
}
