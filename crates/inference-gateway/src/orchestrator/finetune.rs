use dashmap::DashMap;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::warn;

use crate::config::ModelConfig;

lazy_static! {
    static ref CUTSTRINGS: DashMap<String, Option<Regex>> = DashMap::new();
}

fn cutstring(pattern: &str) -> Option<Regex> {
    if let Some(cached) = CUTSTRINGS.get(pattern) {
        return cached.value().clone();
    }
    let compiled = match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(e) => {
            warn!("Ignoring invalid cutstrings pattern {:?}: {}", pattern, e);
            None
        }
    };
    CUTSTRINGS.insert(pattern.to_string(), compiled.clone());
    compiled
}

/// Post-process a prediction per the model's echo, cutstrings and trimspace
/// settings, in that order.
pub fn finetune(config: &ModelConfig, prompt: &str, prediction: &str) -> String {
    let mut out = if config.echo {
        format!("{}{}", prompt, prediction)
    } else {
        prediction.to_string()
    };

    for pattern in &config.cutstrings {
        if let Some(regex) = cutstring(pattern) {
            out = regex.replace_all(&out, "").into_owned();
        }
    }

    for prefix in &config.trimspace {
        out = out.strip_prefix(prefix.as_str()).unwrap_or(&out).trim().to_string();
    }

    out
}
