use regex::{Captures, Regex};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::ffi::OsString;
use std::sync::LazyLock;

use crate::ExecutionContext;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\s*([A-Za-z0-9_.\-]+)\s*\}").unwrap());

/// Renders configured header templates such as `Bearer {context.headers.authorization}`
/// or `{env.SUBGRAPH_TOKEN}`.
#[derive(Clone, Debug, Default)]
pub struct HeaderTemplate {
    templates: HashMap<String, String>,
    env: HashMap<String, String>,
}

impl HeaderTemplate {
    pub fn new(templates: HashMap<String, String>) -> Self {
        HeaderTemplate {
            templates,
            env: utf8_env(std::env::vars_os()),
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Headers whose template renders empty are left out.
    pub fn render(&self, context: &ExecutionContext) -> HashMap<String, String> {
        let headers: HashMap<String, String> = context
            .headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
            .collect();
        let root = json!({
            "context": { "headers": headers },
            "env": self.env,
        });

        self.templates
            .iter()
            .filter_map(|(name, template)| {
                let value = interpolate(template, &root);
                let value = value.trim();
                (!value.is_empty()).then(|| (name.clone(), value.to_string()))
            })
            .collect()
    }
}

// Variables that are not valid UTF-8 cannot be interpolated into a header.
fn utf8_env(vars: impl Iterator<Item = (OsString, OsString)>) -> HashMap<String, String> {
    vars.filter_map(|(name, value)| Some((name.into_string().ok()?, value.into_string().ok()?)))
        .collect()
}

fn interpolate(template: &str, root: &Value) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| lookup(root, &caps[1]))
        .into_owned()
}

fn lookup(root: &Value, path: &str) -> String {
    let mut current = root;
    for segment in path.split('.') {
        let next = match current {
            Value::Object(map) => map
                .get(segment)
                .or_else(|| map.get(&segment.to_ascii_lowercase())),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return String::new(),
        }
    }
    match current {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
