use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pipeline::{StageParameters, StageSpec};

static ENV_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env pattern"));

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineManifest {
    pub version: u32,
    #[serde(default = "default_pipeline_name")]
    pub name: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub stages: Vec<StageSpec>,
    #[serde(default)]
    pub post: PostSpec,
}

fn default_pipeline_name() -> String {
    "pipeline".to_string()
}

impl PipelineManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse pipeline YAML: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Resolve the pipeline environment once, at start. `${VAR}` references
    /// may point at any other entry, then `base` (build number and caller
    /// supplied variables), then the process environment. An entry that
    /// references itself sees the value it is shadowing.
    pub fn resolve_environment(&self, base: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut resolved = base.clone();
        resolved.extend(self.environment.clone());

        // Each pass resolves one more level of nesting.
        for _ in 0..=self.environment.len() {
            let mut changed = false;
            for (key, raw) in &self.environment {
                let mut scope = resolved.clone();
                match base.get(key) {
                    Some(shadowed) => scope.insert(key.clone(), shadowed.clone()),
                    None => scope.remove(key),
                };
                let expanded = expand_env(raw, &scope);
                if resolved.get(key) != Some(&expanded) {
                    resolved.insert(key.clone(), expanded);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        resolved
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct PostSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub always: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub success: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_workspace: Option<PathBuf>,
    #[serde(default)]
    pub prune_images: bool,
    #[serde(default)]
    pub notify: NotifySpec,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct NotifySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
}

/// Replace `${NAME}` with the value from `vars`, falling back to the process
/// environment. Unknown references are left untouched.
pub fn expand_env(input: &str, vars: &BTreeMap<String, String>) -> String {
    ENV_REFERENCE
        .replace_all(input, |caps: &Captures| {
            let name = &caps[1];
            vars.get(name)
                .cloned()
                .or_else(|| std::env::var(name).ok())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

pub fn expand_params(params: &StageParameters, vars: &BTreeMap<String, String>) -> StageParameters {
    params
        .iter()
        .map(|(key, value)| (key.clone(), expand_value(value, vars)))
        .collect()
}

fn expand_value(value: &Value, vars: &BTreeMap<String, String>) -> Value {
    match value {
        Value::String(s) => Value::String(expand_env(s, vars)),
        Value::Array(items) => Value::Array(items.iter().map(|v| expand_value(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), expand_value(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}
