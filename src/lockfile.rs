use std::fs::{self, File};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::manifest::PipelineManifest;
use crate::pipeline::StageSpec;

#[derive(Debug, Serialize, Deserialize)]
pub struct PipelineLock {
    pub manifest_version: u32,
    pub pipeline: String,
    pub generated_at: DateTime<Utc>,
    pub environment_hash: String,
    pub stages: Vec<StageLock>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageLock {
    pub name: String,
    pub stage: String,
    pub enabled: bool,
    pub params_hash: String,
}

impl PipelineLock {
    pub fn from_manifest(manifest: &PipelineManifest) -> Self {
        Self {
            manifest_version: manifest.version,
            pipeline: manifest.name.clone(),
            generated_at: Utc::now(),
            environment_hash: hash_json(&serde_json::to_value(&manifest.environment).unwrap_or_default()),
            stages: manifest.stages.iter().map(StageLock::from_spec).collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read lockfile: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse lockfile: {}", path.display()))
    }

    /// Labels of stages whose kind, enabled flag or parameters no longer
    /// match the manifest, plus stages added or removed since locking.
    pub fn drift(&self, manifest: &PipelineManifest) -> Vec<String> {
        let current: Vec<StageLock> = manifest.stages.iter().map(StageLock::from_spec).collect();
        let mut drifted = Vec::new();
        for (idx, locked) in self.stages.iter().enumerate() {
            match current.get(idx) {
                Some(now) if now == locked => {}
                Some(now) => drifted.push(now.name.clone()),
                None => drifted.push(locked.name.clone()),
            }
        }
        for extra in current.iter().skip(self.stages.len()) {
            drifted.push(extra.name.clone());
        }
        drifted
    }
}

impl StageLock {
    fn from_spec(spec: &StageSpec) -> Self {
        Self {
            name: spec.label().to_string(),
            stage: spec.stage.clone(),
            enabled: spec.enabled,
            params_hash: hash_params(spec),
        }
    }
}

pub fn generate_lock(manifest: &PipelineManifest, path: &Path) -> Result<PipelineLock> {
    let lock = PipelineLock::from_manifest(manifest);

    let file = File::create(path)
        .with_context(|| format!("Failed to create lockfile: {}", path.display()))?;
    serde_yaml::to_writer(file, &lock)
        .with_context(|| format!("Failed to write lockfile: {}", path.display()))?;

    Ok(lock)
}

fn hash_params(spec: &StageSpec) -> String {
    let mut hasher = Sha256::new();
    let value = serde_json::to_value(spec.params.clone().unwrap_or_default()).unwrap_or_default();
    let serialized = serde_json::to_vec(&value).unwrap_or_default();
    hasher.update(spec.stage.as_bytes());
    hasher.update(serialized);
    format!("{:x}", hasher.finalize())
}

fn hash_json(value: &serde_json::Value) -> String {
    let serialized = serde_json::to_vec(value).unwrap_or_default();
    format!("{:x}", Sha256::digest(serialized))
}
