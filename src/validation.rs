use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

use crate::manifest::PipelineManifest;
use crate::pipeline::{StageRegistry, StageSpec, take_policy_override};

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_manifest(manifest: &PipelineManifest, registry: &StageRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if manifest.version != 1 {
        report
            .errors
            .push(format!("Unsupported pipeline version: {}", manifest.version));
    }

    if manifest.stages.is_empty() {
        report
            .errors
            .push("Pipeline must contain at least one stage".into());
    }

    for key in manifest.environment.keys() {
        if key.trim().is_empty() || key.contains('=') {
            report
                .errors
                .push(format!("Invalid environment variable name '{key}'"));
        }
    }

    let mut labels = std::collections::BTreeSet::new();
    for (idx, stage) in manifest.stages.iter().enumerate() {
        if !labels.insert(stage.label()) {
            report.errors.push(format!(
                "Stage {} reuses the name '{}'; stage names must be unique",
                idx + 1,
                stage.label()
            ));
        }
        report.merge(validate_stage_order(idx, stage, &manifest.stages));
        report.merge(
            validate_stage(stage, registry)
                .with_context(|| format!("Stage {} ('{}')", idx + 1, stage.label()))
                .unwrap_or_else(|err| ValidationReport {
                    errors: vec![format!("{err:#}")],
                    warnings: vec![],
                }),
        );
    }

    if let Some(webhook) = &manifest.post.notify.webhook
        && !(webhook.starts_with("http://") || webhook.starts_with("https://"))
    {
        report
            .errors
            .push(format!("Notification webhook '{webhook}' is not an http(s) URL"));
    }

    report
}

fn validate_stage(stage: &StageSpec, registry: &StageRegistry) -> Result<ValidationReport> {
    let mut report = ValidationReport::default();

    let mut params = stage.params.clone().unwrap_or_default();
    if stage.stage == "quality_gate" && params.get("advisory") == Some(&Value::Bool(true)) {
        report.warnings.push(format!(
            "Stage '{}': quality gates always block; 'advisory' is ignored",
            stage.label()
        ));
    }
    take_policy_override(&stage.stage, &mut params)?;
    if let Err(err) = registry.create(&stage.stage, params) {
        report.errors.push(format!(
            "Stage '{}': {:#}",
            stage.label(),
            err.context("Failed to instantiate stage")
        ));
    }

    Ok(report)
}

fn validate_stage_order(idx: usize, stage: &StageSpec, stages: &[StageSpec]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let earlier = |kind: &str| stages[..idx].iter().any(|prev| prev.stage == kind);

    match stage.stage.as_str() {
        "quality_gate" if !earlier("static_analysis") => {
            report
                .errors
                .push("Quality gate must follow a static_analysis stage".into());
        }
        "image_scan" | "registry_push" if !earlier("image_build") => {
            report.errors.push(format!(
                "{} stage requires an image_build stage earlier in the pipeline",
                stage.stage
            ));
        }
        "deploy" => {
            if !earlier("image_build") {
                report
                    .errors
                    .push("deploy stage requires an image_build stage earlier in the pipeline".into());
            }
            if !earlier("registry_push") {
                report
                    .errors
                    .push("deploy stage requires a registry_push stage earlier in the pipeline".into());
            }
            if stage.enabled {
                report.warnings.push(format!(
                    "Stage '{}' will deploy to the cluster; set enabled: false to keep it dormant",
                    stage.label()
                ));
            }
        }
        _ => {}
    }

    if let Some(error) = gate_ordering_error(idx, stages) {
        report.errors.push(error);
    }

    if matches!(stage.stage.as_str(), "image_build" | "registry_push")
        && let Some(gate) = stages[..idx].iter().find(|prev| prev.stage == "quality_gate")
        && !gate.enabled
    {
        report.warnings.push(format!(
            "Stage '{}' runs while quality gate '{}' is disabled",
            stage.label(),
            gate.label()
        ));
    }

    report
}

/// Image stages must not run ahead of a quality gate declared later in the
/// pipeline.
pub fn gate_ordering_error(idx: usize, stages: &[StageSpec]) -> Option<String> {
    let stage = &stages[idx];
    if !matches!(
        stage.stage.as_str(),
        "image_build" | "image_scan" | "registry_push" | "deploy"
    ) {
        return None;
    }
    let gate = stages[idx + 1..]
        .iter()
        .find(|later| later.stage == "quality_gate")?;
    Some(format!(
        "Stage '{}' runs before quality gate '{}'; the gate must pass before any image is built or shipped",
        stage.label(),
        gate.label()
    ))
}
