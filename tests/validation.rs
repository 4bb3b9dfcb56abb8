use std::fs;

use dockyard::lockfile::{PipelineLock, generate_lock};
use dockyard::manifest::PipelineManifest;
use dockyard::pipeline::{StageParameters, StageRegistry, StageSpec};
use dockyard::stages;
use dockyard::validation::validate_manifest;
use serde_json::json;
use tempfile::tempdir;

fn build_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

fn base_manifest() -> PipelineManifest {
    PipelineManifest::from_yaml("version: 1\nstages: []\n").unwrap()
}

fn stage_spec(name: &str, params: &[(&str, serde_json::Value)]) -> StageSpec {
    let mut map = StageParameters::default();
    for (key, value) in params {
        map.insert((*key).to_string(), value.clone());
    }
    StageSpec {
        params: Some(map),
        ..StageSpec::new(name)
    }
}

fn image_build() -> StageSpec {
    stage_spec("image_build", &[("repository", json!("acr.io/backend"))])
}

#[test]
fn validation_catches_missing_params() {
    let mut manifest = base_manifest();
    manifest.stages.push(stage_spec("registry_push", &[]));

    let report = validate_manifest(&manifest, &build_registry());

    assert!(!report.is_ok());
    assert!(
        report.errors.iter().any(|e| e.contains("'server'")),
        "{:?}",
        report.errors
    );
}

#[test]
fn empty_pipeline_and_wrong_version_are_rejected() {
    let mut manifest = base_manifest();
    manifest.version = 2;

    let report = validate_manifest(&manifest, &build_registry());

    assert_eq!(report.errors.len(), 2, "{:?}", report.errors);
}

#[test]
fn unknown_stage_and_parameter_are_reported() {
    let mut manifest = base_manifest();
    manifest.stages.push(StageSpec::new("helm_upgrade"));
    manifest
        .stages
        .push(stage_spec("fs_scan", &[("severty", json!("HIGH"))]));

    let report = validate_manifest(&manifest, &build_registry());

    assert!(report.errors.iter().any(|e| e.contains("Unknown stage 'helm_upgrade'")));
    assert!(report.errors.iter().any(|e| e.contains("severty")));
}

#[test]
fn quality_gate_must_follow_static_analysis() {
    let mut manifest = base_manifest();
    manifest.stages.push(StageSpec::new("quality_gate"));
    manifest
        .stages
        .push(stage_spec("static_analysis", &[("project_key", json!("backend"))]));

    let report = validate_manifest(&manifest, &build_registry());

    assert!(
        report
            .errors
            .iter()
            .any(|e| e.contains("must follow a static_analysis")),
        "{:?}",
        report.errors
    );
}

#[test]
fn image_stages_cannot_run_ahead_of_the_gate() {
    let mut manifest = base_manifest();
    manifest.stages.push(image_build());
    manifest
        .stages
        .push(stage_spec("registry_push", &[("server", json!("acr.io"))]));
    manifest
        .stages
        .push(stage_spec("static_analysis", &[("project_key", json!("backend"))]));
    manifest.stages.push(StageSpec::new("quality_gate"));

    let report = validate_manifest(&manifest, &build_registry());

    let ahead: Vec<_> = report
        .errors
        .iter()
        .filter(|e| e.contains("runs before quality gate 'quality_gate'"))
        .collect();
    assert_eq!(ahead.len(), 2, "{:?}", report.errors);
    assert!(ahead[0].contains("'image_build'"));
    assert!(ahead[1].contains("'registry_push'"));
}

#[test]
fn image_stages_after_the_gate_are_accepted() {
    let mut manifest = base_manifest();
    manifest
        .stages
        .push(stage_spec("static_analysis", &[("project_key", json!("backend"))]));
    manifest.stages.push(StageSpec::new("quality_gate"));
    manifest.stages.push(image_build());
    manifest.stages.push(StageSpec::new("image_scan"));
    manifest
        .stages
        .push(stage_spec("registry_push", &[("server", json!("acr.io"))]));

    let report = validate_manifest(&manifest, &build_registry());

    assert!(report.is_ok(), "{:?}", report.errors);
}

#[test]
fn malformed_gate_timeout_is_reported() {
    let mut manifest = base_manifest();
    manifest
        .stages
        .push(stage_spec("static_analysis", &[("project_key", json!("backend"))]));
    manifest
        .stages
        .push(stage_spec("quality_gate", &[("timeout_secs", json!("5m"))]));

    let report = validate_manifest(&manifest, &build_registry());

    assert!(
        report
            .errors
            .iter()
            .any(|e| e.contains("timeout_secs") && e.contains("5m")),
        "{:?}",
        report.errors
    );
}

#[test]
fn push_scan_and_deploy_need_an_image() {
    let mut manifest = base_manifest();
    manifest.stages.push(StageSpec::new("image_scan"));
    manifest
        .stages
        .push(stage_spec("registry_push", &[("server", json!("acr.io"))]));
    manifest.stages.push(StageSpec {
        enabled: false,
        ..stage_spec(
            "deploy",
            &[("deployment", json!("backend")), ("container", json!("api"))],
        )
    });

    let report = validate_manifest(&manifest, &build_registry());

    assert!(report.errors.iter().any(|e| e.starts_with("image_scan")));
    assert!(report.errors.iter().any(|e| e.starts_with("registry_push")));
    assert!(
        report
            .errors
            .iter()
            .any(|e| e.contains("deploy stage requires an image_build"))
    );
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
}

#[test]
fn enabled_deploy_and_advisory_gate_warn() {
    let mut manifest = base_manifest();
    manifest
        .stages
        .push(stage_spec("static_analysis", &[("project_key", json!("backend"))]));
    manifest
        .stages
        .push(stage_spec("quality_gate", &[("advisory", json!(true))]));
    manifest.stages.push(image_build());
    manifest
        .stages
        .push(stage_spec("registry_push", &[("server", json!("acr.io"))]));
    manifest.stages.push(stage_spec(
        "deploy",
        &[("deployment", json!("backend")), ("container", json!("api"))],
    ));

    let report = validate_manifest(&manifest, &build_registry());

    assert!(report.is_ok(), "{:?}", report.errors);
    assert_eq!(report.warnings.len(), 2, "{:?}", report.warnings);
    assert!(report.warnings.iter().any(|w| w.contains("'advisory' is ignored")));
    assert!(report.warnings.iter().any(|w| w.contains("will deploy")));
}

#[test]
fn duplicate_stage_names_are_rejected() {
    let mut manifest = base_manifest();
    manifest
        .stages
        .push(stage_spec("shell", &[("command", json!("make lint"))]));
    manifest
        .stages
        .push(stage_spec("shell", &[("command", json!("make test"))]));

    let report = validate_manifest(&manifest, &build_registry());

    assert!(report.errors.iter().any(|e| e.contains("reuses the name 'shell'")));
}

#[test]
fn advisory_must_be_boolean() {
    let mut manifest = base_manifest();
    manifest.stages.push(stage_spec(
        "shell",
        &[("command", json!("make lint")), ("advisory", json!("yes"))],
    ));

    let report = validate_manifest(&manifest, &build_registry());

    assert!(report.errors.iter().any(|e| e.contains("true or false")), "{:?}", report.errors);
}

#[test]
fn webhook_must_be_http() {
    let mut manifest = base_manifest();
    manifest.stages.push(image_build());
    manifest.post.notify.webhook = Some("slack://builds".into());

    let report = validate_manifest(&manifest, &build_registry());

    assert!(report.errors.iter().any(|e| e.contains("slack://builds")));
}

#[test]
fn lockfile_records_every_stage() {
    let temp = tempdir().unwrap();
    let mut manifest = base_manifest();
    manifest.stages.push(image_build());
    manifest.stages.push(StageSpec {
        enabled: false,
        ..stage_spec(
            "deploy",
            &[("deployment", json!("backend")), ("container", json!("api"))],
        )
    });

    let path = temp.path().join("pipeline.lock");
    generate_lock(&manifest, &path).unwrap();

    let contents = fs::read_to_string(&path).unwrap();
    assert!(contents.contains("manifest_version: 1"));
    assert!(contents.contains("params_hash"));

    let lock = PipelineLock::load(&path).unwrap();
    assert_eq!(lock.stages.len(), 2);
    assert!(!lock.stages[1].enabled);

    manifest.stages[1].enabled = true;
    assert_eq!(lock.drift(&manifest), vec!["deploy"]);
}
