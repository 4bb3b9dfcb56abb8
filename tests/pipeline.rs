use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use dockyard::manifest::PipelineManifest;
use dockyard::pipeline::{Outcome, RunOptions, RunReport, StageRegistry, StageStatus, build_pipeline};
use dockyard::runner::RecordingRunner;
use dockyard::stages;
use tempfile::tempdir;

const SERVICE_PIPELINE: &str = r#"
version: 1
name: backend-api
environment:
  LOGIN_SERVER: acr.example.io
  IMAGE_REPO: ${LOGIN_SERVER}/${IMAGE_NAME}
  IMAGE_NAME: backend
stages:
  - stage: checkout
  - stage: static_analysis
    params:
      project_key: backend
      server_url: http://sonar.local
  - stage: fs_scan
  - stage: image_build
    params:
      repository: ${IMAGE_REPO}
  - stage: image_scan
  - stage: registry_push
    params:
      server: ${LOGIN_SERVER}
  - stage: deploy
    enabled: false
    params:
      deployment: backend
      container: backend
post:
  always:
    - echo always
  success:
    - echo succeeded
  failure:
    - echo failed
  prune_images: true
"#;

fn registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

fn credentials() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("REGISTRY_USERNAME".to_string(), "ci-user".to_string()),
        ("REGISTRY_PASSWORD".to_string(), "s3cret".to_string()),
    ])
}

fn run(manifest: &str, runner: &Arc<RecordingRunner>, workspace: &Path) -> RunReport {
    let manifest = PipelineManifest::from_yaml(manifest).unwrap();
    let mut options = RunOptions::new(runner.clone(), workspace).build_number("42");
    options.base_environment = credentials();
    build_pipeline(&registry(), &manifest, options)
        .unwrap()
        .execute()
}

fn position(runner: &RecordingRunner, fragment: &str) -> usize {
    runner
        .command_lines()
        .iter()
        .position(|line| line.contains(fragment))
        .unwrap_or_else(|| panic!("'{fragment}' never ran"))
}

#[test]
fn service_pipeline_builds_once_and_pushes_both_tags() {
    let temp = tempdir().unwrap();
    let runner = Arc::new(RecordingRunner::new());
    let report = run(SERVICE_PIPELINE, &runner, temp.path());

    assert!(report.is_success(), "{report:?}");
    assert_eq!(
        report.image_tags,
        vec!["acr.example.io/backend:42", "acr.example.io/backend:latest"]
    );

    let builds: Vec<String> = runner
        .command_lines()
        .into_iter()
        .filter(|line| line.starts_with("docker build"))
        .collect();
    assert_eq!(
        builds,
        vec!["docker build -t acr.example.io/backend:42 -t acr.example.io/backend:latest ."]
    );

    assert!(runner.ran("docker push acr.example.io/backend:42"));
    assert!(runner.ran("docker push acr.example.io/backend:latest"));
    assert!(runner.ran("trivy image --exit-code 0 --severity HIGH,CRITICAL"));
    assert!(position(&runner, "sonar-scanner") < position(&runner, "trivy fs"));
    assert!(position(&runner, "docker build") < position(&runner, "trivy image"));
    assert!(position(&runner, "trivy image") < position(&runner, "docker login"));
    assert!(position(&runner, "docker push") < position(&runner, "docker logout acr.example.io"));
}

#[test]
fn registry_password_only_travels_through_stdin() {
    let temp = tempdir().unwrap();
    let runner = Arc::new(RecordingRunner::new());
    run(SERVICE_PIPELINE, &runner, temp.path());

    let login = runner
        .invocations()
        .into_iter()
        .find(|command| command.program == "docker" && command.args.first().map(String::as_str) == Some("login"))
        .unwrap();
    assert_eq!(login.stdin.as_deref(), Some("s3cret"));
    assert!(!login.display().contains("s3cret"));
    assert!(login.args.contains(&"--password-stdin".to_string()));
}

#[test]
fn disabled_deploy_never_runs() {
    let temp = tempdir().unwrap();
    let runner = Arc::new(RecordingRunner::new());
    let report = run(SERVICE_PIPELINE, &runner, temp.path());

    assert_eq!(report.status_of("deploy"), Some(StageStatus::Skipped));
    assert!(!runner.ran("kubectl"));
}

#[test]
fn advisory_scan_failure_does_not_prevent_push() {
    let temp = tempdir().unwrap();
    let runner = Arc::new(
        RecordingRunner::new()
            .fail_when("trivy fs", 1)
            .fail_when("trivy image", 1),
    );
    let report = run(SERVICE_PIPELINE, &runner, temp.path());

    assert_eq!(report.outcome, Outcome::Success);
    assert_eq!(report.status_of("fs_scan"), Some(StageStatus::PassedWithWarnings));
    assert_eq!(report.status_of("image_scan"), Some(StageStatus::PassedWithWarnings));
    assert_eq!(report.status_of("registry_push"), Some(StageStatus::Passed));
    assert!(runner.ran("docker push acr.example.io/backend:latest"));
    assert_eq!(report.metadata["fs_scan.status"], "findings");
}

#[test]
fn blocking_failure_stops_the_run_and_runs_failure_post_actions() {
    let temp = tempdir().unwrap();
    let runner = Arc::new(RecordingRunner::new().fail_when("docker build", 1));
    let report = run(SERVICE_PIPELINE, &runner, temp.path());

    assert_eq!(report.outcome, Outcome::Failure);
    assert_eq!(report.failed_stage.as_deref(), Some("image_build"));
    assert_eq!(report.status_of("image_build"), Some(StageStatus::Failed));
    assert_eq!(report.status_of("image_scan"), Some(StageStatus::NotRun));
    assert_eq!(report.status_of("registry_push"), Some(StageStatus::NotRun));
    assert_eq!(report.status_of("deploy"), Some(StageStatus::NotRun));
    assert!(!runner.ran("docker push"));

    assert!(runner.ran("echo always"));
    assert!(runner.ran("echo failed"));
    assert!(!runner.ran("echo succeeded"));
    assert!(runner.ran("docker image prune -f"));
}

#[test]
fn logout_runs_even_when_a_push_fails() {
    let temp = tempdir().unwrap();
    let runner = Arc::new(RecordingRunner::new().fail_when("docker push acr.example.io/backend:latest", 1));
    let report = run(SERVICE_PIPELINE, &runner, temp.path());

    assert_eq!(report.status_of("registry_push"), Some(StageStatus::Failed));
    assert!(runner.ran("docker logout acr.example.io"));
    assert_eq!(report.metadata["registry.pushed"], serde_json::json!(["acr.example.io/backend:42"]));
}

#[test]
fn advisory_flag_overrides_stage_policy() {
    let manifest = r#"
version: 1
stages:
  - stage: shell
    name: lint
    params:
      command: make lint
      advisory: true
  - stage: fs_scan
    params:
      advisory: false
  - stage: shell
    name: after
    params:
      command: echo after
"#;
    let temp = tempdir().unwrap();
    let runner = Arc::new(
        RecordingRunner::new()
            .fail_when("make lint", 2)
            .fail_when("trivy fs", 1),
    );
    let report = run(manifest, &runner, temp.path());

    assert_eq!(report.status_of("lint"), Some(StageStatus::PassedWithWarnings));
    assert_eq!(report.status_of("fs_scan"), Some(StageStatus::Failed));
    assert_eq!(report.status_of("after"), Some(StageStatus::NotRun));
    assert!(!runner.ran("echo after"));
}

#[test]
fn post_action_failures_do_not_change_the_outcome() {
    let temp = tempdir().unwrap();
    let runner = Arc::new(RecordingRunner::new().fail_when("docker image prune", 1));
    let manifest = PipelineManifest::from_yaml(SERVICE_PIPELINE).unwrap();
    let mut options = RunOptions::new(runner.clone(), temp.path()).build_number("42");
    options.base_environment = credentials();
    let executor = build_pipeline(&registry(), &manifest, options).unwrap();
    let report = executor.execute();

    assert!(report.is_success());
    assert_eq!(executor.metrics().snapshot().post_action_failures, 1);
    assert_eq!(report.post_errors.len(), 1);
    assert!(report.post_errors[0].starts_with("prune_images"));
    assert!(runner.ran("echo succeeded"));
}

#[test]
fn commands_see_build_number_and_pipeline_environment() {
    let temp = tempdir().unwrap();
    let runner = Arc::new(RecordingRunner::new());
    run(SERVICE_PIPELINE, &runner, temp.path());

    let build = runner
        .invocations()
        .into_iter()
        .find(|command| command.display().starts_with("docker build"))
        .unwrap();
    assert_eq!(build.env.get("BUILD_NUMBER").map(String::as_str), Some("42"));
    assert_eq!(
        build.env.get("IMAGE_REPO").map(String::as_str),
        Some("acr.example.io/backend")
    );
    assert_eq!(build.current_dir.as_deref(), Some(temp.path()));
}

#[test]
fn clean_workspace_empties_the_directory() {
    let manifest = r#"
version: 1
stages:
  - stage: shell
    params:
      command: make test
post:
  clean_workspace: scratch
"#;
    let temp = tempdir().unwrap();
    let scratch = temp.path().join("scratch");
    fs::create_dir_all(scratch.join("build")).unwrap();
    fs::write(scratch.join("build/app.whl"), b"wheel").unwrap();

    let runner = Arc::new(RecordingRunner::new());
    let report = run(manifest, &runner, temp.path());

    assert!(report.is_success());
    assert!(scratch.is_dir());
    assert_eq!(fs::read_dir(&scratch).unwrap().count(), 0);
}

#[test]
fn cleaning_the_workspace_root_keeps_the_root() {
    let manifest = r#"
version: 1
stages:
  - stage: shell
    params:
      command: make test
post:
  clean_workspace: .
"#;
    let temp = tempdir().unwrap();
    let workspace = temp.path().join("ws");
    fs::create_dir_all(workspace.join("src/pkg")).unwrap();
    fs::write(workspace.join("src/pkg/app.py"), b"app = None").unwrap();
    fs::write(workspace.join("requirements.txt"), b"uvicorn").unwrap();

    let runner = Arc::new(RecordingRunner::new());
    let report = run(manifest, &runner, &workspace);

    assert!(report.is_success());
    assert!(report.post_errors.is_empty(), "{:?}", report.post_errors);
    assert!(workspace.is_dir());
    assert_eq!(fs::read_dir(&workspace).unwrap().count(), 0);
}

#[test]
fn metrics_track_skipped_and_advisory_stages() {
    let temp = tempdir().unwrap();
    let runner = Arc::new(RecordingRunner::new().fail_when("trivy image", 1));
    let manifest = PipelineManifest::from_yaml(SERVICE_PIPELINE).unwrap();
    let mut options = RunOptions::new(runner.clone(), temp.path()).build_number("7");
    options.base_environment = credentials();
    let executor = build_pipeline(&registry(), &manifest, options).unwrap();
    executor.execute();

    let snapshot = executor.metrics().snapshot();
    assert_eq!(snapshot.skipped_stages, 1);
    assert_eq!(snapshot.advisory_failures, 1);
    assert_eq!(snapshot.stages["image_build"].calls, 1);
    assert!(snapshot.to_prometheus().contains("dockyard_skipped_stages_total 1"));
}
