use std::fs;
use std::sync::Arc;

use dockyard::image::{ImageDefinition, validate_image};
use dockyard::manifest::PipelineManifest;
use dockyard::pipeline::{RunOptions, StageRegistry, StageStatus, build_pipeline};
use dockyard::presets::{PRESETS, generate_image_preset, generate_preset, preset_manifest};
use dockyard::runner::RecordingRunner;
use dockyard::stages;
use dockyard::validation::validate_manifest;
use tempfile::tempdir;

fn registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

#[test]
fn generate_service_preset_writes_file() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("pipelines/service.yaml");
    let generated = generate_preset("python-service", &path).expect("preset generation");
    assert!(generated.exists());

    let contents = fs::read_to_string(&generated).expect("read preset");
    assert!(contents.contains("stage: quality_gate"));
    assert!(contents.contains("enabled: false"));
    assert!(contents.contains("prune_images: true"));
}

#[test]
fn every_preset_validates_cleanly() {
    for name in PRESETS {
        let manifest = preset_manifest(name).unwrap();
        let report = validate_manifest(&manifest, &registry());
        assert!(report.is_ok(), "{name}: {:?}", report.errors);
        assert!(report.warnings.is_empty(), "{name}: {:?}", report.warnings);
    }
}

#[test]
fn unknown_preset_is_rejected() {
    let temp = tempdir().unwrap();
    let err = generate_preset("nightly", &temp.path().join("x.yaml")).unwrap_err();
    assert!(err.to_string().contains("python-service"));
}

#[test]
fn service_preset_dry_run_follows_the_stage_order() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("service.yaml");
    generate_preset("python-service", &path).unwrap();
    let manifest = PipelineManifest::load(&path).unwrap();

    let runner = Arc::new(RecordingRunner::new());
    let mut options = RunOptions::new(runner.clone(), temp.path()).build_number("42");
    options.dry_run = true;
    let report = build_pipeline(&registry(), &manifest, options)
        .unwrap()
        .execute();

    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.status_of("deploy"), Some(StageStatus::Skipped));
    assert_eq!(
        report.image_tags,
        vec![
            "acrbackend.azurecr.io/backend-api:42",
            "acrbackend.azurecr.io/backend-api:latest"
        ]
    );

    let lines = runner.command_lines();
    let kinds: Vec<&str> = lines
        .iter()
        .filter_map(|line| {
            if line.starts_with("sonar-scanner") {
                Some("analysis")
            } else if line.starts_with("trivy fs") {
                Some("fs_scan")
            } else if line.starts_with("docker build") {
                Some("build")
            } else if line.starts_with("trivy image") {
                Some("image_scan")
            } else if line.starts_with("docker push") {
                Some("push")
            } else {
                None
            }
        })
        .collect();
    assert_eq!(
        kinds,
        vec!["analysis", "fs_scan", "build", "image_scan", "push", "push"]
    );
    assert!(runner.ran("-Dsonar.host.url=http://sonarqube:9000"));
    assert!(runner.ran("docker image prune -f"));
    assert!(!runner.ran("kubectl"));
    // Dry runs never wipe the workspace.
    assert!(path.exists());
}

#[test]
fn image_preset_is_valid_and_renders() {
    let temp = tempdir().unwrap();
    let definition_path = temp.path().join("image.yaml");
    let dockerfile = temp.path().join("Dockerfile");
    generate_image_preset(&definition_path, Some(dockerfile.as_path())).unwrap();

    let definition = ImageDefinition::load(&definition_path).unwrap();
    assert_eq!(definition, ImageDefinition::python_service());
    let report = validate_image(&definition);
    assert!(report.is_ok(), "{:?}", report.errors);
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);

    let rendered = fs::read_to_string(&dockerfile).unwrap();
    assert!(rendered.contains("USER appuser"));
}

#[test]
fn image_only_preset_renders_dockerfile_from_definition() {
    let temp = tempdir().unwrap();
    generate_image_preset(&temp.path().join("image.yaml"), None).unwrap();
    let manifest = preset_manifest("image-only").unwrap();

    let runner = Arc::new(RecordingRunner::new());
    let options = RunOptions::new(runner.clone(), temp.path()).build_number("3");
    let report = build_pipeline(&registry(), &manifest, options)
        .unwrap()
        .execute();

    assert!(report.is_success(), "{report:?}");
    let dockerfile = fs::read_to_string(temp.path().join("Dockerfile")).unwrap();
    assert!(dockerfile.contains("EXPOSE 9000"));
    assert!(runner.ran("docker build -f"));
    assert!(runner.ran("-t acrbackend.azurecr.io/backend-api:3 -t acrbackend.azurecr.io/backend-api:latest"));
}
