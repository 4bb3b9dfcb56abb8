use std::fs;

use dockyard::image::{ImageDefinition, validate_image, write_dockerfile};
use tempfile::tempdir;

const MINIMAL_DEFINITION: &str = r#"
builder:
  base: python:3.11-slim
runtime:
  base: python:3.11-slim
  os_packages: [curl]
  user: svc
  port: 8080
  command: [uvicorn, "app:app", --host, "0.0.0.0", --port, "8080"]
"#;

#[test]
fn service_definition_passes_validation() {
    let report = validate_image(&ImageDefinition::python_service());
    assert!(report.is_ok(), "{:?}", report.errors);
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
}

#[test]
fn root_user_is_rejected() {
    let mut definition = ImageDefinition::python_service();
    definition.runtime.user = "root".into();
    let report = validate_image(&definition);
    assert!(report.errors.iter().any(|e| e.contains("unprivileged")));

    let mut definition = ImageDefinition::python_service();
    definition.runtime.uid = 0;
    assert!(!validate_image(&definition).is_ok());
}

#[test]
fn command_port_must_match_exposed_port() {
    let mut definition = ImageDefinition::python_service();
    definition.runtime.port = 8000;
    let report = validate_image(&definition);
    assert!(
        report
            .errors
            .iter()
            .any(|e| e.contains("Command serves port 9000 but the image exposes 8000")),
        "{:?}",
        report.errors
    );
}

#[test]
fn health_timeout_must_fit_inside_interval() {
    let mut definition = ImageDefinition::python_service();
    definition.runtime.healthcheck.timeout_secs = 30;
    let report = validate_image(&definition);
    assert!(report.errors.iter().any(|e| e.contains("shorter than its interval")));

    definition.runtime.healthcheck.timeout_secs = 10;
    definition.runtime.healthcheck.retries = 0;
    assert!(validate_image(&definition).errors.iter().any(|e| e.contains("retry")));
}

#[test]
fn missing_curl_and_loopback_bind_only_warn() {
    let mut definition = ImageDefinition::python_service();
    definition.runtime.os_packages.clear();
    definition.runtime.command[3] = "127.0.0.1".into();

    let report = validate_image(&definition);

    assert!(report.is_ok(), "{:?}", report.errors);
    assert_eq!(report.warnings.len(), 2, "{:?}", report.warnings);
}

#[test]
fn yaml_definition_fills_defaults() {
    let definition: ImageDefinition = serde_yaml::from_str(MINIMAL_DEFINITION).unwrap();

    assert_eq!(definition.version, 1);
    assert_eq!(definition.builder.venv, "/opt/venv");
    assert_eq!(definition.builder.requirements, "requirements.txt");
    assert_eq!(definition.runtime.uid, 1000);
    assert_eq!(definition.runtime.healthcheck.retries, 15);
    assert!(validate_image(&definition).is_ok());

    let dockerfile = definition.render_dockerfile();
    assert!(dockerfile.contains("EXPOSE 8080"));
    assert!(dockerfile.contains("CMD curl -fsS http://localhost:8080/ || exit 1"));
    assert!(!dockerfile.contains("chown"));
}

#[test]
fn build_tools_stay_in_the_builder_stage() {
    let dockerfile = ImageDefinition::python_service().render_dockerfile();
    let (builder, runtime) = dockerfile.split_once("\n\nFROM ").unwrap();

    assert!(builder.contains("build-essential gcc"));
    assert!(builder.contains("RUN pip install --no-cache-dir -r requirements.txt"));
    assert!(!runtime.contains("build-essential"));
    assert!(!runtime.contains("pip install"));
    assert!(runtime.contains("--no-install-recommends curl"));
}

#[test]
fn custom_probe_command_replaces_curl() {
    let mut definition = ImageDefinition::python_service();
    definition.runtime.healthcheck_command = Some("python -c 'import urllib.request'".into());
    definition.runtime.os_packages.clear();

    let report = validate_image(&definition);
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    assert!(
        definition
            .render_dockerfile()
            .contains("CMD python -c 'import urllib.request'")
    );
}

#[test]
fn env_values_and_paths_with_spaces_stay_intact() {
    let mut definition = ImageDefinition::python_service();
    definition
        .runtime
        .env
        .insert("GREETING".into(), "hello \"docker\" world".into());
    definition.runtime.files = vec!["backend_api".into(), "static assets".into()];

    let dockerfile = definition.render_dockerfile();

    assert!(dockerfile.contains("ENV PYTHONUNBUFFERED=\"1\"\n"));
    assert!(dockerfile.contains(r#"ENV GREETING="hello \"docker\" world""#));
    assert!(dockerfile.contains("COPY backend_api .\n"));
    assert!(dockerfile.contains(r#"COPY ["static assets", "."]"#));
    assert!(validate_image(&definition).is_ok());
}

#[test]
fn malformed_env_names_are_rejected() {
    let mut definition = ImageDefinition::python_service();
    definition.runtime.env.insert("LOG LEVEL".into(), "info".into());
    definition.runtime.env.insert("A=B".into(), "c".into());

    let report = validate_image(&definition);

    assert_eq!(report.errors.len(), 2, "{:?}", report.errors);
    assert!(report.errors[0].contains("'A=B'"));
    assert!(report.errors[1].contains("'LOG LEVEL'"));
}

#[test]
fn write_dockerfile_creates_parent_directories() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("docker/service/Dockerfile");

    write_dockerfile(&ImageDefinition::python_service(), &path).unwrap();

    let written = fs::read_to_string(&path).unwrap();
    assert!(written.starts_with("# syntax=docker/dockerfile:1\n"));
    assert!(written.ends_with("\"9000\"]\n"));
}

#[test]
fn load_reports_the_failing_path() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("image.yaml");
    fs::write(&path, "builder: [").unwrap();

    let err = ImageDefinition::load(&path).unwrap_err();
    assert!(format!("{err:#}").contains("image.yaml"));
}
