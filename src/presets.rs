use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};

use crate::image::{ImageDefinition, write_dockerfile};
use crate::manifest::{PipelineManifest, PostSpec};
use crate::pipeline::StageSpec;

pub const PRESETS: &[&str] = &["python-service", "image-only"];

pub fn preset_manifest(name: &str) -> Result<PipelineManifest> {
    match name {
        "python-service" => Ok(python_service_preset()),
        "image-only" => Ok(image_only_preset()),
        other => bail!("Unknown preset '{other}'. Available presets: {}", PRESETS.join(", ")),
    }
}

pub fn generate_preset(name: &str, destination: &Path) -> Result<PathBuf> {
    let manifest = preset_manifest(name)?;
    let rendered = serde_yaml::to_string(&manifest)?;
    write_file(destination, &rendered, "preset pipeline")?;
    Ok(destination.to_path_buf())
}

/// Write the default service image definition as YAML and, when `dockerfile`
/// is given, its rendered Dockerfile next to it.
pub fn generate_image_preset(destination: &Path, dockerfile: Option<&Path>) -> Result<PathBuf> {
    let definition = ImageDefinition::python_service();
    let rendered = serde_yaml::to_string(&definition)?;
    write_file(destination, &rendered, "image definition")?;
    if let Some(path) = dockerfile {
        write_dockerfile(&definition, path)?;
    }
    Ok(destination.to_path_buf())
}

fn write_file(destination: &Path, content: &str, what: &str) -> Result<()> {
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, content)
        .with_context(|| format!("Failed to write {what}: {}", destination.display()))
}

fn python_service_preset() -> PipelineManifest {
    PipelineManifest {
        version: 1,
        name: "backend-api".into(),
        environment: service_environment(),
        stages: vec![
            stage("checkout", None),
            stage(
                "static_analysis",
                Some(json!({
                    "project_key": "${IMAGE_NAME}",
                    "server_url": "${SONAR_SERVER}",
                })),
            ),
            stage("quality_gate", Some(json!({ "timeout_secs": 300 }))),
            stage("fs_scan", Some(json!({ "target": "." }))),
            stage(
                "image_build",
                Some(json!({
                    "repository": "${LOGIN_SERVER}/${IMAGE_NAME}",
                    "tag": "${IMAGE_TAG}",
                    "extra_tags": ["latest"],
                })),
            ),
            stage("image_scan", None),
            stage("registry_push", Some(json!({ "server": "${LOGIN_SERVER}" }))),
            StageSpec {
                enabled: false,
                ..stage(
                    "deploy",
                    Some(json!({
                        "deployment": "${IMAGE_NAME}",
                        "container": "${IMAGE_NAME}",
                    })),
                )
            },
        ],
        post: PostSpec {
            clean_workspace: Some(PathBuf::from(".")),
            prune_images: true,
            ..PostSpec::default()
        },
    }
}

fn image_only_preset() -> PipelineManifest {
    PipelineManifest {
        version: 1,
        name: "backend-image".into(),
        environment: service_environment(),
        stages: vec![
            stage("checkout", None),
            stage(
                "image_build",
                Some(json!({
                    "repository": "${LOGIN_SERVER}/${IMAGE_NAME}",
                    "tag": "${IMAGE_TAG}",
                    "definition": "image.yaml",
                })),
            ),
            stage("image_scan", None),
        ],
        post: PostSpec {
            prune_images: true,
            ..PostSpec::default()
        },
    }
}

fn service_environment() -> BTreeMap<String, String> {
    [
        ("REGISTRY_NAME", "acrbackend"),
        ("LOGIN_SERVER", "${REGISTRY_NAME}.azurecr.io"),
        ("IMAGE_NAME", "backend-api"),
        ("IMAGE_TAG", "${BUILD_NUMBER}"),
        ("SONAR_SERVER", "http://sonarqube:9000"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn stage(name: &str, params: Option<Value>) -> StageSpec {
    StageSpec {
        params: params.and_then(|value| match value {
            Value::Object(map) => Some(map),
            _ => None,
        }),
        ..StageSpec::new(name)
    }
}
