//! Two-stage container image definition for the Python service.
//!
//! The builder stage compiles dependencies into an isolated virtualenv; the
//! runtime stage copies only that virtualenv plus the application files into
//! a slim base, drops to an unprivileged user and declares the health check.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::health::HealthCheckPolicy;
use crate::validation::ValidationReport;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ImageDefinition {
    #[serde(default = "default_version")]
    pub version: u32,
    pub builder: BuilderStage,
    pub runtime: RuntimeStage,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BuilderStage {
    pub base: String,
    #[serde(default)]
    pub os_packages: Vec<String>,
    #[serde(default = "default_venv")]
    pub venv: String,
    #[serde(default = "default_requirements")]
    pub requirements: String,
    #[serde(default = "default_pip_flags")]
    pub pip_flags: Vec<String>,
}

fn default_venv() -> String {
    "/opt/venv".to_string()
}

fn default_requirements() -> String {
    "requirements.txt".to_string()
}

fn default_pip_flags() -> Vec<String> {
    vec!["--no-cache-dir".to_string()]
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RuntimeStage {
    pub base: String,
    #[serde(default)]
    pub os_packages: Vec<String>,
    #[serde(default = "default_workdir")]
    pub workdir: String,
    #[serde(default = "default_files")]
    pub files: Vec<String>,
    pub user: String,
    #[serde(default = "default_uid")]
    pub uid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub healthcheck: HealthCheckPolicy,
    /// Probe command run inside the container; defaults to curl against the
    /// health-check path on the exposed port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck_command: Option<String>,
    pub command: Vec<String>,
}

fn default_workdir() -> String {
    "/app".to_string()
}

fn default_files() -> Vec<String> {
    vec![".".to_string()]
}

fn default_uid() -> u32 {
    1000
}

impl ImageDefinition {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read image definition: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse image definition YAML: {}", path.display()))
    }

    /// The service image: dependencies built on a slim Python base, served by
    /// uvicorn on port 9000 as `appuser`.
    pub fn python_service() -> Self {
        let port = 9000;
        Self {
            version: 1,
            builder: BuilderStage {
                base: "python:3.11-slim".to_string(),
                os_packages: vec!["build-essential".to_string(), "gcc".to_string()],
                venv: default_venv(),
                requirements: default_requirements(),
                pip_flags: default_pip_flags(),
            },
            runtime: RuntimeStage {
                base: "python:3.11-slim".to_string(),
                os_packages: vec!["curl".to_string()],
                workdir: default_workdir(),
                files: default_files(),
                user: "appuser".to_string(),
                uid: default_uid(),
                output_dir: Some("/app/output".to_string()),
                port,
                env: BTreeMap::from([
                    ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
                    ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
                ]),
                healthcheck: HealthCheckPolicy::default(),
                healthcheck_command: None,
                command: [
                    "uvicorn",
                    "backend_api:app",
                    "--host",
                    "0.0.0.0",
                    "--port",
                    "9000",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            },
        }
    }

    pub fn healthcheck_command(&self) -> String {
        self.runtime.healthcheck_command.clone().unwrap_or_else(|| {
            format!(
                "curl -fsS http://localhost:{}{} || exit 1",
                self.runtime.port, self.runtime.healthcheck.path
            )
        })
    }

    /// Port passed to the server through `--port`, if the command names one.
    pub fn command_port(&self) -> Option<u16> {
        let command = &self.runtime.command;
        command
            .iter()
            .position(|arg| arg == "--port")
            .and_then(|idx| command.get(idx + 1))
            .and_then(|value| value.parse().ok())
            .or_else(|| {
                command
                    .iter()
                    .find_map(|arg| arg.strip_prefix("--port="))
                    .and_then(|value| value.parse().ok())
            })
    }

    pub fn render_dockerfile(&self) -> String {
        let builder = &self.builder;
        let runtime = &self.runtime;
        let mut out = String::from("# syntax=docker/dockerfile:1\n");

        out.push_str(&format!("FROM {} AS builder\n", builder.base));
        if !builder.os_packages.is_empty() {
            out.push_str(&apt_install(&builder.os_packages));
        }
        out.push_str(&format!("RUN python -m venv {}\n", builder.venv));
        out.push_str(&format!("ENV PATH=\"{}/bin:$PATH\"\n", builder.venv));
        out.push_str(&copy_instruction(&builder.requirements));
        let mut pip = String::from("pip install");
        for flag in &builder.pip_flags {
            pip.push(' ');
            pip.push_str(flag);
        }
        out.push_str(&format!("RUN {pip} -r {}\n\n", file_name(&builder.requirements)));

        out.push_str(&format!("FROM {}\n", runtime.base));
        if !runtime.os_packages.is_empty() {
            out.push_str(&apt_install(&runtime.os_packages));
        }
        out.push_str(&format!("WORKDIR {}\n", runtime.workdir));
        out.push_str(&format!("COPY --from=builder {0} {0}\n", builder.venv));
        out.push_str(&format!("ENV PATH=\"{}/bin:$PATH\"\n", builder.venv));
        for (key, value) in &runtime.env {
            out.push_str(&format!("ENV {key}={}\n", quoted(value)));
        }
        for file in &runtime.files {
            out.push_str(&copy_instruction(file));
        }

        out.push_str(&format!(
            "RUN useradd --create-home --uid {} {}",
            runtime.uid, runtime.user
        ));
        if let Some(dir) = &runtime.output_dir {
            out.push_str(&format!(
                " \\\n    && mkdir -p {dir} \\\n    && chown -R {user}:{user} {dir}",
                user = runtime.user
            ));
        }
        out.push('\n');

        out.push_str(&format!("EXPOSE {}\n", runtime.port));
        out.push_str(&format!(
            "HEALTHCHECK {} \\\n    CMD {}\n",
            runtime.healthcheck.dockerfile_flags(),
            self.healthcheck_command()
        ));
        out.push_str(&format!("USER {}\n", runtime.user));
        let command = serde_json::to_string(&runtime.command).unwrap_or_else(|_| "[]".into());
        out.push_str(&format!("CMD {command}\n"));
        out
    }
}

fn apt_install(packages: &[String]) -> String {
    format!(
        "RUN apt-get update \\\n    && apt-get install -y --no-install-recommends {} \\\n    && rm -rf /var/lib/apt/lists/*\n",
        packages.join(" ")
    )
}

/// Double-quoted with JSON escaping, which the Dockerfile parser accepts.
fn quoted(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("\"{value}\""))
}

/// Paths containing whitespace need the JSON form of `COPY`.
fn copy_instruction(source: &str) -> String {
    if source.chars().any(char::is_whitespace) {
        format!("COPY [{}, \".\"]\n", quoted(source))
    } else {
        format!("COPY {source} .\n")
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub fn write_dockerfile(definition: &ImageDefinition, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(path, definition.render_dockerfile())
        .with_context(|| format!("Failed to write Dockerfile: {}", path.display()))
}

pub fn validate_image(definition: &ImageDefinition) -> ValidationReport {
    let mut report = ValidationReport::default();
    let runtime = &definition.runtime;
    let health = &runtime.healthcheck;

    if definition.version != 1 {
        report.errors.push(format!(
            "Unsupported image definition version: {}",
            definition.version
        ));
    }
    if definition.builder.base.trim().is_empty() || runtime.base.trim().is_empty() {
        report.errors.push("Both stages need a base image".into());
    }
    if definition.builder.requirements.trim().is_empty() {
        report
            .errors
            .push("Builder stage must install a requirements file".into());
    }

    if runtime.user.trim().is_empty() || runtime.user == "root" || runtime.uid == 0 {
        report.errors.push(format!(
            "Runtime user must be unprivileged (user '{}', uid {})",
            runtime.user, runtime.uid
        ));
    }
    for key in runtime.env.keys() {
        if key.is_empty() || key.contains('=') || key.chars().any(char::is_whitespace) {
            report
                .errors
                .push(format!("Environment variable name '{key}' is not valid"));
        }
    }
    if runtime.port == 0 {
        report.errors.push("Runtime port must be non-zero".into());
    }
    match definition.command_port() {
        Some(port) if port != runtime.port => report.errors.push(format!(
            "Command serves port {port} but the image exposes {}",
            runtime.port
        )),
        None => report
            .warnings
            .push("Command does not pass --port; cannot confirm the exposed port".into()),
        _ => {}
    }
    if runtime.command.is_empty() {
        report.errors.push("Runtime command cannot be empty".into());
    } else if !runtime.command.iter().any(|arg| arg == "0.0.0.0") {
        report
            .warnings
            .push("Command does not bind 0.0.0.0; the service may be unreachable".into());
    }

    report.errors.extend(health.problems());
    if runtime.healthcheck_command.is_none() && !runtime.os_packages.iter().any(|p| p == "curl") {
        report.warnings.push(
            "Default health check uses curl but the runtime stage does not install it".into(),
        );
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_dockerfile_drops_root_before_cmd() {
        let dockerfile = ImageDefinition::python_service().render_dockerfile();
        let user_at = dockerfile.find("USER appuser").unwrap();
        let cmd_at = dockerfile.find("CMD [").unwrap();
        assert!(user_at < cmd_at);
        assert!(dockerfile.contains("FROM python:3.11-slim AS builder"));
        assert!(dockerfile.contains("COPY --from=builder /opt/venv /opt/venv"));
        assert!(dockerfile.contains("chown -R appuser:appuser /app/output"));
        assert!(dockerfile.contains("EXPOSE 9000"));
        assert!(dockerfile.contains(
            "HEALTHCHECK --interval=30s --timeout=10s --start-period=120s --retries=15"
        ));
        assert!(dockerfile.contains(
            r#"CMD ["uvicorn","backend_api:app","--host","0.0.0.0","--port","9000"]"#
        ));
    }

    #[test]
    fn command_port_reads_both_forms() {
        let mut definition = ImageDefinition::python_service();
        assert_eq!(definition.command_port(), Some(9000));
        definition.runtime.command = vec!["uvicorn".into(), "--port=8080".into()];
        assert_eq!(definition.command_port(), Some(8080));
    }
}
