use anyhow::{Result, anyhow, bail};
use serde_json::Value;
use tracing::{info, warn};

use crate::pipeline::{
    BuildState, FailurePolicy, PipelineContext, Stage, StageParameters, StageRegistry,
};
use crate::runner::CommandSpec;
use crate::security::summarize_scan_report;

mod container;
mod gate;

pub use container::{DeployStage, ImageBuildStage, RegistryPushStage};
pub use gate::QualityGateStage;

pub fn register_defaults(registry: &mut StageRegistry) {
    registry.register("checkout", |params| {
        Ok(Box::new(CheckoutStage::from_params(params)?))
    });
    registry.register("static_analysis", |params| {
        Ok(Box::new(StaticAnalysisStage::from_params(params)?))
    });
    registry.register("quality_gate", |params| {
        Ok(Box::new(QualityGateStage::from_params(params)?))
    });
    registry.register("fs_scan", |params| {
        Ok(Box::new(ScanStage::from_params(ScanTarget::Filesystem, params)?))
    });
    registry.register("image_build", |params| {
        Ok(Box::new(ImageBuildStage::from_params(params)?))
    });
    registry.register("image_scan", |params| {
        Ok(Box::new(ScanStage::from_params(ScanTarget::Image, params)?))
    });
    registry.register("registry_push", |params| {
        Ok(Box::new(RegistryPushStage::from_params(params)?))
    });
    registry.register("deploy", |params| {
        Ok(Box::new(DeployStage::from_params(params)?))
    });
    registry.register("shell", |params| {
        Ok(Box::new(ShellStage::from_params(params)?))
    });
}

struct CheckoutStage {
    repository: Option<String>,
    branch: String,
    directory: String,
    command: Option<String>,
}

impl CheckoutStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let stage = Self {
            repository: take_string(&mut params, "repository"),
            branch: take_string(&mut params, "branch").unwrap_or_else(|| "main".to_string()),
            directory: take_string(&mut params, "directory").unwrap_or_else(|| ".".to_string()),
            command: take_string(&mut params, "command"),
        };
        ensure_consumed("checkout", &params)?;
        Ok(stage)
    }
}

impl Stage for CheckoutStage {
    fn name(&self) -> &'static str {
        "checkout"
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::Blocking
    }

    fn run(&self, state: &mut BuildState, ctx: &PipelineContext) -> Result<()> {
        if let Some(line) = &self.command {
            ctx.run_checked(CommandSpec::shell(line))?;
            return Ok(());
        }

        let Some(repository) = &self.repository else {
            info!(workspace = %ctx.workspace.display(), "Using existing workspace checkout");
            state.record("checkout.source", "workspace");
            return Ok(());
        };

        ctx.run_checked(CommandSpec::new("git").args([
            "clone",
            "--depth",
            "1",
            "--branch",
            self.branch.as_str(),
            repository.as_str(),
            self.directory.as_str(),
        ]))?;
        state.record("checkout.source", repository.as_str());
        state.record("checkout.branch", self.branch.as_str());

        let head = ctx.run(
            CommandSpec::new("git")
                .args(["rev-parse", "HEAD"])
                .current_dir(ctx.resolve_path(&self.directory)),
        )?;
        let commit = head.stdout.trim();
        if head.success() && !commit.is_empty() {
            state.record("checkout.commit", commit);
        }
        Ok(())
    }
}

struct StaticAnalysisStage {
    project_key: String,
    sources: String,
    server_url: Option<String>,
    token_env: String,
    scanner: String,
    properties: Vec<(String, String)>,
    command: Option<String>,
}

impl StaticAnalysisStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let command = take_string(&mut params, "command");
        let project_key = take_string(&mut params, "project_key");
        let project_key = match (project_key, &command) {
            (Some(key), _) => key,
            (None, Some(_)) => String::new(),
            (None, None) => bail!("static_analysis stage requires 'project_key' parameter"),
        };
        let stage = Self {
            project_key,
            sources: take_string(&mut params, "sources").unwrap_or_else(|| ".".to_string()),
            server_url: take_string(&mut params, "server_url"),
            token_env: take_string(&mut params, "token_env")
                .unwrap_or_else(|| "SONAR_TOKEN".to_string()),
            scanner: take_string(&mut params, "scanner")
                .unwrap_or_else(|| "sonar-scanner".to_string()),
            properties: take_string_map(&mut params, "properties")?,
            command,
        };
        ensure_consumed("static_analysis", &params)?;
        Ok(stage)
    }
}

impl Stage for StaticAnalysisStage {
    fn name(&self) -> &'static str {
        "static_analysis"
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::Blocking
    }

    fn run(&self, state: &mut BuildState, ctx: &PipelineContext) -> Result<()> {
        let mut command = match &self.command {
            Some(line) => CommandSpec::shell(line),
            None => {
                let mut command = CommandSpec::new(&self.scanner)
                    .arg(format!("-Dsonar.projectKey={}", self.project_key))
                    .arg(format!("-Dsonar.sources={}", self.sources));
                let server = self
                    .server_url
                    .clone()
                    .or_else(|| ctx.var("SONAR_HOST_URL"));
                if let Some(url) = server {
                    command = command.arg(format!("-Dsonar.host.url={url}"));
                }
                for (key, value) in &self.properties {
                    command = command.arg(format!("-D{key}={value}"));
                }
                command
            }
        };
        if let Some(token) = ctx.var(&self.token_env) {
            command.env.insert("SONAR_TOKEN".to_string(), token);
        }

        ctx.run_checked(command)?;
        if !self.project_key.is_empty() {
            state.record("analysis.project_key", self.project_key.as_str());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanTarget {
    Filesystem,
    Image,
}

struct ScanStage {
    target: ScanTarget,
    path: Option<String>,
    severity: String,
    exit_code: u32,
    scanner: String,
    output: Option<String>,
    command: Option<String>,
}

impl ScanStage {
    fn from_params(target: ScanTarget, mut params: StageParameters) -> Result<Self> {
        let stage = Self {
            target,
            path: take_string(&mut params, "target"),
            severity: take_string(&mut params, "severity")
                .unwrap_or_else(|| "HIGH,CRITICAL".to_string()),
            exit_code: take_u32(&mut params, "exit_code")?.unwrap_or(0),
            scanner: take_string(&mut params, "scanner").unwrap_or_else(|| "trivy".to_string()),
            output: take_string(&mut params, "output"),
            command: take_string(&mut params, "command"),
        };
        ensure_consumed(stage.kind(), &params)?;
        Ok(stage)
    }

    fn kind(&self) -> &'static str {
        match self.target {
            ScanTarget::Filesystem => "fs_scan",
            ScanTarget::Image => "image_scan",
        }
    }

    fn resolve_target(&self, state: &BuildState) -> Result<String> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        match self.target {
            ScanTarget::Filesystem => Ok(".".to_string()),
            ScanTarget::Image => state
                .image_tags
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("image_scan requires an image built earlier in the run")),
        }
    }
}

impl Stage for ScanStage {
    fn name(&self) -> &'static str {
        self.kind()
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::Advisory
    }

    fn run(&self, state: &mut BuildState, ctx: &PipelineContext) -> Result<()> {
        let command = match &self.command {
            Some(line) => CommandSpec::shell(line),
            None => {
                let subcommand = match self.target {
                    ScanTarget::Filesystem => "fs",
                    ScanTarget::Image => "image",
                };
                let mut command = CommandSpec::new(&self.scanner)
                    .arg(subcommand)
                    .args(["--exit-code".to_string(), self.exit_code.to_string()])
                    .args(["--severity", self.severity.as_str()])
                    .arg("--no-progress");
                if let Some(output) = &self.output {
                    command = command.args(["--format", "json", "--output", output.as_str()]);
                }
                command.arg(self.resolve_target(state)?)
            }
        };

        let result = ctx.run_checked(command);
        state.record(
            format!("{}.status", self.kind()),
            if result.is_ok() { "clean" } else { "findings" },
        );
        if let Some(output) = &self.output {
            state.record(format!("{}.report", self.kind()), output.as_str());
            let report_path = ctx.resolve_path(output);
            if !ctx.dry_run && report_path.exists() {
                match summarize_scan_report(&report_path) {
                    Ok(summary) => {
                        info!(findings = summary.total(), "Scan report summarized");
                        state.record(
                            format!("{}.findings", self.kind()),
                            serde_json::to_value(&summary.by_severity).unwrap_or_default(),
                        );
                    }
                    Err(err) => warn!(error = %format!("{err:#}"), "Scan report unreadable"),
                }
            }
        }
        result.map(|_| ())
    }
}

struct ShellStage {
    command: String,
}

impl ShellStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let command = take_string(&mut params, "command")
            .ok_or_else(|| anyhow!("shell stage requires 'command' parameter"))?;
        ensure_consumed("shell", &params)?;
        Ok(Self { command })
    }
}

impl Stage for ShellStage {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::Blocking
    }

    fn run(&self, _state: &mut BuildState, ctx: &PipelineContext) -> Result<()> {
        ctx.run_checked(CommandSpec::shell(&self.command))?;
        Ok(())
    }
}

fn ensure_consumed(stage: &str, params: &StageParameters) -> Result<()> {
    if params.is_empty() {
        return Ok(());
    }
    let keys: Vec<&str> = params.keys().map(String::as_str).collect();
    bail!("{stage} stage does not accept parameter(s): {}", keys.join(", "))
}

fn take_string(params: &mut StageParameters, key: &str) -> Option<String> {
    params.remove(key).and_then(|value| match value {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

fn take_u64(params: &mut StageParameters, key: &str) -> Result<Option<u64>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(num)) => num
            .as_u64()
            .map(Some)
            .ok_or_else(|| anyhow!("'{key}' must be a non-negative integer, got {num}")),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("'{key}' must be a non-negative integer, got \"{s}\"")),
        Some(other) => bail!("'{key}' must be a non-negative integer, got {other}"),
    }
}

fn take_u32(params: &mut StageParameters, key: &str) -> Result<Option<u32>> {
    take_u64(params, key)?
        .map(|n| u32::try_from(n).map_err(|_| anyhow!("'{key}' is out of range, got {n}")))
        .transpose()
}

fn take_bool(params: &mut StageParameters, key: &str) -> Result<Option<bool>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(b)),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Ok(Some(true)),
            "false" | "no" => Ok(Some(false)),
            _ => bail!("'{key}' must be true or false, got \"{s}\""),
        },
        Some(other) => bail!("'{key}' must be true or false, got {other}"),
    }
}

fn take_string_list(params: &mut StageParameters, key: &str) -> Result<Option<Vec<String>>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(vec![s])),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                Value::Number(n) => Ok(n.to_string()),
                other => Err(anyhow!("'{key}' entries must be strings, found {other}")),
            })
            .collect::<Result<Vec<_>>>()
            .map(Some),
        Some(other) => bail!("'{key}' must be a list of strings, found {other}"),
    }
}

fn take_string_map(params: &mut StageParameters, key: &str) -> Result<Vec<(String, String)>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Object(map)) => Ok(map
            .into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect()),
        Some(other) => bail!("'{key}' must be a mapping, found {other}"),
    }
}
