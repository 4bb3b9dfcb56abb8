use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, instrument, warn};

use crate::manifest::{PipelineManifest, PostSpec, expand_params};
use crate::notify::Notifier;
use crate::observability::MetricsCollector;
use crate::runner::{CommandOutput, CommandRunner, CommandSpec};
use crate::validation::gate_ordering_error;

pub type StageParameters = Map<String, Value>;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StageSpec {
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<StageParameters>,
}

fn default_enabled() -> bool {
    true
}

impl StageSpec {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            name: None,
            enabled: true,
            params: None,
        }
    }

    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.stage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// A failure aborts the run.
    Blocking,
    /// A failure is logged and swallowed.
    Advisory,
}

/// Mutable state threaded through the stages of one run.
#[derive(Debug, Default)]
pub struct BuildState {
    pub image_tags: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl BuildState {
    pub fn record(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }
}

#[derive(Clone)]
pub struct PipelineContext {
    pub build_number: String,
    pub environment: BTreeMap<String, String>,
    pub workspace: PathBuf,
    pub dry_run: bool,
    pub runner: Arc<dyn CommandRunner>,
    pub metrics: MetricsCollector,
}

impl PipelineContext {
    /// Run a command in the workspace with the pipeline environment applied.
    pub fn run(&self, command: CommandSpec) -> Result<CommandOutput> {
        let command = self.prepare(command);
        self.runner.run(&command)
    }

    pub fn run_checked(&self, command: CommandSpec) -> Result<CommandOutput> {
        let command = self.prepare(command);
        let output = self.runner.run(&command)?;
        output.ensure_success(&command)?;
        Ok(output)
    }

    pub fn var(&self, name: &str) -> Option<String> {
        self.environment
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
    }

    pub fn resolve_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let candidate = path.as_ref();
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.workspace.join(candidate)
        }
    }

    fn prepare(&self, mut command: CommandSpec) -> CommandSpec {
        let mut env = self.environment.clone();
        env.insert("BUILD_NUMBER".into(), self.build_number.clone());
        env.extend(std::mem::take(&mut command.env));
        command.env = env;
        if command.current_dir.is_none() {
            command.current_dir = Some(self.workspace.clone());
        }
        command
    }
}

/// Remove the `advisory` flag every stage accepts and turn it into a policy
/// override. Quality gates always block, so the flag is dropped for them.
pub fn take_policy_override(
    kind: &str,
    params: &mut StageParameters,
) -> Result<Option<FailurePolicy>> {
    let Some(value) = params.remove("advisory") else {
        return Ok(None);
    };
    let advisory = value
        .as_bool()
        .ok_or_else(|| anyhow!("'advisory' must be true or false, got {value}"))?;
    if kind == "quality_gate" {
        if advisory {
            warn!("quality_gate ignores 'advisory'; a failing gate always stops the pipeline");
        }
        return Ok(None);
    }
    Ok(Some(if advisory {
        FailurePolicy::Advisory
    } else {
        FailurePolicy::Blocking
    }))
}

pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    fn policy(&self) -> FailurePolicy;
    fn run(&self, state: &mut BuildState, ctx: &PipelineContext) -> Result<()>;
}

type StageConstructor = Arc<dyn Fn(StageParameters) -> Result<Box<dyn Stage>> + Send + Sync>;

pub struct StageRegistry {
    factories: HashMap<String, StageConstructor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(StageParameters) -> Result<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(constructor));
    }

    pub fn create(&self, name: &str, params: StageParameters) -> Result<Box<dyn Stage>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            anyhow!(
                "Unknown stage '{}'. Available stages: {}",
                name,
                self.known_stages().join(", ")
            )
        })?;
        factory(params)
    }

    pub fn known_stages(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Passed,
    PassedWithWarnings,
    Failed,
    Skipped,
    NotRun,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub label: String,
    pub stage: String,
    pub status: StageStatus,
    pub duration_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub pipeline: String,
    pub build_number: String,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
    pub stages: Vec<StageRecord>,
    pub image_tags: Vec<String>,
    pub metadata: Map<String, Value>,
    pub duration_ms: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub post_errors: Vec<String>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub fn status_of(&self, label: &str) -> Option<StageStatus> {
        self.stages
            .iter()
            .find(|record| record.label == label)
            .map(|record| record.status)
    }
}

struct PlannedStage {
    label: String,
    enabled: bool,
    policy: FailurePolicy,
    stage: Box<dyn Stage>,
}

pub struct PipelineExecutor {
    name: String,
    stages: Vec<PlannedStage>,
    post: PostSpec,
    ctx: PipelineContext,
    notifier: Notifier,
}

impl PipelineExecutor {
    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.ctx.metrics.clone()
    }

    /// Run every stage in order, then the post actions. Stage failures are
    /// reported in the returned [`RunReport`], never as an `Err`.
    #[instrument(skip(self), fields(pipeline = %self.name, build = %self.ctx.build_number))]
    pub fn execute(&self) -> RunReport {
        self.ctx.metrics.reset();
        let total_start = Instant::now();
        let mut state = BuildState::default();
        let mut records = Vec::with_capacity(self.stages.len());
        let mut failed_stage: Option<String> = None;

        for planned in &self.stages {
            let stage_name = planned.stage.name();
            if failed_stage.is_some() {
                records.push(record(planned, StageStatus::NotRun, 0.0, None));
                continue;
            }
            if !planned.enabled {
                info!(stage = planned.label.as_str(), "Stage disabled; skipping");
                self.ctx.metrics.record_skipped();
                records.push(record(planned, StageStatus::Skipped, 0.0, None));
                continue;
            }

            let span = tracing::span!(tracing::Level::INFO, "stage", stage = planned.label.as_str());
            let _span_guard = span.enter();
            let mut timer = self.ctx.metrics.start_stage(&planned.label);
            let started = Instant::now();
            info!(kind = stage_name, "Stage started");
            let result = planned.stage.run(&mut state, &self.ctx);
            if result.is_err() {
                timer.mark_failed();
            }
            drop(timer);
            let duration_ms = started.elapsed().as_secs_f64() * 1_000.0;

            match result {
                Ok(()) => {
                    info!(duration_ms, "Stage passed");
                    records.push(record(planned, StageStatus::Passed, duration_ms, None));
                }
                Err(err) if planned.policy == FailurePolicy::Advisory => {
                    warn!(error = %format!("{err:#}"), "Advisory stage failed; continuing");
                    self.ctx.metrics.record_advisory_failure();
                    records.push(record(
                        planned,
                        StageStatus::PassedWithWarnings,
                        duration_ms,
                        Some(format!("{err:#}")),
                    ));
                }
                Err(err) => {
                    error!(error = %format!("{err:#}"), "Stage failed; aborting pipeline");
                    records.push(record(
                        planned,
                        StageStatus::Failed,
                        duration_ms,
                        Some(format!("{err:#}")),
                    ));
                    failed_stage = Some(planned.label.clone());
                }
            }
        }

        let outcome = if failed_stage.is_some() {
            Outcome::Failure
        } else {
            Outcome::Success
        };

        let mut report = RunReport {
            pipeline: self.name.clone(),
            build_number: self.ctx.build_number.clone(),
            outcome,
            failed_stage,
            stages: records,
            image_tags: state.image_tags,
            metadata: state.metadata,
            duration_ms: 0.0,
            post_errors: Vec::new(),
        };

        report.post_errors = self.run_post(&report);
        let elapsed = total_start.elapsed();
        self.ctx.metrics.record_total_duration(elapsed);
        report.duration_ms = elapsed.as_secs_f64() * 1_000.0;
        report
    }

    fn run_post(&self, report: &RunReport) -> Vec<String> {
        let mut errors = Vec::new();
        let mut attempt = |label: &str, result: Result<()>| {
            if let Err(err) = result {
                warn!(action = label, error = %format!("{err:#}"), "Post action failed");
                self.ctx.metrics.record_post_failure();
                errors.push(format!("{label}: {err:#}"));
            }
        };

        for command in &self.post.always {
            attempt("always", self.run_shell(command));
        }
        if let Some(dir) = &self.post.clean_workspace {
            attempt("clean_workspace", self.clean_workspace(dir));
        }
        if self.post.prune_images {
            attempt(
                "prune_images",
                self.ctx
                    .run_checked(CommandSpec::new("docker").args(["image", "prune", "-f"]))
                    .map(|_| ()),
            );
        }

        let outcome_commands = match report.outcome {
            Outcome::Success => &self.post.success,
            Outcome::Failure => &self.post.failure,
        };
        for command in outcome_commands {
            attempt("outcome", self.run_shell(command));
        }

        attempt("notify", self.notifier.notify(report, self.ctx.dry_run));
        errors
    }

    fn run_shell(&self, line: &str) -> Result<()> {
        self.ctx.run_checked(CommandSpec::shell(line)).map(|_| ())
    }

    fn clean_workspace(&self, dir: &Path) -> Result<()> {
        let target = self.ctx.resolve_path(dir);
        if self.ctx.dry_run {
            info!(path = %target.display(), "Dry run: workspace cleanup skipped");
            return Ok(());
        }
        if !target.exists() {
            return Ok(());
        }
        // Emptied in place: the target may be the workspace root itself.
        let entries = fs::read_dir(&target)
            .with_context(|| format!("Failed to read workspace: {}", target.display()))?;
        let mut removed = 0usize;
        for entry in entries {
            let entry = entry
                .with_context(|| format!("Failed to read workspace: {}", target.display()))?;
            let path = entry.path();
            let is_dir = entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false);
            let result = if is_dir {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            result.with_context(|| format!("Failed to clean workspace entry: {}", path.display()))?;
            removed += 1;
        }
        info!(path = %target.display(), removed, "Workspace cleaned");
        Ok(())
    }
}

fn record(
    planned: &PlannedStage,
    status: StageStatus,
    duration_ms: f64,
    message: Option<String>,
) -> StageRecord {
    StageRecord {
        label: planned.label.clone(),
        stage: planned.stage.name().to_string(),
        status,
        duration_ms,
        message,
    }
}

pub struct RunOptions {
    pub build_number: String,
    pub workspace: PathBuf,
    pub dry_run: bool,
    pub runner: Arc<dyn CommandRunner>,
    /// Variables visible to `${VAR}` expansion before the manifest's own
    /// environment block.
    pub base_environment: BTreeMap<String, String>,
}

impl RunOptions {
    pub fn new(runner: Arc<dyn CommandRunner>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            build_number: "local".to_string(),
            workspace: workspace.into(),
            dry_run: false,
            runner,
            base_environment: BTreeMap::new(),
        }
    }

    pub fn build_number(mut self, build_number: impl Into<String>) -> Self {
        self.build_number = build_number.into();
        self
    }
}

pub fn build_pipeline(
    registry: &StageRegistry,
    manifest: &PipelineManifest,
    options: RunOptions,
) -> Result<PipelineExecutor> {
    let mut base = options.base_environment.clone();
    base.insert("BUILD_NUMBER".into(), options.build_number.clone());
    let environment = manifest.resolve_environment(&base);

    for idx in 0..manifest.stages.len() {
        if let Some(error) = gate_ordering_error(idx, &manifest.stages) {
            bail!(error);
        }
    }

    let mut stages = Vec::with_capacity(manifest.stages.len());
    for spec in &manifest.stages {
        let mut params = expand_params(&spec.params.clone().unwrap_or_default(), &environment);
        let policy_override = take_policy_override(&spec.stage, &mut params)
            .with_context(|| format!("Failed to configure stage '{}'", spec.label()))?;
        let stage = registry
            .create(&spec.stage, params)
            .with_context(|| format!("Failed to configure stage '{}'", spec.label()))?;
        stages.push(PlannedStage {
            label: spec.label().to_string(),
            enabled: spec.enabled,
            policy: policy_override.unwrap_or_else(|| stage.policy()),
            stage,
        });
    }

    let notify = manifest.post.notify.clone();
    Ok(PipelineExecutor {
        name: manifest.name.clone(),
        stages,
        post: manifest.post.clone(),
        ctx: PipelineContext {
            build_number: options.build_number,
            environment,
            workspace: options.workspace,
            dry_run: options.dry_run,
            runner: options.runner,
            metrics: MetricsCollector::new(),
        },
        notifier: Notifier::new(notify),
    })
}
