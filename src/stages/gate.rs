use std::time::Duration;

use anyhow::{Result, bail};
use tracing::info;

use super::{ensure_consumed, take_string, take_u64};
use crate::pipeline::{BuildState, FailurePolicy, PipelineContext, Stage, StageParameters};
use crate::quality::{AnalysisServerGate, ReportTask, wait_for_gate};
use crate::runner::CommandSpec;

const DEFAULT_REPORT_TASK: &str = ".scannerwork/report-task.txt";
const DEFAULT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

/// Waits for the analysis server's verdict on the scan submitted by the
/// preceding `static_analysis` stage. Always blocking.
pub struct QualityGateStage {
    report_task: String,
    server_url: Option<String>,
    token_env: String,
    timeout: Duration,
    poll_interval: Duration,
    command: Option<String>,
}

impl QualityGateStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let timeout_secs = take_u64(&mut params, "timeout_secs")?.unwrap_or(DEFAULT_TIMEOUT_SECS);
        let poll_interval_ms =
            take_u64(&mut params, "poll_interval_ms")?.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        if timeout_secs == 0 || poll_interval_ms == 0 {
            bail!("quality_gate 'timeout_secs' and 'poll_interval_ms' must be positive");
        }
        let stage = Self {
            report_task: take_string(&mut params, "report_task")
                .unwrap_or_else(|| DEFAULT_REPORT_TASK.to_string()),
            server_url: take_string(&mut params, "server_url"),
            token_env: take_string(&mut params, "token_env")
                .unwrap_or_else(|| "SONAR_TOKEN".to_string()),
            timeout: Duration::from_secs(timeout_secs),
            poll_interval: Duration::from_millis(poll_interval_ms),
            command: take_string(&mut params, "command"),
        };
        ensure_consumed("quality_gate", &params)?;
        Ok(stage)
    }
}

impl Stage for QualityGateStage {
    fn name(&self) -> &'static str {
        "quality_gate"
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::Blocking
    }

    fn run(&self, state: &mut BuildState, ctx: &PipelineContext) -> Result<()> {
        if ctx.dry_run {
            info!("Dry run: quality gate treated as passed");
            state.record("quality_gate.status", "dry-run");
            return Ok(());
        }

        if let Some(line) = &self.command {
            return match ctx.run_checked(CommandSpec::shell(line)) {
                Ok(_) => {
                    ctx.metrics.record_quality_pass();
                    state.record("quality_gate.status", "OK");
                    Ok(())
                }
                Err(err) => {
                    ctx.metrics.record_quality_failure();
                    state.record("quality_gate.status", "ERROR");
                    Err(err.context("Quality gate command rejected the build"))
                }
            };
        }

        let mut report = ReportTask::load(&ctx.resolve_path(&self.report_task))?;
        if let Some(url) = &self.server_url {
            report.server_url = url.trim_end_matches('/').to_string();
        }
        if let Some(dashboard) = &report.dashboard_url {
            state.record("quality_gate.dashboard", dashboard.as_str());
        }
        info!(
            server = report.server_url.as_str(),
            task = report.task_id.as_str(),
            timeout_s = self.timeout.as_secs(),
            "Waiting for quality gate"
        );

        let source = AnalysisServerGate::from_report(&report, ctx.var(&self.token_env))?;
        match wait_for_gate(&source, self.timeout, self.poll_interval) {
            Ok(()) => {
                ctx.metrics.record_quality_pass();
                state.record("quality_gate.status", "OK");
                Ok(())
            }
            Err(err) => {
                ctx.metrics.record_quality_failure();
                state.record("quality_gate.status", err.to_string());
                Err(err.into())
            }
        }
    }
}
