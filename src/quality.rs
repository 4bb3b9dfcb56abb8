use std::collections::BTreeMap;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateStatus {
    /// Analysis still queued or in progress on the server.
    Pending,
    Passed,
    Failed(String),
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("Quality gate failed with status {status}")]
    Failed { status: String },
    #[error("Quality gate did not report within {waited_secs}s")]
    TimedOut { waited_secs: u64 },
    #[error("Analysis task ended with status {status}")]
    TaskFailed { status: String },
    #[error(transparent)]
    Source(#[from] anyhow::Error),
}

const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub trait GateSource {
    /// One status check. It must not run longer than `budget`.
    fn poll(&self, budget: Duration) -> Result<GateStatus, GateError>;
}

/// Poll `source` until it reports a verdict or `timeout` elapses. The gate is
/// the only hard stop in a pipeline, so every outcome other than `Passed` is
/// an error. Each poll only gets the time left before the deadline.
pub fn wait_for_gate(
    source: &dyn GateSource,
    timeout: Duration,
    interval: Duration,
) -> Result<(), GateError> {
    let started = Instant::now();
    let timed_out = || GateError::TimedOut {
        waited_secs: timeout.as_secs(),
    };
    loop {
        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(timed_out());
        }
        let status = match source.poll(remaining) {
            Ok(status) => status,
            // A request cut short by the deadline is a timeout, not a source error.
            Err(GateError::Source(_)) if started.elapsed() >= timeout => return Err(timed_out()),
            Err(err) => return Err(err),
        };
        match status {
            GateStatus::Passed => {
                info!(waited_ms = started.elapsed().as_millis() as u64, "Quality gate passed");
                return Ok(());
            }
            GateStatus::Failed(status) => return Err(GateError::Failed { status }),
            GateStatus::Pending => {
                debug!("Quality gate pending");
            }
        }

        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return Err(timed_out());
        }
        thread::sleep(interval.min(timeout - elapsed));
    }
}

/// Scanner hand-off file (`report-task.txt`) written by the static analysis
/// step, a flat list of `key=value` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportTask {
    pub server_url: String,
    pub task_id: String,
    pub project_key: Option<String>,
    pub dashboard_url: Option<String>,
}

impl ReportTask {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read analysis report task: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Malformed analysis report task: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let entries: BTreeMap<&str, &str> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim(), v.trim()))
            .collect();

        let server_url = entries
            .get("serverUrl")
            .ok_or_else(|| anyhow!("missing 'serverUrl'"))?
            .trim_end_matches('/')
            .to_string();
        let task_id = entries
            .get("ceTaskId")
            .ok_or_else(|| anyhow!("missing 'ceTaskId'"))?
            .to_string();

        Ok(Self {
            server_url,
            task_id,
            project_key: entries.get("projectKey").map(|s| s.to_string()),
            dashboard_url: entries.get("dashboardUrl").map(|s| s.to_string()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TaskEnvelope {
    task: TaskBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskBody {
    status: String,
    #[serde(default)]
    analysis_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectStatusEnvelope {
    project_status: ProjectStatus,
}

#[derive(Debug, Deserialize)]
struct ProjectStatus {
    status: String,
}

/// Reads the gate verdict from a SonarQube-compatible analysis server: first
/// the background task, then the project status of the resulting analysis.
pub struct AnalysisServerGate {
    client: reqwest::blocking::Client,
    server_url: String,
    task_id: String,
    token: Option<String>,
}

impl AnalysisServerGate {
    pub fn new(server_url: &str, task_id: &str, token: Option<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(MAX_REQUEST_TIMEOUT)
            .build()
            .context("Failed to build analysis server client")?;
        Ok(Self {
            client,
            server_url: server_url.trim_end_matches('/').to_string(),
            task_id: task_id.to_string(),
            token,
        })
    }

    pub fn from_report(report: &ReportTask, token: Option<String>) -> Result<Self> {
        Self::new(&report.server_url, &report.task_id, token)
    }

    fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        deadline: Instant,
    ) -> Result<T> {
        let url = format!("{}{}", self.server_url, path);
        let budget = deadline
            .saturating_duration_since(Instant::now())
            .min(MAX_REQUEST_TIMEOUT);
        let mut request = self.client.get(&url).query(query).timeout(budget);
        if let Some(token) = &self.token {
            request = request.basic_auth(token, Some(""));
        }
        request
            .send()
            .with_context(|| format!("Request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("Analysis server rejected {url}"))?
            .json()
            .with_context(|| format!("Unexpected response body from {url}"))
    }
}

impl GateSource for AnalysisServerGate {
    fn poll(&self, budget: Duration) -> Result<GateStatus, GateError> {
        let deadline = Instant::now() + budget;
        let envelope: TaskEnvelope =
            self.get("/api/ce/task", &[("id", self.task_id.as_str())], deadline)?;
        match envelope.task.status.as_str() {
            "PENDING" | "IN_PROGRESS" => Ok(GateStatus::Pending),
            "SUCCESS" => {
                let analysis_id = envelope
                    .task
                    .analysis_id
                    .ok_or_else(|| anyhow!("Completed task {} has no analysisId", self.task_id))?;
                let status: ProjectStatusEnvelope = self.get(
                    "/api/qualitygates/project_status",
                    &[("analysisId", analysis_id.as_str())],
                    deadline,
                )?;
                match status.project_status.status.as_str() {
                    "OK" => Ok(GateStatus::Passed),
                    other => Ok(GateStatus::Failed(other.to_string())),
                }
            }
            other => Err(GateError::TaskFailed {
                status: other.to_string(),
            }),
        }
    }
}
