use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Container health-check schedule. Defaults match the service image: probe
/// every 30s with a 10s timeout, ignore failures for the first 120s, and give
/// up after 15 consecutive failures.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct HealthCheckPolicy {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_start_period")]
    pub start_period_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_interval() -> u64 {
    30
}

fn default_timeout() -> u64 {
    10
}

fn default_start_period() -> u64 {
    120
}

fn default_retries() -> u32 {
    15
}

fn default_path() -> String {
    "/".to_string()
}

impl Default for HealthCheckPolicy {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            timeout_secs: default_timeout(),
            start_period_secs: default_start_period(),
            retries: default_retries(),
            path: default_path(),
        }
    }
}

impl HealthCheckPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn start_period(&self) -> Duration {
        Duration::from_secs(self.start_period_secs)
    }

    /// Latest point after start at which a never-healthy container is
    /// declared unhealthy.
    pub fn unhealthy_deadline(&self) -> Duration {
        self.start_period() + self.interval() * self.retries
    }

    /// Settings that would make the schedule meaningless, one message each.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.interval_secs == 0 || self.timeout_secs == 0 {
            problems.push("Health check interval and timeout must be positive".to_string());
        } else if self.timeout_secs >= self.interval_secs {
            problems.push(format!(
                "Health check timeout ({}s) must be shorter than its interval ({}s)",
                self.timeout_secs, self.interval_secs
            ));
        }
        if self.retries == 0 {
            problems.push("Health check needs at least one retry".to_string());
        }
        if !self.path.starts_with('/') {
            problems.push(format!("Health check path '{}' must start with '/'", self.path));
        }
        problems
    }

    /// Flags in the form the Dockerfile `HEALTHCHECK` instruction expects.
    pub fn dockerfile_flags(&self) -> String {
        format!(
            "--interval={}s --timeout={}s --start-period={}s --retries={}",
            self.interval_secs, self.timeout_secs, self.start_period_secs, self.retries
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Starting,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy(String),
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }
}

/// Folds probe results into a container health state.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    policy: HealthCheckPolicy,
    state: HealthState,
    failing_streak: u32,
}

impl HealthTracker {
    pub fn new(policy: HealthCheckPolicy) -> Self {
        Self {
            policy,
            state: HealthState::Starting,
            failing_streak: 0,
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn failing_streak(&self) -> u32 {
        self.failing_streak
    }

    /// Record a probe that finished `at` after container start and took
    /// `took`. A probe slower than the policy timeout counts as a failure.
    pub fn record(&mut self, at: Duration, took: Duration, outcome: &ProbeOutcome) -> HealthState {
        let passed = outcome.is_healthy() && took <= self.policy.timeout();
        if passed {
            self.failing_streak = 0;
            self.state = HealthState::Healthy;
            return self.state;
        }

        // Failures inside the start period only count once the container
        // has been healthy at least once.
        if self.state == HealthState::Starting && at < self.policy.start_period() {
            return self.state;
        }

        self.failing_streak += 1;
        if self.failing_streak >= self.policy.retries {
            self.state = HealthState::Unhealthy;
        }
        self.state
    }
}

/// Issue one lightweight GET against `url`. Any 2xx or 3xx answer is healthy.
pub fn probe(url: &str, timeout: Duration) -> Result<(ProbeOutcome, Duration)> {
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to build probe client")?;
    let started = Instant::now();
    let outcome = match client.get(url).send() {
        Ok(response) => {
            let status = response.status();
            if status.is_success() || status.is_redirection() {
                ProbeOutcome::Healthy
            } else {
                ProbeOutcome::Unhealthy(format!("HTTP {status}"))
            }
        }
        Err(err) if err.is_timeout() => {
            ProbeOutcome::Unhealthy(format!("no answer within {}s", timeout.as_secs_f64()))
        }
        Err(err) => ProbeOutcome::Unhealthy(err.to_string()),
    };
    Ok((outcome, started.elapsed()))
}

/// Probe `url` on the policy schedule until the tracker settles on healthy or
/// unhealthy.
pub fn monitor(url: &str, policy: &HealthCheckPolicy) -> Result<HealthState> {
    let problems = policy.problems();
    if !problems.is_empty() {
        bail!("Invalid health check policy: {}", problems.join("; "));
    }
    let mut tracker = HealthTracker::new(policy.clone());
    let started = Instant::now();
    loop {
        let (outcome, took) = probe(url, policy.timeout())?;
        let state = tracker.record(started.elapsed(), took, &outcome);
        match &outcome {
            ProbeOutcome::Healthy => debug!(url, took_ms = took.as_millis() as u64, "Probe passed"),
            ProbeOutcome::Unhealthy(reason) => warn!(
                url,
                reason = reason.as_str(),
                streak = tracker.failing_streak(),
                "Probe failed"
            ),
        }

        match state {
            HealthState::Healthy | HealthState::Unhealthy => {
                info!(url, state = ?state, elapsed_s = started.elapsed().as_secs(), "Health settled");
                return Ok(state);
            }
            HealthState::Starting => thread::sleep(policy.interval()),
        }
    }
}
