use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

#[cfg(feature = "metrics-server")]
pub mod server;

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub quality_passes: u64,
    pub quality_failures: u64,
    pub advisory_failures: u64,
    pub skipped_stages: u64,
    pub post_action_failures: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub failures: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Shared, cloneable metrics sink for one pipeline run. Clones observe the
/// same counters, so a metrics server can read while stages write.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_stage(&self, label: &str) -> StageTimer {
        StageTimer {
            stage: label.to_string(),
            started_at: Instant::now(),
            failed: false,
            collector: self.inner.clone(),
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        self.update(|m| m.total_duration_ms = duration.as_secs_f64() * 1_000.0);
    }

    pub fn record_quality_pass(&self) {
        self.update(|m| m.quality_passes += 1);
    }

    pub fn record_quality_failure(&self) {
        self.update(|m| m.quality_failures += 1);
    }

    pub fn record_advisory_failure(&self) {
        self.update(|m| m.advisory_failures += 1);
    }

    pub fn record_skipped(&self) {
        self.update(|m| m.skipped_stages += 1);
    }

    pub fn record_post_failure(&self) {
        self.update(|m| m.post_action_failures += 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        self.update(|m| *m = MetricsSnapshot::default());
    }

    fn update(&self, apply: impl FnOnce(&mut MetricsSnapshot)) {
        if let Ok(mut guard) = self.inner.lock() {
            apply(&mut *guard);
        }
    }
}

/// Records one stage invocation when dropped.
pub struct StageTimer {
    stage: String,
    started_at: Instant,
    failed: bool,
    collector: Arc<Mutex<MetricsSnapshot>>,
}

impl StageTimer {
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            if self.failed {
                metrics.failures += 1;
            }
            metrics.total_duration_ms += duration_ms;
            metrics.max_duration_ms = metrics.max_duration_ms.max(duration_ms);
        }
        debug!(
            stage = self.stage.as_str(),
            duration_ms,
            failed = self.failed,
            "Stage duration recorded"
        );
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        stage_count = snapshot.stages.len(),
        quality_passes = snapshot.quality_passes,
        quality_failures = snapshot.quality_failures,
        advisory_failures = snapshot.advisory_failures,
        skipped_stages = snapshot.skipped_stages,
        post_action_failures = snapshot.post_action_failures,
        "Pipeline metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            failures = metrics.failures,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    /// Render in the Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters = [
            ("quality_passes_total", "Quality gates that reported OK", self.quality_passes),
            (
                "quality_failures_total",
                "Quality gates that failed or timed out",
                self.quality_failures,
            ),
            (
                "advisory_failures_total",
                "Advisory stage failures that did not stop the run",
                self.advisory_failures,
            ),
            ("skipped_stages_total", "Disabled stages skipped", self.skipped_stages),
            (
                "post_action_failures_total",
                "Post actions that failed",
                self.post_action_failures,
            ),
        ];
        for (name, help, value) in counters {
            family(&mut out, name, "counter", help);
            out.push_str(&format!("dockyard_{name} {value}\n"));
        }

        family(&mut out, "stage_calls_total", "counter", "Stage invocation count");
        family(&mut out, "stage_failures_total", "counter", "Stage invocations that returned an error");
        family(
            &mut out,
            "stage_duration_seconds_total",
            "counter",
            "Accumulated stage duration in seconds",
        );
        family(&mut out, "stage_duration_seconds_max", "gauge", "Slowest stage invocation in seconds");
        for (stage, metrics) in &self.stages {
            let label = format!("{{stage=\"{}\"}}", escape_label(stage));
            out.push_str(&format!("dockyard_stage_calls_total{label} {}\n", metrics.calls));
            out.push_str(&format!(
                "dockyard_stage_failures_total{label} {}\n",
                metrics.failures
            ));
            out.push_str(&format!(
                "dockyard_stage_duration_seconds_total{label} {:.6}\n",
                metrics.total_duration_ms / 1_000.0
            ));
            out.push_str(&format!(
                "dockyard_stage_duration_seconds_max{label} {:.6}\n",
                metrics.max_duration_ms / 1_000.0
            ));
        }

        family(&mut out, "pipeline_duration_seconds", "gauge", "Duration of the last pipeline run");
        out.push_str(&format!(
            "dockyard_pipeline_duration_seconds {:.6}\n",
            self.total_duration_ms / 1_000.0
        ));
        out
    }
}

fn family(out: &mut String, name: &str, kind: &str, help: &str) {
    out.push_str(&format!("# HELP dockyard_{name} {help}\n"));
    out.push_str(&format!("# TYPE dockyard_{name} {kind}\n"));
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_timer_records_on_drop() {
        let collector = MetricsCollector::new();
        {
            let _timer = collector.start_stage("image_build");
        }
        {
            let mut timer = collector.start_stage("image_build");
            timer.mark_failed();
        }
        collector.record_advisory_failure();
        collector.record_quality_failure();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.stages["image_build"].calls, 2);
        assert_eq!(snapshot.stages["image_build"].failures, 1);
        assert_eq!(snapshot.advisory_failures, 1);

        let prom = snapshot.to_prometheus();
        assert!(prom.contains("dockyard_stage_calls_total{stage=\"image_build\"} 2"));
        assert!(prom.contains("dockyard_stage_failures_total{stage=\"image_build\"} 1"));
        assert!(prom.contains("dockyard_quality_failures_total 1"));
        assert!(prom.contains("# TYPE dockyard_advisory_failures_total counter"));
    }

    #[test]
    fn reset_clears_previous_run() {
        let collector = MetricsCollector::new();
        collector.record_skipped();
        collector.reset();
        assert_eq!(collector.snapshot().skipped_stages, 0);
    }
}
