use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info};

use crate::manifest::NotifySpec;
use crate::pipeline::{Outcome, RunReport, StageStatus};

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    pipeline: &'a str,
    build_number: &'a str,
    outcome: Outcome,
    failed_stage: Option<&'a str>,
    image_tags: &'a [String],
    text: String,
}

/// Emits the end-of-run banner and, when configured, posts the outcome to a
/// webhook.
#[derive(Debug, Clone)]
pub struct Notifier {
    spec: NotifySpec,
}

impl Notifier {
    pub fn new(spec: NotifySpec) -> Self {
        Self { spec }
    }

    pub fn notify(&self, report: &RunReport, dry_run: bool) -> Result<()> {
        let text = banner(report);
        match report.outcome {
            Outcome::Success => info!(pipeline = %report.pipeline, "{text}"),
            Outcome::Failure => error!(pipeline = %report.pipeline, "{text}"),
        }

        let Some(url) = self.spec.webhook.as_deref() else {
            return Ok(());
        };
        if dry_run {
            info!(webhook = url, "Dry run: webhook notification skipped");
            return Ok(());
        }

        let payload = WebhookPayload {
            pipeline: &report.pipeline,
            build_number: &report.build_number,
            outcome: report.outcome,
            failed_stage: report.failed_stage.as_deref(),
            image_tags: &report.image_tags,
            text,
        };
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build webhook client")?;
        client
            .post(url)
            .json(&payload)
            .send()
            .with_context(|| format!("Failed to deliver notification to {url}"))?
            .error_for_status()
            .with_context(|| format!("Webhook {url} rejected the notification"))?;
        info!(webhook = url, "Notification delivered");
        Ok(())
    }
}

pub fn banner(report: &RunReport) -> String {
    match (&report.outcome, report.failed_stage.as_deref()) {
        (Outcome::Success, _) => {
            let warnings = report
                .stages
                .iter()
                .filter(|s| s.status == StageStatus::PassedWithWarnings)
                .count();
            if warnings == 0 {
                format!("Pipeline '{}' #{} succeeded", report.pipeline, report.build_number)
            } else {
                format!(
                    "Pipeline '{}' #{} succeeded with {} advisory warning(s)",
                    report.pipeline, report.build_number, warnings
                )
            }
        }
        (Outcome::Failure, stage) => format!(
            "Pipeline '{}' #{} failed at stage '{}'",
            report.pipeline,
            report.build_number,
            stage.unwrap_or("unknown")
        ),
    }
}
