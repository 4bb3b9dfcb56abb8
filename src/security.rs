use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Compute the SHA256 digest of the file at `path` and return it as a hex string.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Write `<digest>  <path>` for `path` into `output`, the format `sha256sum -c`
/// accepts.
pub fn write_sha256(path: &Path, output: &Path) -> Result<String> {
    let digest = compute_sha256(path)?;
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create digest directory: {}", parent.display()))?;
    }
    let mut file = File::create(output)
        .with_context(|| format!("Failed to create digest file: {}", output.display()))?;
    writeln!(file, "{}  {}", digest, path.display())
        .with_context(|| format!("Failed to write digest file: {}", output.display()))?;
    Ok(digest)
}

/// Vulnerability counts by severity from a scanner JSON report.
#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct ScanSummary {
    pub target: Option<String>,
    pub by_severity: BTreeMap<String, u64>,
}

impl ScanSummary {
    pub fn total(&self) -> u64 {
        self.by_severity.values().sum()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ScanReport {
    artifact_name: Option<String>,
    #[serde(default)]
    results: Vec<ScanResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ScanResult {
    #[serde(default)]
    vulnerabilities: Option<Vec<Vulnerability>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Vulnerability {
    severity: String,
}

pub fn summarize_scan_report(path: &Path) -> Result<ScanSummary> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read scan report: {}", path.display()))?;
    parse_scan_report(&content)
        .with_context(|| format!("Failed to parse scan report: {}", path.display()))
}

fn parse_scan_report(content: &str) -> Result<ScanSummary> {
    let report: ScanReport = serde_json::from_str(content)?;
    let mut summary = ScanSummary {
        target: report.artifact_name,
        ..ScanSummary::default()
    };
    for vulnerability in report
        .results
        .iter()
        .filter_map(|result| result.vulnerabilities.as_ref())
        .flatten()
    {
        *summary
            .by_severity
            .entry(vulnerability.severity.to_uppercase())
            .or_default() += 1;
    }
    Ok(summary)
}
