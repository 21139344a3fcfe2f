// =============================================================================
// Cycle Export — JSON snapshots on disk
// =============================================================================
//
// Each cycle writes a timestamped report and refreshes the latest-scores file.
// Both go through tmp + rename so a reader never sees a half-written file.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::pipeline::CycleReport;
use crate::risk::RiskScore;

pub const LATEST_FILE: &str = "riskpulse_latest.json";

#[derive(Serialize)]
struct LatestScores<'a> {
    generated_at: DateTime<Utc>,
    cycle_id: &'a str,
    scores: &'a [RiskScore],
}

/// Serialise `value` to `path` atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value).context("failed to serialise export")?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &content)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename into {}", path.display()))?;
    Ok(())
}

/// File name of the report for a cycle finishing at `at`.
pub fn report_file_name(at: DateTime<Utc>) -> String {
    format!("riskpulse_{}.json", at.format("%Y%m%d_%H%M%S"))
}

/// Write the cycle report and refresh the latest-scores file under `dir`.
/// Returns the report path.
pub fn export_cycle(dir: &Path, report: &CycleReport, latest: &[RiskScore]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create export dir {}", dir.display()))?;

    let report_path = dir.join(report_file_name(report.finished_at));
    write_json_atomic(&report_path, report)?;

    let latest_path = dir.join(LATEST_FILE);
    write_json_atomic(
        &latest_path,
        &LatestScores {
            generated_at: report.finished_at,
            cycle_id: &report.cycle_id,
            scores: latest,
        },
    )?;

    debug!(
        report = %report_path.display(),
        latest = %latest_path.display(),
        "cycle exported"
    );
    Ok(report_path)
}
