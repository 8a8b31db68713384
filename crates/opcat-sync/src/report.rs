//! Run summaries: `{success, <platform>: {new, updated, skipped}, cleanup, duration}`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use opcat_core::parse_date_str;
use opcat_storage::Backend;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::reconcile::{ReconcileError, ReconcileOutcome};

pub const SUMMARY_FILE: &str = "summary.json";
pub const BRIEF_FILE: &str = "brief.md";

/// Top-level summary keys that a platform entry would collide with.
pub const RESERVED_REPORT_KEYS: [&str; 7] = [
    "success",
    "duration",
    "cleanup",
    "backend",
    "error",
    "run_id",
    "started_at",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReport {
    pub new: usize,
    pub updated: usize,
    pub skipped: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SourceReport {
    pub fn absorb(&mut self, other: SourceReport) {
        self.new += other.new;
        self.updated += other.updated;
        self.skipped += other.skipped;
        if self.error.is_none() {
            self.error = other.error;
        }
    }
}

/// Every record outcome of one source, in fetch order.
#[derive(Debug, Default)]
pub struct SourceLedger {
    pub fetch_error: Option<String>,
    pub outcomes: Vec<Result<ReconcileOutcome, ReconcileError>>,
}

impl SourceLedger {
    pub fn new(fetch_error: Option<String>) -> Self {
        Self {
            fetch_error,
            outcomes: Vec::new(),
        }
    }

    pub fn push(&mut self, outcome: Result<ReconcileOutcome, ReconcileError>) {
        self.outcomes.push(outcome);
    }

    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_err()).count()
    }

    /// Failed records count as skipped.
    pub fn summarize(&self) -> SourceReport {
        let mut report = SourceReport {
            error: self.fetch_error.clone(),
            ..SourceReport::default()
        };
        for outcome in &self.outcomes {
            match outcome {
                Ok(ReconcileOutcome::Created) => report.new += 1,
                Ok(ReconcileOutcome::Updated) => report.updated += 1,
                Ok(ReconcileOutcome::Skipped) | Err(_) => report.skipped += 1,
            }
        }
        report
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub deactivated: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub backend: Backend,
    pub success: bool,
    /// Keyed by lowercased platform.
    #[serde(flatten)]
    pub sources: BTreeMap<String, SourceReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds.
    pub duration: u64,
}

impl SyncReport {
    pub fn started(run_id: Uuid, started_at: DateTime<Utc>, backend: Backend) -> Self {
        Self {
            run_id,
            started_at,
            backend,
            success: false,
            sources: BTreeMap::new(),
            cleanup: None,
            error: None,
            duration: 0,
        }
    }

    pub fn record_source(&mut self, platform: &str, report: SourceReport) {
        self.sources
            .entry(platform.to_lowercase())
            .or_default()
            .absorb(report);
    }

    pub fn source(&self, platform: &str) -> Option<&SourceReport> {
        self.sources.get(&platform.to_lowercase())
    }

    pub fn brief_markdown(&self) -> String {
        let mut lines = vec![
            "# Opportunity Sync Brief".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Started: {}", self.started_at),
            format!("- Backend: {}", self.backend),
            format!("- Success: {}", self.success),
            format!("- Duration: {} ms", self.duration),
        ];
        if let Some(error) = &self.error {
            lines.push(format!("- Error: {error}"));
        }
        lines.push(String::new());
        lines.push("## Sources".to_string());
        for (platform, report) in &self.sources {
            let mut line = format!(
                "- {platform}: {} new, {} updated, {} skipped",
                report.new, report.updated, report.skipped
            );
            if let Some(error) = &report.error {
                line.push_str(&format!(" (fetch failed: {error})"));
            }
            lines.push(line);
        }
        if let Some(cleanup) = &self.cleanup {
            lines.push(String::new());
            lines.push("## Cleanup".to_string());
            lines.push(format!("- deactivated: {}", cleanup.deactivated));
            if let Some(error) = &cleanup.error {
                lines.push(format!("- error: {error}"));
            }
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

/// Newest first; directories without a readable summary are left out.
pub fn report_daily_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let entries = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?;

    let mut summaries = Vec::new();
    for entry in entries.filter_map(|entry| entry.ok()) {
        if !entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
            continue;
        }
        let path = entry.path().join(SUMMARY_FILE);
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        let summary: JsonValue =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let started = summary
            .get("started_at")
            .and_then(JsonValue::as_str)
            .and_then(parse_date_str);
        summaries.push((started, summary));
    }
    summaries.sort_by(|a, b| b.0.cmp(&a.0));

    let mut lines = vec!["# Opportunity Sync Report".to_string(), String::new()];
    for (_, summary) in summaries.into_iter().take(runs.max(1)) {
        let text = |key: &str| summary.get(key).map(display_scalar).unwrap_or_default();
        lines.push(format!("## Run `{}`", text("run_id")));
        lines.push(format!("- started: {}", text("started_at")));
        lines.push(format!("- backend: {}", text("backend")));
        lines.push(format!("- success: {}", text("success")));
        lines.push(format!("- duration: {} ms", text("duration")));
        if let Some(error) = summary.get("error").and_then(JsonValue::as_str) {
            lines.push(format!("- error: {error}"));
        }
        if let Some(map) = summary.as_object() {
            for (platform, counts) in map.iter().filter(|(_, v)| v.get("skipped").is_some()) {
                lines.push(format!(
                    "- {platform}: {} new, {} updated, {} skipped",
                    counts.get("new").map(display_scalar).unwrap_or_default(),
                    counts.get("updated").map(display_scalar).unwrap_or_default(),
                    counts.get("skipped").map(display_scalar).unwrap_or_default(),
                ));
            }
        }
        if let Some(deactivated) = summary.pointer("/cleanup/deactivated") {
            lines.push(format!("- deactivated: {}", display_scalar(deactivated)));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

fn display_scalar(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ledger_counts_failures_as_skipped() {
        let mut ledger = SourceLedger::new(None);
        ledger.push(Ok(ReconcileOutcome::Created));
        ledger.push(Ok(ReconcileOutcome::Created));
        ledger.push(Ok(ReconcileOutcome::Updated));
        ledger.push(Err(ReconcileError::NoCandidateKey("x".into())));
        ledger.push(Ok(ReconcileOutcome::Skipped));
        assert_eq!(ledger.failures(), 1);
        assert_eq!(
            ledger.summarize(),
            SourceReport {
                new: 2,
                updated: 1,
                skipped: 2,
                error: None
            }
        );
    }

    #[test]
    fn summary_flattens_platforms_into_the_top_level() {
        let mut report = SyncReport::started(Uuid::nil(), Utc::now(), Backend::File);
        report.success = true;
        report.record_source("MLH", SourceReport { new: 1, ..SourceReport::default() });
        report.record_source("mlh", SourceReport { skipped: 2, ..SourceReport::default() });
        report.cleanup = Some(CleanupReport::default());
        report.duration = 12;

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["success"], json!(true));
        assert_eq!(value["mlh"], json!({"new": 1, "updated": 0, "skipped": 2}));
        assert_eq!(value["cleanup"], json!({"deactivated": 0}));
        assert_eq!(value["duration"], json!(12));
        assert_eq!(value["backend"], json!("file"));
        assert!(value.get("error").is_none());
        assert!(report.brief_markdown().contains("- mlh: 1 new, 0 updated, 2 skipped"));
    }
}
