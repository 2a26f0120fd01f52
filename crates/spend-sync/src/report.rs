//! Per-run report files under `<reports_dir>/<run_id>/`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spend_adapters::AdapterError;
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Fetch,
    Insert,
    RetryFetch,
    RetryInsert,
}

impl FailureStage {
    pub fn fetch(retry: bool) -> Self {
        if retry {
            FailureStage::RetryFetch
        } else {
            FailureStage::Fetch
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureStage::Fetch => "fetch",
            FailureStage::Insert => "insert",
            FailureStage::RetryFetch => "retry_fetch",
            FailureStage::RetryInsert => "retry_insert",
        }
    }

    pub fn insert(retry: bool) -> Self {
        if retry {
            FailureStage::RetryInsert
        } else {
            FailureStage::Insert
        }
    }
}

/// One failed source attempt. Field order matches the CSV columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub timestamp: DateTime<Utc>,
    pub council: String,
    pub url: String,
    pub stage: FailureStage,
    pub is_custom_fetcher: bool,
    pub http_status: Option<u16>,
    pub content_type: Option<String>,
    pub error_kind: String,
    pub error: String,
    pub snippet: Option<String>,
}

pub const FAILURE_CSV_COLUMNS: [&str; 10] = [
    "timestamp",
    "council",
    "url",
    "stage",
    "is_custom_fetcher",
    "http_status",
    "content_type",
    "error_kind",
    "error",
    "snippet",
];

impl FetchFailure {
    fn base(council: &str, url: &str, stage: FailureStage, custom: bool, kind: &str, error: String) -> Self {
        Self {
            timestamp: Utc::now(),
            council: council.to_string(),
            url: url.to_string(),
            stage,
            is_custom_fetcher: custom,
            http_status: None,
            content_type: None,
            error_kind: kind.to_string(),
            error,
            snippet: None,
        }
    }

    pub fn from_adapter(council: &str, url: &str, stage: FailureStage, custom: bool, err: &AdapterError) -> Self {
        Self {
            http_status: err.http_status(),
            content_type: err.content_type().map(str::to_string),
            snippet: err.snippet().map(str::to_string),
            ..Self::base(council, url, stage, custom, err.kind(), err.to_string())
        }
    }

    pub fn timeout(council: &str, url: &str, stage: FailureStage, custom: bool, after: Duration) -> Self {
        Self::base(
            council,
            url,
            stage,
            custom,
            "timeout",
            format!("source timed out after {after:?}"),
        )
    }

    pub fn other(council: &str, url: &str, stage: FailureStage, custom: bool, kind: &str, error: String) -> Self {
        Self::base(council, url, stage, custom, kind, error)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub catalog_from_cache: bool,
    pub catalog_soft_failures: usize,
    pub sources_attempted: usize,
    pub sources_succeeded: usize,
    pub sources_retried: usize,
    pub sources_timed_out: usize,
    pub sources_hard_failed: usize,
    pub rows_fetched: usize,
    pub rows_inserted: usize,
    pub rows_skipped: usize,
    pub rows_duplicate: usize,
    pub rows_rejected_no_date: usize,
    pub amounts_defaulted: usize,
    pub reports_dir: String,
}

impl RunSummary {
    pub fn brief_markdown(&self, failures: &[FetchFailure]) -> String {
        let failure_lines = if failures.is_empty() {
            "- none".to_string()
        } else {
            failures
                .iter()
                .map(|f| format!("- {} ({}, {}): {}", f.council, f.stage.as_str(), f.error_kind, f.error))
                .collect::<Vec<_>>()
                .join("\n")
        };
        format!(
            "# Council Spend Sync\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Sources: {} attempted, {} succeeded, {} retried, {} timed out, {} failed\n- Rows: {} fetched, {} inserted, {} skipped ({} duplicate, {} undated)\n- Amounts defaulted: {}\n- Catalog: {} (soft failures: {})\n\n## Failures\n{}\n",
            self.run_id,
            self.started_at,
            self.finished_at,
            self.sources_attempted,
            self.sources_succeeded,
            self.sources_retried,
            self.sources_timed_out,
            self.sources_hard_failed,
            self.rows_fetched,
            self.rows_inserted,
            self.rows_skipped,
            self.rows_duplicate,
            self.rows_rejected_no_date,
            self.amounts_defaulted,
            if self.catalog_from_cache { "cached" } else { "rebuilt" },
            self.catalog_soft_failures,
            failure_lines,
        )
    }
}

pub fn failures_csv(failures: &[FetchFailure]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer
        .write_record(FAILURE_CSV_COLUMNS)
        .context("writing failure csv header")?;
    for failure in failures {
        writer.serialize(failure).context("writing failure csv row")?;
    }
    writer.into_inner().context("flushing failure csv")
}

/// Write `run_summary.json`, `fetch_failures.json`, `fetch_failures.csv` and a
/// markdown brief. Returns the run directory.
pub async fn write_run_reports(reports_root: &Path, summary: &RunSummary, failures: &[FetchFailure]) -> Result<PathBuf> {
    let dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let summary_json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(dir.join("run_summary.json"), summary_json)
        .await
        .context("writing run_summary.json")?;

    let failures_json = serde_json::to_vec_pretty(failures).context("serializing fetch failures")?;
    fs::write(dir.join("fetch_failures.json"), failures_json)
        .await
        .context("writing fetch_failures.json")?;

    fs::write(dir.join("fetch_failures.csv"), failures_csv(failures)?)
        .await
        .context("writing fetch_failures.csv")?;

    fs::write(dir.join("run_brief.md"), summary.brief_markdown(failures))
        .await
        .context("writing run_brief.md")?;

    Ok(dir)
}

/// Markdown briefs of the latest `runs` report directories, newest first.
pub fn recent_briefs(reports_root: &Path, runs: usize) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| {
        e.metadata()
            .and_then(|m| m.modified())
            .ok()
    });
    dirs.reverse();

    let mut out = Vec::new();
    for entry in dirs.into_iter().take(runs) {
        let brief = entry.path().join("run_brief.md");
        if let Ok(text) = std::fs::read_to_string(&brief) {
            out.push(text);
        }
    }
    Ok(out.join("\n---\n\n"))
}
