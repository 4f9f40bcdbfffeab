//! Batch summary: terminal text and `batch_summary.json`.

use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{
    BatchRun, DeviceMode, FoldSelector, SkippedSubject, SubjectManifest, SubjectOutcome, SubjectResult,
};
use crate::error::AppError;
use crate::io::AggregateReport;

pub const SUMMARY_JSON: &str = "batch_summary.json";

/// Outcome of a subject's pipeline. Reused outputs keep the status they
/// were produced with; `SubjectLine::cached` marks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectStatus {
    Completed,
    NotLocalized,
    Failed,
    Cancelled,
}

impl SubjectStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::NotLocalized => "not localized",
            Self::Failed => "FAILED",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubjectLine {
    pub id: String,
    pub status: SubjectStatus,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub completed: usize,
    pub not_localized: usize,
    /// Completed or not-localized subjects whose outputs were reused.
    pub cached: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub fold: String,
    /// Set when an unrecognized fold index made the batch use every fold.
    pub fold_fallback: bool,
    pub device: DeviceMode,
    pub loc_architecture: String,
    pub seg_architecture: String,
    pub counts: StatusCounts,
    pub subjects: Vec<SubjectLine>,
    pub skipped: Vec<SkippedSubject>,
    pub table: PathBuf,
    pub table_rows: usize,
    pub table_missing: Vec<String>,
}

impl BatchReport {
    pub fn new(
        batch: &BatchRun,
        fold: FoldSelector,
        results: &[SubjectResult],
        aggregate: &AggregateReport,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let mut counts = StatusCounts {
            skipped: batch.skipped.len(),
            ..StatusCounts::default()
        };
        let subjects: Vec<SubjectLine> = results.iter().map(subject_line).collect();
        for line in &subjects {
            match line.status {
                SubjectStatus::Completed => counts.completed += 1,
                SubjectStatus::NotLocalized => counts.not_localized += 1,
                SubjectStatus::Failed => counts.failed += 1,
                SubjectStatus::Cancelled => counts.cancelled += 1,
            }
            if line.cached {
                counts.cached += 1;
            }
        }

        let elapsed_secs = (finished_at - started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        Self {
            name: batch.name.clone(),
            started_at,
            finished_at,
            elapsed_secs,
            fold: fold.to_string(),
            fold_fallback: matches!(fold, FoldSelector::Unrecognized(_)),
            device: batch.config.device,
            loc_architecture: batch.config.localization.architecture.clone(),
            seg_architecture: batch.config.segmentation.architecture.clone(),
            counts,
            subjects,
            skipped: batch.skipped.clone(),
            table: aggregate.table.clone(),
            table_rows: aggregate.rows.len(),
            table_missing: aggregate.missing.clone(),
        }
    }
}

fn subject_line(result: &SubjectResult) -> SubjectLine {
    let localized = |m: &SubjectManifest| {
        if m.localized {
            SubjectStatus::Completed
        } else {
            SubjectStatus::NotLocalized
        }
    };
    let cached = matches!(result.outcome, SubjectOutcome::Cached(_));
    let (status, stage, error, exit_code) = match &result.outcome {
        SubjectOutcome::Completed(m) | SubjectOutcome::Cached(m) => (localized(m), None, None, None),
        SubjectOutcome::Failed { stage, error } => (
            SubjectStatus::Failed,
            Some(stage.to_string()),
            Some(error.message().to_string()),
            Some(error.exit_code()),
        ),
        SubjectOutcome::Cancelled => (SubjectStatus::Cancelled, None, None, None),
    };
    SubjectLine {
        id: result.subject_id.clone(),
        status,
        cached,
        stage,
        error,
        exit_code,
    }
}

/// Human-readable summary printed at the end of a batch.
pub fn format_batch_summary(report: &BatchReport) -> String {
    let mut out = String::new();

    out.push_str(&format!("=== ob - batch '{}' ===\n", report.name));
    out.push_str(&format!(
        "Models: loc={} seg={} ({}) | device={:?}\n",
        report.loc_architecture, report.seg_architecture, report.fold, report.device
    ));
    if report.fold_fallback {
        out.push_str("WARNING: fold selector not recognized; every fold was used.\n");
    }
    out.push_str(&format!(
        "Started: {} | elapsed {:.1}s\n",
        report.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        report.elapsed_secs
    ));

    let c = &report.counts;
    out.push_str(&format!(
        "Subjects: completed={} not_localized={} cached={} failed={} cancelled={} skipped={}\n",
        c.completed, c.not_localized, c.cached, c.failed, c.cancelled, c.skipped
    ));

    out.push('\n');
    out.push_str(format!("{:<24} {:<14} {:<14} {}\n", "subject", "status", "stage", "detail").trim_end());
    out.push('\n');
    out.push_str(format!("{:-<24} {:-<14} {:-<14} {:-<20}\n", "", "", "", "").trim_end());
    out.push('\n');
    for line in &report.subjects {
        out.push_str(
            format!(
                "{:<24} {:<14} {:<14} {}\n",
                truncate(&line.id, 24),
                line.status.label(),
                line.stage.as_deref().unwrap_or(""),
                line.error.as_deref().unwrap_or(if line.cached { "reused previous outputs" } else { "" }),
            )
            .trim_end(),
        );
        out.push('\n');
    }
    for skipped in &report.skipped {
        out.push_str(&format!(
            "{:<24} {:<14} {:<14} {}\n",
            truncate(&skipped.id, 24),
            "skipped",
            "",
            skipped.reason
        ));
    }

    out.push_str(&format!(
        "\nTable: {} ({} rows)\n",
        report.table.display(),
        report.table_rows
    ));
    if !report.table_missing.is_empty() {
        out.push_str(&format!("Not in table: {}\n", report.table_missing.join(", ")));
    }

    out
}

pub fn write_batch_summary_json(path: &Path, report: &BatchReport) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::runtime(format!("Failed to create '{}': {e}", path.display())))?;
    serde_json::to_writer_pretty(file, report)
        .map_err(|e| AppError::runtime(format!("Failed to write batch summary: {e}")))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('.');
    out
}
