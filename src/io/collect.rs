//! Copy per-subject results into the output tree and build the aggregate table.
//!
//! Layout: `output_root/<subject>/{mri,QC,stats}/...` plus
//! `output_root/ob_stats_table.csv`.
//!
//! A subject with outputs this run has its three groups replaced, never
//! merged. Subjects that failed or were cancelled keep whatever an earlier
//! run left behind, but only this run's summaries reach the table.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::domain::{SubjectManifest, SubjectResult};
use crate::error::AppError;
use crate::io::table::{TABLE_FILE, TableEntry, write_stats_table};
use crate::task::{MRI_DIR, QC_DIR, STATS_DIR, SUMMARY_FILE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateReport {
    pub table: PathBuf,
    /// Subjects with a row in the table, in dispatch order.
    pub rows: Vec<String>,
    /// Subjects without a summary from this run.
    pub missing: Vec<String>,
    pub files_copied: usize,
}

/// Persist every completed or cached subject, then aggregate.
pub fn collect(results: &[SubjectResult], output_root: &Path) -> Result<AggregateReport, AppError> {
    fs::create_dir_all(output_root)
        .map_err(|e| AppError::runtime(format!("Failed to create '{}': {e}", output_root.display())))?;

    let mut files_copied = 0;
    let mut entries = Vec::with_capacity(results.len());
    for result in results {
        let mut summary = None;
        if let Some(manifest) = result.manifest() {
            let target = output_root.join(&result.subject_id);
            files_copied += copy_subject(manifest, &target)?;
            summary = manifest
                .stats
                .iter()
                .any(|f| f.file_name().is_some_and(|n| n == SUMMARY_FILE))
                .then(|| target.join(STATS_DIR).join(SUMMARY_FILE));
        }
        entries.push(TableEntry {
            subject_id: result.subject_id.clone(),
            summary,
        });
    }
    info!(files = files_copied, "outputs copied to '{}'", output_root.display());

    let table = output_root.join(TABLE_FILE);
    let outcome = write_stats_table(&entries, &table)?;

    Ok(AggregateReport {
        table,
        rows: outcome.rows,
        missing: outcome.missing,
        files_copied,
    })
}

fn copy_subject(manifest: &SubjectManifest, target: &Path) -> Result<usize, AppError> {
    let groups: [(&str, &[PathBuf]); 3] = [
        (MRI_DIR, &manifest.mri),
        (QC_DIR, &manifest.qc),
        (STATS_DIR, &manifest.stats),
    ];

    let mut copied = 0;
    for (group, files) in groups {
        let dir = target.join(group);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .map_err(|e| AppError::runtime(format!("Failed to clear '{}': {e}", dir.display())))?;
        }
        if files.is_empty() {
            continue;
        }
        fs::create_dir_all(&dir)
            .map_err(|e| AppError::runtime(format!("Failed to create '{}': {e}", dir.display())))?;
        for file in files {
            let Some(name) = file.file_name() else {
                continue;
            };
            let dest = dir.join(name);
            fs::copy(file, &dest).map_err(|e| {
                AppError::runtime(format!(
                    "Failed to copy '{}' to '{}': {e}",
                    file.display(),
                    dest.display()
                ))
            })?;
            debug!("copied '{}'", dest.display());
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Stage, SubjectOutcome};

    fn completed(root: &Path, id: &str, with_summary: bool) -> SubjectResult {
        let work = root.join("work").join(id);
        let stats = work.join("stats");
        let qc = work.join("QC");
        fs::create_dir_all(&stats).unwrap();
        fs::create_dir_all(&qc).unwrap();

        let mut manifest = SubjectManifest {
            localized: true,
            ..SubjectManifest::default()
        };
        let overlay = qc.join("ob_overlay.png");
        fs::write(&overlay, "png").unwrap();
        manifest.qc.push(overlay);
        if with_summary {
            let summary = stats.join("subject_summary.csv");
            fs::write(&summary, format!("subject,voxel_count\n{id},8\n")).unwrap();
            manifest.stats.push(summary);
        }
        SubjectResult {
            subject_id: id.to_string(),
            outcome: SubjectOutcome::Completed(manifest),
        }
    }

    #[test]
    fn collects_successes_and_reports_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let results = vec![
            completed(dir.path(), "a", true),
            SubjectResult {
                subject_id: "b".to_string(),
                outcome: SubjectOutcome::Failed {
                    stage: Stage::Segmentation,
                    error: AppError::runtime("boom"),
                },
            },
            completed(dir.path(), "c", false),
        ];

        let report = collect(&results, &out).unwrap();
        assert_eq!(report.rows, vec!["a"]);
        assert_eq!(report.missing, vec!["b", "c"]);
        assert_eq!(report.files_copied, 3);
        assert!(out.join("a/QC/ob_overlay.png").is_file());
        assert!(out.join("a/stats/subject_summary.csv").is_file());
        assert!(!out.join("b").exists());
        assert!(!out.join("c/stats").exists());

        let table = fs::read_to_string(&report.table).unwrap();
        assert_eq!(table, "subject,voxel_count\na,8\n");
    }

    #[test]
    fn recollecting_replaces_groups_and_drops_failed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        collect(&[completed(dir.path(), "a", true), completed(dir.path(), "b", true)], &out).unwrap();
        fs::write(out.join("a/QC/old_view.png"), "stale").unwrap();

        let mut missed = completed(dir.path(), "a", true);
        if let SubjectOutcome::Completed(m) = &mut missed.outcome {
            m.localized = false;
            m.qc.clear();
        }
        let failed = SubjectResult {
            subject_id: "b".to_string(),
            outcome: SubjectOutcome::Failed {
                stage: Stage::Localization,
                error: AppError::runtime("boom"),
            },
        };
        let report = collect(&[missed, failed], &out).unwrap();

        assert!(!out.join("a/QC").exists());
        assert!(out.join("a/stats/subject_summary.csv").is_file());
        assert!(out.join("b/stats/subject_summary.csv").is_file());
        assert_eq!(report.rows, vec!["a"]);
        assert_eq!(report.missing, vec!["b"]);
        let table = fs::read_to_string(&report.table).unwrap();
        assert_eq!(table, "subject,voxel_count\na,8\n");
    }

    #[test]
    fn recollecting_overwrites_previous_files() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let results = vec![completed(dir.path(), "a", true)];
        collect(&results, &out).unwrap();

        let summary = dir.path().join("work/a/stats/subject_summary.csv");
        fs::write(&summary, "subject,voxel_count\na,12\n").unwrap();
        let report = collect(&results, &out).unwrap();

        let table = fs::read_to_string(&report.table).unwrap();
        assert_eq!(table, "subject,voxel_count\na,12\n");
    }
}
