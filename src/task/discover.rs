//! Subject discovery.
//!
//! Subjects live in `<scans dir>/<subject id>/`. Each requested id is matched
//! against a filename pattern inside its own directory; ids without a readable
//! match are reported as skipped and never become tasks.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};

use glob::{MatchOptions, Pattern};
use tracing::{debug, warn};

use crate::domain::{SkippedSubject, Subject};
use crate::error::AppError;

/// A subject id and the input pattern to look for in its directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectRequest {
    pub id: String,
    pub pattern: String,
}

impl SubjectRequest {
    pub fn new(id: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pattern: pattern.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    pub subjects: Vec<Subject>,
    pub skipped: Vec<SkippedSubject>,
}

/// Every subdirectory of `scans_dir`, sorted by name.
pub fn list_subject_ids(scans_dir: &Path) -> Result<Vec<String>, AppError> {
    let entries = fs::read_dir(scans_dir).map_err(|e| {
        AppError::config(format!("Cannot read scans directory '{}': {e}", scans_dir.display()))
    })?;

    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| {
            AppError::config(format!("Cannot read scans directory '{}': {e}", scans_dir.display()))
        })?;
        let path = entry.path();
        if path.is_dir()
            && let Some(name) = path.file_name().and_then(|n| n.to_str())
        {
            ids.push(name.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}

/// Read a subject list CSV: `subject_id[,pattern]` per row, optional header.
/// Rows without a pattern use `default_pattern`.
pub fn read_subject_list(path: &Path, default_pattern: &str) -> Result<Vec<SubjectRequest>, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::config(format!("Failed to open subject list '{}': {e}", path.display())))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file);

    let mut requests = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(|e| {
            AppError::config(format!("Invalid subject list '{}': {e}", path.display()))
        })?;
        let Some(id) = record.get(0).filter(|s| !s.is_empty()) else {
            continue;
        };
        if row == 0 && matches!(id.to_ascii_lowercase().as_str(), "subject" | "subject_id" | "id") {
            continue;
        }
        let pattern = record
            .get(1)
            .filter(|s| !s.is_empty())
            .unwrap_or(default_pattern);
        requests.push(SubjectRequest::new(id, pattern));
    }

    if requests.is_empty() {
        return Err(AppError::config(format!(
            "Subject list '{}' names no subjects.",
            path.display()
        )));
    }
    Ok(requests)
}

/// Match each request to an input file. Order of `requests` is kept.
pub fn discover(scans_dir: &Path, requests: &[SubjectRequest]) -> Discovery {
    let mut discovery = Discovery::default();
    let mut seen = BTreeSet::new();

    for request in requests {
        if !is_plain_name(&request.id) {
            skip(&mut discovery, &request.id, "subject id must be a single directory name");
            continue;
        }
        if !seen.insert(request.id.clone()) {
            skip(&mut discovery, &request.id, "listed more than once");
            continue;
        }
        match find_input(&scans_dir.join(&request.id), &request.pattern) {
            Ok(Some(input)) => {
                debug!(subject = %request.id, input = %input.display(), "subject discovered");
                discovery.subjects.push(Subject {
                    id: request.id.clone(),
                    input,
                });
            }
            Ok(None) => skip(
                &mut discovery,
                &request.id,
                &format!("no file matching '{}'", request.pattern),
            ),
            Err(reason) => skip(&mut discovery, &request.id, &reason),
        }
    }
    discovery
}

/// True when `id` is exactly one normal path component: no separators,
/// no root, no `.` or `..`.
fn is_plain_name(id: &str) -> bool {
    let mut components = Path::new(id).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(name)), None) if name == id
    )
}

fn skip(discovery: &mut Discovery, id: &str, reason: &str) {
    warn!(subject = %id, "skipping subject: {reason}");
    discovery.skipped.push(SkippedSubject {
        id: id.to_string(),
        reason: reason.to_string(),
    });
}

/// First file (by name) directly in `dir` whose name matches `pattern`.
fn find_input(dir: &Path, pattern: &str) -> Result<Option<PathBuf>, String> {
    if !dir.is_dir() {
        return Err(format!("subject directory '{}' does not exist", dir.display()));
    }
    let pattern = Pattern::new(pattern).map_err(|e| format!("invalid input pattern '{pattern}': {e}"))?;
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };

    let entries = fs::read_dir(dir).map_err(|e| format!("cannot read '{}': {e}", dir.display()))?;
    let mut matches: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| pattern.matches_with(n, options))
        })
        .collect();
    matches.sort();
    Ok(matches.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::write_scan;

    #[test]
    fn subjects_without_input_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let scans = dir.path();
        write_scan(scans, "A", "ok");
        fs::create_dir_all(scans.join("B")).unwrap();
        fs::write(scans.join("B").join("notes.txt"), "none").unwrap();
        write_scan(scans, "C", "ok");

        let ids = list_subject_ids(scans).unwrap();
        assert_eq!(ids, vec!["A", "B", "C"]);

        let requests: Vec<_> = ids.iter().map(|id| SubjectRequest::new(id, "T2*.nii.gz")).collect();
        let found = discover(scans, &requests);

        let names: Vec<_> = found.subjects.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(names, vec!["A", "C"]);
        assert_eq!(found.skipped.len(), 1);
        assert_eq!(found.skipped[0].id, "B");
        assert!(found.subjects[0].input.ends_with("A/T2_A.nii.gz"));
    }

    #[test]
    fn unknown_and_duplicate_ids_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_scan(dir.path(), "A", "ok");
        let requests = vec![
            SubjectRequest::new("A", "T2*.nii.gz"),
            SubjectRequest::new("Z", "T2*.nii.gz"),
            SubjectRequest::new("A", "T2*.nii.gz"),
        ];
        let found = discover(dir.path(), &requests);
        assert_eq!(found.subjects.len(), 1);
        let skipped: Vec<_> = found.skipped.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(skipped, vec!["Z", "A"]);
    }

    #[test]
    fn ids_that_are_not_a_single_directory_name_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let scans = dir.path().join("scans");
        write_scan(&scans, "sub-01", "ok");
        write_scan(dir.path(), "x", "ok");
        let absolute = scans.join("sub-01").display().to_string();

        let requests: Vec<_> = [absolute.as_str(), "../x", "sub-01/", "a/b", ".", "sub-01"]
            .into_iter()
            .map(|id| SubjectRequest::new(id, "T2*.nii.gz"))
            .collect();
        let found = discover(&scans, &requests);

        let names: Vec<_> = found.subjects.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(names, vec!["sub-01"]);
        let skipped: Vec<_> = found.skipped.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(skipped, vec![absolute.as_str(), "../x", "sub-01/", "a/b", "."]);
        assert!(found.skipped.iter().all(|s| s.reason.contains("single directory name")));
    }

    #[test]
    fn subject_list_accepts_header_and_per_row_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("subjects.csv");
        fs::write(&list, "subject_id,pattern\nsub-01\nsub-02, t2w_*.nii\n\n").unwrap();

        let requests = read_subject_list(&list, "T2*.nii.gz").unwrap();
        assert_eq!(
            requests,
            vec![
                SubjectRequest::new("sub-01", "T2*.nii.gz"),
                SubjectRequest::new("sub-02", "t2w_*.nii"),
            ]
        );
    }

    #[test]
    fn empty_subject_list_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("subjects.csv");
        fs::write(&list, "subject\n").unwrap();
        let err = read_subject_list(&list, "T2*").unwrap_err();
        assert!(err.is_config());
    }
}
