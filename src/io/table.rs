//! The batch statistics table: one row per subject summary, in dispatch order.

use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::AppError;

pub const TABLE_FILE: &str = "ob_stats_table.csv";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableOutcome {
    pub rows: Vec<String>,
    pub missing: Vec<String>,
}

/// One table input: a subject and the summary it produced this run, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub subject_id: String,
    pub summary: Option<PathBuf>,
}

/// Concatenate the summary of every entry, in order.
///
/// Entries without a summary are reported as missing. The header comes from
/// the first summary found. Rows whose header differs are kept positionally
/// with a warning. The output contains nothing but the input rows, so
/// identical inputs produce identical bytes.
pub fn write_stats_table(entries: &[TableEntry], table: &Path) -> Result<TableOutcome, AppError> {
    let mut outcome = TableOutcome::default();
    let mut header: Option<csv::StringRecord> = None;
    let mut rows: Vec<csv::StringRecord> = Vec::new();

    for entry in entries {
        let id = &entry.subject_id;
        let Some(path) = &entry.summary else {
            warn!(subject = %id, "no summary this run; subject left out of the table");
            outcome.missing.push(id.clone());
            continue;
        };
        let file = match File::open(path) {
            Ok(f) => f,
            Err(_) => {
                warn!(subject = %id, "no summary at '{}'; subject left out of the table", path.display());
                outcome.missing.push(id.clone());
                continue;
            }
        };

        let mut reader = csv::Reader::from_reader(file);
        let this_header = reader
            .headers()
            .map_err(|e| AppError::runtime(format!("Invalid summary '{}': {e}", path.display())))?
            .clone();
        match &header {
            None => header = Some(this_header),
            Some(h) if *h != this_header => {
                warn!(subject = %id, "summary columns differ from the first subject's")
            }
            Some(_) => {}
        }

        let mut found = false;
        for record in reader.records() {
            let record =
                record.map_err(|e| AppError::runtime(format!("Invalid summary '{}': {e}", path.display())))?;
            rows.push(record);
            found = true;
        }
        if found {
            outcome.rows.push(id.clone());
        } else {
            warn!(subject = %id, "summary '{}' has no rows", path.display());
            outcome.missing.push(id.clone());
        }
    }

    let file = File::create(table)
        .map_err(|e| AppError::runtime(format!("Failed to create '{}': {e}", table.display())))?;
    let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(file);
    let write_err = |e: csv::Error| AppError::runtime(format!("Failed to write '{}': {e}", table.display()));
    if let Some(h) = &header {
        writer.write_record(h).map_err(write_err)?;
    }
    for row in &rows {
        writer.write_record(row).map_err(write_err)?;
    }
    writer
        .flush()
        .map_err(|e| AppError::runtime(format!("Failed to flush '{}': {e}", table.display())))?;

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn summary(root: &Path, id: &str, body: &str) -> TableEntry {
        let path = root.join(format!("{id}.csv"));
        fs::write(&path, body).unwrap();
        TableEntry {
            subject_id: id.to_string(),
            summary: Some(path),
        }
    }

    fn absent(id: &str) -> TableEntry {
        TableEntry {
            subject_id: id.to_string(),
            summary: None,
        }
    }

    #[test]
    fn table_is_byte_identical_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let entries = vec![
            summary(root, "b", "subject,localized,voxel_count\nb,true,8\n"),
            summary(root, "a", "subject,localized,voxel_count\na,false,\n"),
            absent("z"),
        ];
        let table = root.join(TABLE_FILE);

        let first = write_stats_table(&entries, &table).unwrap();
        let bytes = fs::read(&table).unwrap();
        let second = write_stats_table(&entries, &table).unwrap();

        assert_eq!(first, second);
        assert_eq!(fs::read(&table).unwrap(), bytes);
        assert_eq!(first.rows, vec!["b", "a"]);
        assert_eq!(first.missing, vec!["z"]);
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "subject,localized,voxel_count\nb,true,8\na,false,\n"
        );
    }

    #[test]
    fn unreadable_or_empty_summaries_are_missing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let entries = vec![
            TableEntry {
                subject_id: "gone".to_string(),
                summary: Some(root.join("gone.csv")),
            },
            summary(root, "empty", "subject,voxel_count\n"),
        ];
        let table = root.join(TABLE_FILE);
        let outcome = write_stats_table(&entries, &table).unwrap();
        assert!(outcome.rows.is_empty());
        assert_eq!(outcome.missing, vec!["gone", "empty"]);
        assert_eq!(fs::read_to_string(&table).unwrap(), "subject,voxel_count\n");
    }

    #[test]
    fn no_summaries_give_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join(TABLE_FILE);
        let outcome = write_stats_table(&[absent("a")], &table).unwrap();
        assert!(outcome.rows.is_empty());
        assert_eq!(fs::read_to_string(&table).unwrap(), "");
    }
}
