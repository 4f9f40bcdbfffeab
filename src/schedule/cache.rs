//! Resume records for re-running a batch.
//!
//! After a subject completes, `manifest.json` in its work directory stores a
//! fingerprint of everything that determines its outputs together with the
//! produced file list. A later run with the same fingerprint whose files are
//! all still present reuses the manifest instead of recomputing.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::domain::{PipelineConfig, Subject, SubjectManifest};
use crate::error::AppError;

pub const RESUME_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub fingerprint: String,
    pub manifest: SubjectManifest,
}

pub fn resume_path(subject_dir: &Path) -> PathBuf {
    subject_dir.join(RESUME_FILE)
}

/// Hash of subject identity, input file identity and the pipeline config.
pub fn fingerprint(subject: &Subject, config: &PipelineConfig) -> Result<String, AppError> {
    let meta = fs::metadata(&subject.input).map_err(|e| {
        AppError::input(format!("Cannot stat input '{}': {e}", subject.input.display()))
    })?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let config_json = serde_json::to_vec(config)
        .map_err(|e| AppError::runtime(format!("Failed to encode config for fingerprint: {e}")))?;

    let mut hasher = Sha256::new();
    hasher.update(subject.id.as_bytes());
    hasher.update([0u8]);
    hasher.update(subject.input.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    hasher.update(meta.len().to_le_bytes());
    hasher.update(mtime.to_le_bytes());
    hasher.update(&config_json);
    Ok(format!("{:x}", hasher.finalize()))
}

/// The stored manifest, if it matches `fingerprint` and all its files exist.
pub fn load_cached(subject_dir: &Path, fingerprint: &str) -> Option<SubjectManifest> {
    let file = File::open(resume_path(subject_dir)).ok()?;
    let record: ResumeRecord = match serde_json::from_reader(file) {
        Ok(r) => r,
        Err(e) => {
            debug!("ignoring unreadable resume record in '{}': {e}", subject_dir.display());
            return None;
        }
    };
    if record.fingerprint != fingerprint {
        debug!("resume record in '{}' is stale", subject_dir.display());
        return None;
    }
    if let Some(missing) = record.manifest.all_files().find(|p| !p.is_file()) {
        debug!("resume record lists missing file '{}'", missing.display());
        return None;
    }
    Some(record.manifest)
}

pub fn store(subject_dir: &Path, fingerprint: &str, manifest: &SubjectManifest) -> Result<(), AppError> {
    let record = ResumeRecord {
        fingerprint: fingerprint.to_string(),
        manifest: manifest.clone(),
    };
    let path = resume_path(subject_dir);
    let file = File::create(&path)
        .map_err(|e| AppError::runtime(format!("Failed to create '{}': {e}", path.display())))?;
    serde_json::to_writer_pretty(file, &record)
        .map_err(|e| AppError::runtime(format!("Failed to write resume record: {e}")))
}

/// Forget the stored record (called before a subject is recomputed).
pub fn invalidate(subject_dir: &Path) {
    let _ = fs::remove_file(resume_path(subject_dir));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pipeline_config, write_scan};

    #[test]
    fn matching_record_is_reused_until_inputs_change() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_scan(dir.path(), "sub-01", "ok");
        let subject = Subject {
            id: "sub-01".to_string(),
            input,
        };
        let mut config = pipeline_config(dir.path());
        let subject_dir = dir.path().join("work");
        fs::create_dir_all(&subject_dir).unwrap();

        let output = subject_dir.join("ob_stats.csv");
        fs::write(&output, "subject\nsub-01\n").unwrap();
        let manifest = SubjectManifest {
            stats: vec![output.clone()],
            ..SubjectManifest::default()
        };

        let fp = fingerprint(&subject, &config).unwrap();
        store(&subject_dir, &fp, &manifest).unwrap();
        assert_eq!(load_cached(&subject_dir, &fp), Some(manifest));

        config.batch_size = 4;
        let changed = fingerprint(&subject, &config).unwrap();
        assert_ne!(fp, changed);
        assert_eq!(load_cached(&subject_dir, &changed), None);

        fs::remove_file(&output).unwrap();
        assert_eq!(load_cached(&subject_dir, &fp), None);
    }
}
