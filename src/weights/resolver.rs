//! Resolve a declarative weights manifest into existing weight files.
//!
//! Layout under a weights root:
//!
//! ```text
//! <root>/<architecture>/<architecture>_weights.yml   name -> filename pattern
//! <root>/**/<pattern>                                  the weight files
//! ```
//!
//! Patterns are located with a recursive first-match search. Glob walks
//! directories in sorted order, so "first" is stable across runs.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use tracing::{debug, warn};

use crate::domain::{FoldSelector, ModelWeightSet};
use crate::error::AppError;

/// Marker that flags an architecture as volumetric (3D) rather than slice-wise.
const VOLUMETRIC_MARKER: &str = "3D";

/// Location of the weights manifest for an architecture.
pub fn manifest_path(weights_root: &Path, architecture: &str) -> PathBuf {
    weights_root
        .join(architecture)
        .join(format!("{architecture}_weights.yml"))
}

/// Read a weights manifest (logical name -> filename pattern).
pub fn read_manifest(path: &Path) -> Result<BTreeMap<String, String>, AppError> {
    let file = File::open(path).map_err(|e| {
        AppError::config(format!("Failed to open weights manifest '{}': {e}", path.display()))
    })?;
    serde_yaml::from_reader(file).map_err(|e| {
        AppError::config(format!("Invalid weights manifest '{}': {e}", path.display()))
    })
}

/// Keep the manifest entries that belong to the selected fold.
///
/// An entry belongs to fold `n` when its filename pattern contains
/// `split_<n>`. The logical name is not consulted, so every entry lands in
/// at most one fold. `All` keeps everything; an unrecognized selector also
/// keeps everything, with a warning.
pub fn select_entries(manifest: BTreeMap<String, String>, fold: FoldSelector) -> BTreeMap<String, String> {
    if let FoldSelector::Unrecognized(index) = fold {
        warn!(
            index,
            "model selector {index} is not available (expected 1-{} or {}); using all folds",
            FoldSelector::FOLD_COUNT,
            FoldSelector::ALL_INDEX
        );
    }

    let Some(marker) = fold.split_marker() else {
        return manifest;
    };

    manifest
        .into_iter()
        .filter(|(_, pattern)| pattern.contains(&marker))
        .collect()
}

/// Find the first regular file under `root` (recursively) whose name matches `pattern`.
pub fn locate_file(pattern: &str, root: &Path) -> Result<Option<PathBuf>, AppError> {
    let full = format!(
        "{}/**/{}",
        Pattern::escape(&root.to_string_lossy()),
        pattern
    );
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    let entries = glob::glob_with(&full, options)
        .map_err(|e| AppError::config(format!("Invalid weight file pattern '{pattern}': {e}")))?;

    for entry in entries {
        match entry {
            Ok(path) if path.is_file() => return Ok(Some(path)),
            Ok(_) => {}
            Err(e) => debug!("skipping unreadable path while locating '{pattern}': {e}"),
        }
    }
    Ok(None)
}

/// Resolve the weight set of `architecture` for the given fold selector.
///
/// Fails with a configuration error when the manifest is missing, when the
/// selection is empty, or when any selected weight can't be located.
pub fn resolve(
    architecture: &str,
    fold: FoldSelector,
    weights_root: &Path,
) -> Result<ModelWeightSet, AppError> {
    let manifest_file = manifest_path(weights_root, architecture);
    debug!(manifest = %manifest_file.display(), %fold, "resolving weights");

    let manifest = read_manifest(&manifest_file)?;
    let selected = select_entries(manifest, fold);
    if selected.is_empty() {
        return Err(AppError::config(format!(
            "No weights for {architecture} match {fold} in '{}'.",
            manifest_file.display()
        )));
    }

    let mut resolved = BTreeMap::new();
    for (name, pattern) in selected {
        let path = locate_file(&pattern, weights_root)?.ok_or_else(|| {
            AppError::config(format!(
                "Weights file for model '{name}' not found under '{}': {pattern}",
                weights_root.display()
            ))
        })?;
        let path = fs::canonicalize(&path).map_err(|e| {
            AppError::config(format!("Failed to resolve weights path '{}': {e}", path.display()))
        })?;
        resolved.insert(name, path);
    }

    Ok(ModelWeightSet::new(resolved))
}

/// Whether a segmentation architecture processes whole volumes.
pub fn is_volumetric(architecture: &str) -> bool {
    architecture.contains(VOLUMETRIC_MARKER)
}
