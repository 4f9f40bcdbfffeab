//! Shared domain types.
//!
//! Everything a subject task reads is immutable once the batch starts. The
//! resolved configuration is wrapped in an `Arc` and handed to every worker;
//! results flow back as owned values.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Canonical voxel orientation that every input is conformed to.
pub const CANONICAL_ORIENTATION: &str = "LAS";

/// Which part of the cross-validation ensemble to run.
///
/// On the command line folds are addressed by index: `1..=4` select a single
/// fold and `5` selects every fold. Anything else is kept as `Unrecognized`
/// so the resolver can fall back to all folds and say so.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FoldSelector {
    Fold(u8),
    All,
    Unrecognized(i64),
}

impl FoldSelector {
    pub const ALL_INDEX: i64 = 5;
    pub const FOLD_COUNT: u8 = 4;

    pub fn from_index(index: i64) -> Self {
        match index {
            Self::ALL_INDEX => Self::All,
            n if (1..=i64::from(Self::FOLD_COUNT)).contains(&n) => Self::Fold(n as u8),
            other => Self::Unrecognized(other),
        }
    }

    /// The marker a weight entry carries when it belongs to this fold.
    pub fn split_marker(&self) -> Option<String> {
        match self {
            Self::Fold(n) => Some(format!("split_{n}")),
            Self::All | Self::Unrecognized(_) => None,
        }
    }
}

impl fmt::Display for FoldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fold(n) => write!(f, "fold {n}"),
            Self::All => write!(f, "all folds"),
            Self::Unrecognized(n) => write!(f, "unrecognized selector {n}"),
        }
    }
}

/// Resolved mapping of logical weight names to existing weight files.
///
/// Ordered so iteration (and therefore fingerprints and toolkit arguments)
/// is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelWeightSet {
    entries: BTreeMap<String, PathBuf>,
}

impl ModelWeightSet {
    pub fn new(entries: BTreeMap<String, PathBuf>) -> Self {
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&Path> {
        self.entries.get(name).map(PathBuf::as_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_path()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where inference runs for the whole batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    Cpu,
    Gpu,
}

/// Concrete device a single inference call is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Gpu(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Gpu(id) => write!(f, "cuda:{id}"),
        }
    }
}

/// Parameters of one inference stage (localization or segmentation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub architecture: String,
    /// In-plane network input size.
    pub image_size: [usize; 2],
    pub spacing: [f32; 3],
    pub weights: ModelWeightSet,
}

/// Resolved runtime parameters for a batch. Built once, shared read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub orientation: String,
    pub spacing: [f32; 3],
    pub thickness: u32,
    /// Crop extent (voxels at `spacing`) cut around the localization center.
    pub crop_shape: [usize; 3],
    pub batch_size: usize,
    pub num_classes: usize,
    pub localization: StageConfig,
    pub segmentation: StageConfig,
    /// Segmentation network consumes whole volumes instead of slices.
    pub volumetric: bool,
    pub device: DeviceMode,
    pub save_logits: bool,
}

/// One discovered subject with an existing input volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub id: String,
    pub input: PathBuf,
}

/// A requested subject that never became a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedSubject {
    pub id: String,
    pub reason: String,
}

/// Localization outcome: structure center (voxel coordinates of the
/// conformed volume) and detector confidence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Localization {
    pub center: [f32; 3],
    pub confidence: f32,
}

/// Step of the per-subject sequence, used to label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Setup,
    Conform,
    Localization,
    Crop,
    Segmentation,
    Qc,
    Statistics,
    Finalize,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Conform => "conform",
            Self::Localization => "localization",
            Self::Crop => "crop",
            Self::Segmentation => "segmentation",
            Self::Qc => "qc",
            Self::Statistics => "statistics",
            Self::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Files a finished subject produced, grouped by output subdirectory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectManifest {
    pub mri: Vec<PathBuf>,
    pub qc: Vec<PathBuf>,
    pub stats: Vec<PathBuf>,
    pub localized: bool,
}

impl SubjectManifest {
    pub fn all_files(&self) -> impl Iterator<Item = &Path> {
        self.mri
            .iter()
            .chain(self.qc.iter())
            .chain(self.stats.iter())
            .map(PathBuf::as_path)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubjectOutcome {
    Completed(SubjectManifest),
    /// Reused from a previous run with an identical fingerprint.
    Cached(SubjectManifest),
    Failed { stage: Stage, error: AppError },
    /// Never started because the batch was interrupted.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubjectResult {
    pub subject_id: String,
    pub outcome: SubjectOutcome,
}

impl SubjectResult {
    pub fn manifest(&self) -> Option<&SubjectManifest> {
        match &self.outcome {
            SubjectOutcome::Completed(m) | SubjectOutcome::Cached(m) => Some(m),
            SubjectOutcome::Failed { .. } | SubjectOutcome::Cancelled => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, SubjectOutcome::Failed { .. })
    }
}

/// Worker pool bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParallelLimits {
    pub max_processes: usize,
    pub max_gpus: usize,
    pub max_processes_per_gpu: usize,
}

impl ParallelLimits {
    pub fn workers(&self) -> usize {
        self.max_processes.max(1)
    }

    /// Number of tasks that may hold a GPU at the same time.
    pub fn gpu_concurrency(&self) -> usize {
        self.workers()
            .min(self.max_gpus.max(1) * self.max_processes_per_gpu.max(1))
    }
}

/// One batch invocation: resolved config, discovered subjects and limits.
#[derive(Debug, Clone)]
pub struct BatchRun {
    pub name: String,
    pub subjects: Vec<Subject>,
    pub skipped: Vec<SkippedSubject>,
    pub config: Arc<PipelineConfig>,
    pub limits: ParallelLimits,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl BatchRun {
    /// Working directory for this run (`work_dir/<name>`).
    pub fn run_dir(&self) -> PathBuf {
        self.work_dir.join(&self.name)
    }
}

/// Batch options as collected from the CLI and environment.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub scans_dir: PathBuf,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
    pub subjects: Option<Vec<String>>,
    pub subject_list: Option<PathBuf>,
    pub input_pattern: String,
    pub batch_size: usize,
    pub fold: FoldSelector,
    pub no_cuda: bool,
    pub save_logits: bool,
    pub loc_arc: String,
    pub seg_arc: String,
    pub loc_dir: PathBuf,
    pub seg_dir: PathBuf,
    pub debug: bool,
    pub limits: ParallelLimits,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_selector_parses_index() {
        assert_eq!(FoldSelector::from_index(1), FoldSelector::Fold(1));
        assert_eq!(FoldSelector::from_index(4), FoldSelector::Fold(4));
        assert_eq!(FoldSelector::from_index(5), FoldSelector::All);
        assert_eq!(FoldSelector::from_index(0), FoldSelector::Unrecognized(0));
        assert_eq!(FoldSelector::from_index(9), FoldSelector::Unrecognized(9));
        assert_eq!(FoldSelector::Fold(3).split_marker().as_deref(), Some("split_3"));
        assert_eq!(FoldSelector::All.split_marker(), None);
    }

    #[test]
    fn gpu_concurrency_is_bounded_by_workers_and_slots() {
        let limits = ParallelLimits {
            max_processes: 4,
            max_gpus: 2,
            max_processes_per_gpu: 1,
        };
        assert_eq!(limits.workers(), 4);
        assert_eq!(limits.gpu_concurrency(), 2);

        let limits = ParallelLimits {
            max_processes: 2,
            max_gpus: 2,
            max_processes_per_gpu: 3,
        };
        assert_eq!(limits.gpu_concurrency(), 2);
    }
}
