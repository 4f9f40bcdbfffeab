//! The per-subject pipeline.
//!
//! Sequence inside `<run dir>/<subject>/`:
//!
//! 1. conform the input volume
//! 2. localize the olfactory bulbs (GPU slot held)
//! 3. found: crop, segment (GPU slot held), save volumes, QC, full stats;
//!    not found: no-localization stats record
//! 4. write the subject summary and list `mri/`, `QC/`, `stats/`
//!
//! Errors and panics stop the sequence and become a failed result tagged
//! with the stage that was running.

use std::any::Any;
use std::cell::Cell;
use std::fs::{self, File};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use tracing::{error, info, info_span, warn};

use crate::backend::{Backend, SegmentOptions, StageContext};
use crate::domain::{Device, PipelineConfig, Stage, Subject, SubjectManifest, SubjectOutcome, SubjectResult};
use crate::error::AppError;
use crate::schedule::GpuSlots;
use crate::volume::{StatsRecord, Volume, compute_stats, write_stats_csv};

pub const MRI_DIR: &str = "mri";
pub const QC_DIR: &str = "QC";
pub const STATS_DIR: &str = "stats";

pub const STATS_FILE: &str = "ob_stats.csv";
pub const SUMMARY_FILE: &str = "subject_summary.csv";

const CROP_FILE: &str = "t2_crop.nii.gz";
const PREDICTION_FILE: &str = "ob_prediction.nii.gz";
const PROBABILITIES_FILE: &str = "ob_probabilities.nii.gz";

/// Run one subject to completion. Never panics and never returns `Err`:
/// every failure is reported through the returned result.
pub fn run_subject(
    subject: &Subject,
    config: &PipelineConfig,
    backend: &Backend,
    gpu: Option<&GpuSlots>,
    subject_dir: &Path,
) -> SubjectResult {
    let span = info_span!("subject", id = %subject.id);
    let _enter = span.enter();

    let stage = Cell::new(Stage::Setup);
    let task = SubjectTask {
        subject,
        config,
        backend,
        gpu,
        dir: subject_dir,
        stage: &stage,
    };

    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| task.execute())) {
        Ok(Ok(manifest)) => {
            info!(localized = manifest.localized, files = manifest.all_files().count(), "subject completed");
            SubjectOutcome::Completed(manifest)
        }
        Ok(Err(err)) => {
            error!(stage = %stage.get(), "subject failed: {err}");
            SubjectOutcome::Failed {
                stage: stage.get(),
                error: err,
            }
        }
        Err(payload) => {
            let err = AppError::runtime(format!("panic: {}", panic_message(payload.as_ref())));
            error!(stage = %stage.get(), "subject crashed: {err}");
            SubjectOutcome::Failed {
                stage: stage.get(),
                error: err,
            }
        }
    };

    SubjectResult {
        subject_id: subject.id.clone(),
        outcome,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

struct SubjectTask<'a> {
    subject: &'a Subject,
    config: &'a PipelineConfig,
    backend: &'a Backend,
    gpu: Option<&'a GpuSlots>,
    dir: &'a Path,
    stage: &'a Cell<Stage>,
}

impl SubjectTask<'_> {
    fn enter(&self, stage: Stage) {
        self.stage.set(stage);
    }

    fn cpu(&self) -> StageContext<'_> {
        StageContext {
            work_dir: self.dir,
            device: Device::Cpu,
        }
    }

    /// Run `f` bound to a GPU slot when the batch runs on GPUs.
    fn on_device<T>(&self, f: impl FnOnce(StageContext<'_>) -> Result<T, AppError>) -> Result<T, AppError> {
        match self.gpu {
            Some(slots) => {
                let lease = slots.acquire();
                f(StageContext {
                    work_dir: self.dir,
                    device: Device::Gpu(lease.device()),
                })
            }
            None => f(self.cpu()),
        }
    }

    fn execute(&self) -> Result<SubjectManifest, AppError> {
        self.enter(Stage::Setup);
        let (mri_dir, qc_dir, stats_dir) = self.prepare_dirs()?;

        self.enter(Stage::Conform);
        if !self.subject.input.is_file() {
            return Err(AppError::input(format!(
                "Input volume '{}' not found.",
                self.subject.input.display()
            )));
        }
        info!(input = %self.subject.input.display(), "reading input");
        let volume = self
            .backend
            .io
            .load_conformed(&self.subject.input, self.config, self.cpu())?;

        self.enter(Stage::Localization);
        let localization = self.on_device(|ctx| {
            self.backend
                .localizer
                .localize(&volume, &self.config.localization, ctx)
        })?;

        let stats_path = stats_dir.join(STATS_FILE);
        let localized = match localization {
            Some(loc) => {
                info!(center = ?loc.center, confidence = loc.confidence, "structure localized");

                self.enter(Stage::Crop);
                let crop = volume.crop_around(loc.center, self.config.crop_shape)?;

                self.enter(Stage::Segmentation);
                let options = SegmentOptions::from_config(self.config);
                let segmentation = self.on_device(|ctx| {
                    self.backend
                        .segmenter
                        .segment(&crop.volume, &self.config.segmentation, options, ctx)
                })?;
                self.save_outputs(&crop.volume, &segmentation.labels, segmentation.probabilities.as_ref(), &mri_dir)?;

                self.enter(Stage::Qc);
                self.backend
                    .qc
                    .render(&crop.volume, &segmentation.labels, &qc_dir, self.cpu())?;

                self.enter(Stage::Statistics);
                let record = compute_stats(
                    &self.subject.id,
                    &crop.volume,
                    &segmentation.labels,
                    segmentation.probabilities.as_ref(),
                    &loc,
                )?;
                write_stats_csv(&stats_path, &record)?;
                true
            }
            None => {
                warn!("no olfactory bulb localized; writing no-localization statistics");
                self.enter(Stage::Statistics);
                write_stats_csv(&stats_path, &StatsRecord::not_localized(&self.subject.id))?;
                false
            }
        };

        self.enter(Stage::Finalize);
        write_summary(&stats_path, &stats_dir.join(SUMMARY_FILE), self.config)?;

        Ok(SubjectManifest {
            mri: list_files(&mri_dir)?,
            qc: list_files(&qc_dir)?,
            stats: list_files(&stats_dir)?,
            localized,
        })
    }

    /// Create fresh output directories; outputs of an earlier attempt are removed
    /// so the manifest only lists what this run produced.
    fn prepare_dirs(&self) -> Result<(PathBuf, PathBuf, PathBuf), AppError> {
        let dirs = [MRI_DIR, QC_DIR, STATS_DIR].map(|name| self.dir.join(name));
        for dir in &dirs {
            if dir.exists() {
                fs::remove_dir_all(dir)
                    .map_err(|e| AppError::runtime(format!("Failed to clear '{}': {e}", dir.display())))?;
            }
            fs::create_dir_all(dir)
                .map_err(|e| AppError::runtime(format!("Failed to create '{}': {e}", dir.display())))?;
        }
        let [mri, qc, stats] = dirs;
        Ok((mri, qc, stats))
    }

    fn save_outputs(
        &self,
        crop: &Volume,
        labels: &ndarray::Array3<u8>,
        probabilities: Option<&ndarray::Array3<f32>>,
        mri_dir: &Path,
    ) -> Result<(), AppError> {
        let io = &self.backend.io;
        io.save_volume(crop, &mri_dir.join(CROP_FILE), self.cpu())?;
        io.save_volume(
            &Volume::new(labels.mapv(f32::from), crop.spacing),
            &mri_dir.join(PREDICTION_FILE),
            self.cpu(),
        )?;
        if self.config.save_logits
            && let Some(probs) = probabilities
        {
            io.save_volume(
                &Volume::new(probs.clone(), crop.spacing),
                &mri_dir.join(PROBABILITIES_FILE),
                self.cpu(),
            )?;
        }
        Ok(())
    }
}

/// Merge the stage statistics with the run parameters into one summary row.
pub fn write_summary(stats_path: &Path, summary_path: &Path, config: &PipelineConfig) -> Result<(), AppError> {
    let file = File::open(stats_path)
        .map_err(|e| AppError::runtime(format!("Failed to open '{}': {e}", stats_path.display())))?;
    let mut reader = csv::Reader::from_reader(file);
    let headers = reader
        .headers()
        .map_err(|e| AppError::runtime(format!("Invalid stats header: {e}")))?
        .clone();
    let row = reader
        .records()
        .next()
        .ok_or_else(|| AppError::runtime(format!("Stats file '{}' has no rows.", stats_path.display())))?
        .map_err(|e| AppError::runtime(format!("Invalid stats row: {e}")))?;

    let mut out_headers = vec!["subject".to_string()];
    let mut out_row = vec![row.get(0).unwrap_or_default().to_string()];
    for (name, value) in [
        ("loc_architecture", config.localization.architecture.clone()),
        ("seg_architecture", config.segmentation.architecture.clone()),
        ("seg_models", config.segmentation.weights.len().to_string()),
    ] {
        out_headers.push(name.to_string());
        out_row.push(value);
    }
    for (name, value) in headers.iter().zip(row.iter()).skip(1) {
        out_headers.push(name.to_string());
        out_row.push(value.to_string());
    }

    let out = File::create(summary_path)
        .map_err(|e| AppError::runtime(format!("Failed to create '{}': {e}", summary_path.display())))?;
    let mut writer = csv::Writer::from_writer(out);
    writer
        .write_record(&out_headers)
        .and_then(|_| writer.write_record(&out_row))
        .map_err(|e| AppError::runtime(format!("Failed to write summary: {e}")))?;
    writer
        .flush()
        .map_err(|e| AppError::runtime(format!("Failed to flush summary: {e}")))
}

/// Regular files directly under `dir`, sorted, as absolute paths.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>, AppError> {
    let entries = fs::read_dir(dir)
        .map_err(|e| AppError::runtime(format!("Failed to list '{}': {e}", dir.display())))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| AppError::runtime(format!("Failed to list '{}': {e}", dir.display())))?;
        let path = entry.path();
        if path.is_file() {
            let path = std::path::absolute(&path)
                .map_err(|e| AppError::runtime(format!("Failed to resolve '{}': {e}", path.display())))?;
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
