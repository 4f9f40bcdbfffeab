//! Shared batch pipeline logic used by the `run` and `resolve` commands.
//!
//! resolve weights -> build config -> discover subjects -> schedule -> collect -> report

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::domain::{
    BatchConfig, BatchRun, CANONICAL_ORIENTATION, DeviceMode, FoldSelector, ModelWeightSet, PipelineConfig,
    StageConfig, SubjectResult,
};
use crate::error::AppError;
use crate::io::{AggregateReport, GRAPH_FILE, collect, write_job_graph};
use crate::report::{BatchReport, SUMMARY_JSON, write_batch_summary_json};
use crate::schedule::Scheduler;
use crate::task::{SubjectRequest, discover, list_subject_ids, read_subject_list};
use crate::weights::{is_volumetric, resolve};

pub const TARGET_SPACING: [f32; 3] = [0.8, 0.8, 0.8];
pub const SLICE_THICKNESS: u32 = 1;
pub const CROP_SHAPE: [usize; 3] = [96, 96, 96];
pub const NUM_CLASSES: usize = 2;

const LOC_IMAGE_SIZE: [usize; 2] = [192, 192];
const LOC_SPACING: [f32; 3] = [1.6, 1.6, 1.6];
const SEG_IMAGE_SIZE: [usize; 2] = [96, 96];

/// Weight sets for both stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedWeights {
    pub localization: ModelWeightSet,
    pub segmentation: ModelWeightSet,
}

/// Localization always uses every fold; `fold` only narrows segmentation.
pub fn resolve_weights(
    loc_arc: &str,
    loc_root: &Path,
    seg_arc: &str,
    seg_root: &Path,
    fold: FoldSelector,
) -> Result<ResolvedWeights, AppError> {
    let localization = resolve(loc_arc, FoldSelector::All, loc_root)?;
    let segmentation = resolve(seg_arc, fold, seg_root)?;
    Ok(ResolvedWeights {
        localization,
        segmentation,
    })
}

/// Build the immutable per-batch configuration.
pub fn build_pipeline_config(config: &BatchConfig) -> Result<PipelineConfig, AppError> {
    let weights = resolve_weights(
        &config.loc_arc,
        &config.loc_dir,
        &config.seg_arc,
        &config.seg_dir,
        config.fold,
    )?;
    info!(
        loc = weights.localization.len(),
        seg = weights.segmentation.len(),
        fold = %config.fold,
        "weights resolved"
    );

    Ok(PipelineConfig {
        orientation: CANONICAL_ORIENTATION.to_string(),
        spacing: TARGET_SPACING,
        thickness: SLICE_THICKNESS,
        crop_shape: CROP_SHAPE,
        batch_size: config.batch_size.max(1),
        num_classes: NUM_CLASSES,
        localization: StageConfig {
            architecture: config.loc_arc.clone(),
            image_size: LOC_IMAGE_SIZE,
            spacing: LOC_SPACING,
            weights: weights.localization,
        },
        segmentation: StageConfig {
            architecture: config.seg_arc.clone(),
            image_size: SEG_IMAGE_SIZE,
            spacing: TARGET_SPACING,
            weights: weights.segmentation,
        },
        volumetric: is_volumetric(&config.seg_arc),
        device: if config.no_cuda { DeviceMode::Cpu } else { DeviceMode::Gpu },
        save_logits: config.save_logits,
    })
}

/// Resolve configuration and discover subjects. Every error here is fatal.
pub fn prepare_batch(config: &BatchConfig) -> Result<BatchRun, AppError> {
    if !config.scans_dir.is_dir() {
        return Err(AppError::config(format!(
            "Scans directory '{}' does not exist.",
            config.scans_dir.display()
        )));
    }

    let pipeline = build_pipeline_config(config)?;

    let requests: Vec<SubjectRequest> = if let Some(list) = &config.subject_list {
        read_subject_list(list, &config.input_pattern)?
    } else {
        let ids = match &config.subjects {
            Some(ids) => ids.clone(),
            None => list_subject_ids(&config.scans_dir)?,
        };
        ids.into_iter()
            .map(|id| SubjectRequest::new(id, config.input_pattern.clone()))
            .collect()
    };

    let found = discover(&config.scans_dir, &requests);
    if found.subjects.is_empty() {
        warn!("no subjects with an input volume were found");
    }
    info!(
        subjects = found.subjects.len(),
        skipped = found.skipped.len(),
        "discovery finished"
    );

    Ok(BatchRun {
        name: config.name.clone(),
        subjects: found.subjects,
        skipped: found.skipped,
        config: Arc::new(pipeline),
        limits: config.limits,
        work_dir: config.work_dir.clone(),
        output_dir: config.output_dir.clone(),
    })
}

/// All outputs of a finished batch.
#[derive(Debug, Clone)]
pub struct BatchOutput {
    pub results: Vec<SubjectResult>,
    pub aggregate: AggregateReport,
    pub report: BatchReport,
}

/// Schedule every subject, collect outputs and write the batch summary.
///
/// A cancelled batch still collects what finished and writes the table and
/// the summary.
pub fn execute_batch(
    batch: &BatchRun,
    fold: FoldSelector,
    scheduler: &Scheduler,
    debug: bool,
) -> Result<BatchOutput, AppError> {
    let started_at = Utc::now();

    if debug {
        let run_dir = batch.run_dir();
        std::fs::create_dir_all(&run_dir)
            .map_err(|e| AppError::runtime(format!("Failed to create '{}': {e}", run_dir.display())))?;
        let graph = run_dir.join(GRAPH_FILE);
        write_job_graph(batch, &graph)?;
        info!("job graph written to '{}'", graph.display());
    }

    let results = scheduler.run(batch)?;
    let aggregate = collect(&results, &batch.output_dir)?;

    let report = BatchReport::new(batch, fold, &results, &aggregate, started_at, Utc::now());
    write_batch_summary_json(&batch.output_dir.join(SUMMARY_JSON), &report)?;

    Ok(BatchOutput {
        results,
        aggregate,
        report,
    })
}
