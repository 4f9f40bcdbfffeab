//! Shape and intensity statistics of a segmented structure.
//!
//! One `StatsRecord` is written per subject. Subjects without a localization
//! still get a record (`localized = false`, descriptors empty) so the batch
//! table has one row per subject.

use std::fs::File;
use std::path::Path;

use ndarray::{Array3, Zip};
use serde::{Deserialize, Serialize};

use crate::domain::Localization;
use crate::error::AppError;
use crate::volume::Volume;

/// Per-subject statistics row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsRecord {
    pub subject: String,
    pub localized: bool,
    pub loc_confidence: Option<f32>,
    pub loc_x: Option<f32>,
    pub loc_y: Option<f32>,
    pub loc_z: Option<f32>,
    pub voxel_count: Option<u64>,
    pub volume_mm3: Option<f64>,
    pub mean_intensity: Option<f64>,
    pub std_intensity: Option<f64>,
    pub centroid_x_mm: Option<f64>,
    pub centroid_y_mm: Option<f64>,
    pub centroid_z_mm: Option<f64>,
    pub extent_x_mm: Option<f64>,
    pub extent_y_mm: Option<f64>,
    pub extent_z_mm: Option<f64>,
    pub mean_probability: Option<f64>,
}

impl StatsRecord {
    /// Record for a subject whose localization found nothing.
    pub fn not_localized(subject: &str) -> Self {
        Self {
            subject: subject.to_string(),
            localized: false,
            loc_confidence: None,
            loc_x: None,
            loc_y: None,
            loc_z: None,
            voxel_count: None,
            volume_mm3: None,
            mean_intensity: None,
            std_intensity: None,
            centroid_x_mm: None,
            centroid_y_mm: None,
            centroid_z_mm: None,
            extent_x_mm: None,
            extent_y_mm: None,
            extent_z_mm: None,
            mean_probability: None,
        }
    }
}

/// Compute the full statistics set for a localized subject.
///
/// `labels` is the voxel prediction over `crop` (non-zero = structure);
/// `probabilities` is the optional foreground probability map.
pub fn compute_stats(
    subject: &str,
    crop: &Volume,
    labels: &Array3<u8>,
    probabilities: Option<&Array3<f32>>,
    localization: &Localization,
) -> Result<StatsRecord, AppError> {
    if labels.dim() != crop.data.dim() {
        return Err(AppError::runtime(format!(
            "Prediction shape {:?} does not match crop shape {:?}.",
            labels.dim(),
            crop.data.dim()
        )));
    }
    if let Some(p) = probabilities
        && p.dim() != crop.data.dim()
    {
        return Err(AppError::runtime(format!(
            "Probability map shape {:?} does not match crop shape {:?}.",
            p.dim(),
            crop.data.dim()
        )));
    }

    let mut count = 0u64;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut centroid = [0.0f64; 3];
    let mut lo = [usize::MAX; 3];
    let mut hi = [0usize; 3];

    for ((idx, &label), &value) in labels.indexed_iter().zip(crop.data.iter()) {
        if label == 0 {
            continue;
        }
        let v = f64::from(value);
        count += 1;
        sum += v;
        sum_sq += v * v;
        let ijk = [idx.0, idx.1, idx.2];
        for axis in 0..3 {
            centroid[axis] += ijk[axis] as f64;
            lo[axis] = lo[axis].min(ijk[axis]);
            hi[axis] = hi[axis].max(ijk[axis]);
        }
    }

    let mut record = StatsRecord {
        localized: true,
        loc_confidence: Some(localization.confidence),
        loc_x: Some(localization.center[0]),
        loc_y: Some(localization.center[1]),
        loc_z: Some(localization.center[2]),
        voxel_count: Some(count),
        volume_mm3: Some(count as f64 * crop.voxel_volume()),
        ..StatsRecord::not_localized(subject)
    };

    if count == 0 {
        return Ok(record);
    }

    let n = count as f64;
    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0);
    let spacing = crop.spacing.map(f64::from);

    record.mean_intensity = Some(mean);
    record.std_intensity = Some(variance.sqrt());
    record.centroid_x_mm = Some(centroid[0] / n * spacing[0]);
    record.centroid_y_mm = Some(centroid[1] / n * spacing[1]);
    record.centroid_z_mm = Some(centroid[2] / n * spacing[2]);
    record.extent_x_mm = Some((hi[0] - lo[0] + 1) as f64 * spacing[0]);
    record.extent_y_mm = Some((hi[1] - lo[1] + 1) as f64 * spacing[1]);
    record.extent_z_mm = Some((hi[2] - lo[2] + 1) as f64 * spacing[2]);

    if let Some(probs) = probabilities {
        let mut total = 0.0f64;
        Zip::from(labels).and(probs).for_each(|&label, &p| {
            if label != 0 {
                total += f64::from(p);
            }
        });
        record.mean_probability = Some(total / n);
    }

    Ok(record)
}

/// Write a single-record CSV (header + one row).
pub fn write_stats_csv(path: &Path, record: &StatsRecord) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::runtime(format!("Failed to create stats file '{}': {e}", path.display())))?;
    let mut writer = csv::Writer::from_writer(file);
    writer
        .serialize(record)
        .map_err(|e| AppError::runtime(format!("Failed to write stats row: {e}")))?;
    writer
        .flush()
        .map_err(|e| AppError::runtime(format!("Failed to flush stats file: {e}")))?;
    Ok(())
}

/// Read back a record written by `write_stats_csv`.
pub fn read_stats_csv(path: &Path) -> Result<StatsRecord, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::runtime(format!("Failed to open stats file '{}': {e}", path.display())))?;
    let mut reader = csv::Reader::from_reader(file);
    reader
        .deserialize()
        .next()
        .ok_or_else(|| AppError::runtime(format!("Stats file '{}' has no rows.", path.display())))?
        .map_err(|e| AppError::runtime(format!("Invalid stats file '{}': {e}", path.display())))
}
