//! Capabilities the pipeline core depends on.
//!
//! Image I/O, the localization and segmentation networks, and QC rendering
//! are opaque collaborators. The core only sees these traits; `toolkit`
//! provides the concrete variant that drives an external inference
//! executable.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::Array3;

use crate::domain::{Device, Localization, PipelineConfig, StageConfig};
use crate::error::AppError;
use crate::volume::Volume;

pub mod exchange;
pub mod toolkit;

pub use toolkit::{ExternalToolkit, ToolkitSettings};

/// Per-call context: where scratch files go and which device to use.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub work_dir: &'a Path,
    pub device: Device,
}

/// Voxel prediction for a crop.
#[derive(Debug, Clone, PartialEq)]
pub struct Segmentation {
    pub labels: Array3<u8>,
    /// Foreground probability per voxel, present when logits were requested.
    pub probabilities: Option<Array3<f32>>,
}

/// Segmentation call options taken from the pipeline configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentOptions {
    pub batch_size: usize,
    pub num_classes: usize,
    pub volumetric: bool,
    pub probabilities: bool,
}

impl SegmentOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            num_classes: config.num_classes,
            volumetric: config.volumetric,
            probabilities: config.save_logits,
        }
    }
}

/// Read a subject volume and conform it to the configured orientation/spacing.
pub trait VolumeIo: Send + Sync {
    fn load_conformed(
        &self,
        input: &Path,
        config: &PipelineConfig,
        ctx: StageContext<'_>,
    ) -> Result<Volume, AppError>;

    fn save_volume(&self, volume: &Volume, path: &Path, ctx: StageContext<'_>) -> Result<(), AppError>;
}

/// Coarse detector. `Ok(None)` means nothing was found, which is not an error.
pub trait Localizer: Send + Sync {
    fn localize(
        &self,
        volume: &Volume,
        stage: &StageConfig,
        ctx: StageContext<'_>,
    ) -> Result<Option<Localization>, AppError>;
}

pub trait Segmenter: Send + Sync {
    fn segment(
        &self,
        crop: &Volume,
        stage: &StageConfig,
        options: SegmentOptions,
        ctx: StageContext<'_>,
    ) -> Result<Segmentation, AppError>;
}

/// Renders QC images into `qc_dir` and returns the files written.
pub trait QcRenderer: Send + Sync {
    fn render(
        &self,
        image: &Volume,
        labels: &Array3<u8>,
        qc_dir: &Path,
        ctx: StageContext<'_>,
    ) -> Result<Vec<PathBuf>, AppError>;
}

/// The set of collaborators a batch runs with. Cheap to clone.
#[derive(Clone)]
pub struct Backend {
    pub io: Arc<dyn VolumeIo>,
    pub localizer: Arc<dyn Localizer>,
    pub segmenter: Arc<dyn Segmenter>,
    pub qc: Arc<dyn QcRenderer>,
}

impl Backend {
    /// Every stage served by the same external toolkit.
    pub fn toolkit(toolkit: ExternalToolkit) -> Self {
        let toolkit = Arc::new(toolkit);
        Self {
            io: toolkit.clone(),
            localizer: toolkit.clone(),
            segmenter: toolkit.clone(),
            qc: toolkit,
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}
