//! Command-line parsing for the olfactory bulb batch pipeline.
//!
//! Argument parsing stays separate from the pipeline code; `app` turns the
//! parsed values into a `BatchConfig`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

pub const DEFAULT_MODELS_DIR: &str = "models/rs_ob_models";
pub const LOC_MODELS_SUBDIR: &str = "LocModels";
pub const SEG_MODELS_SUBDIR: &str = "SegModels";

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "ob", version, about = "Olfactory bulb segmentation batch pipeline")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Segment every subject under the scans directory and collect the outputs.
    Run(RunArgs),
    /// Resolve and print the weight files a run would use, then exit.
    Resolve(ModelArgs),
}

/// Network and weight selection, shared by `run` and `resolve`.
#[derive(Debug, Args, Clone)]
pub struct ModelArgs {
    /// Fold of the ensemble to use (1-4), or 5 for all folds.
    #[arg(short = 'm', long, default_value_t = 5, allow_negative_numbers = true)]
    pub model: i64,

    /// Localization network architecture.
    #[arg(long = "loc-arc", default_value = "FastSurferCNN")]
    pub loc_arc: String,

    /// Segmentation network architecture.
    #[arg(long = "seg-arc", default_value = "AttFastSurferCNN")]
    pub seg_arc: String,

    /// Root of the model weights.
    #[arg(long = "models-dir", env = "OB_MODELS_DIR", default_value = DEFAULT_MODELS_DIR)]
    pub models_dir: PathBuf,

    /// Localization weights root [default: <models-dir>/LocModels].
    #[arg(long = "loc-dir")]
    pub loc_dir: Option<PathBuf>,

    /// Segmentation weights root [default: <models-dir>/SegModels].
    #[arg(long = "seg-dir")]
    pub seg_dir: Option<PathBuf>,
}

impl ModelArgs {
    pub fn loc_root(&self) -> PathBuf {
        self.loc_dir
            .clone()
            .unwrap_or_else(|| self.models_dir.join(LOC_MODELS_SUBDIR))
    }

    pub fn seg_root(&self) -> PathBuf {
        self.seg_dir
            .clone()
            .unwrap_or_else(|| self.models_dir.join(SEG_MODELS_SUBDIR))
    }
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    /// Directory with one subdirectory per subject.
    #[arg(short = 's', long = "scans-dir")]
    pub scans_dir: PathBuf,

    /// Working directory for intermediate files.
    #[arg(short = 'w', long = "work-dir")]
    pub work_dir: PathBuf,

    /// Output root for collected results.
    #[arg(short = 'o', long = "output-dir")]
    pub output_dir: PathBuf,

    /// Process only these subject ids.
    #[arg(long, num_args = 1.., conflicts_with = "subject_list")]
    pub subjects: Option<Vec<String>>,

    /// CSV with `subject_id[,pattern]` rows.
    #[arg(long = "subject-list", value_name = "CSV")]
    pub subject_list: Option<PathBuf>,

    /// Filename pattern of the input volume inside each subject directory.
    #[arg(long = "input-pattern", default_value = "T2*.nii.gz")]
    pub input_pattern: String,

    /// Inference batch size.
    #[arg(short = 'b', long = "batch-size", default_value_t = 16)]
    pub batch_size: usize,

    #[command(flatten)]
    pub models: ModelArgs,

    /// Run inference on the CPU.
    #[arg(long = "no-cuda")]
    pub no_cuda: bool,

    /// Also save the segmentation probability map.
    #[arg(long)]
    pub logits: bool,

    /// Write the job graph and log at debug level.
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Maximum number of subjects processed at once.
    #[arg(short = 'p', long, default_value_t = 1)]
    pub processes: usize,

    /// Number of GPUs available.
    #[arg(short = 'g', long, default_value_t = 1)]
    pub ngpus: usize,

    /// Maximum concurrent subjects per GPU.
    #[arg(long, default_value_t = 1)]
    pub ngpuproc: usize,

    /// Batch name; also the name of the run directory inside the work dir.
    #[arg(short = 'n', long, default_value = "ob_pipeline")]
    pub name: String,
}
