//! External inference toolkit adapter.
//!
//! Every stage is one invocation of the toolkit executable:
//!
//! ```text
//! <toolkit> conform  --input <nii> --output <nii> --exchange <stem> --orientation LAS --spacing x,y,z --thickness t
//! <toolkit> localize --input <stem> --architecture A --image-size h,w --spacing x,y,z --weights name=path... --output <json>
//! <toolkit> segment  --input <stem> --architecture A --image-size h,w --spacing x,y,z --weights name=path...
//!                    --batch-size n --num-classes k [--volumetric] --output <stem> [--probabilities <stem>]
//! <toolkit> export   --input <stem> --output <nii>
//! <toolkit> qc       --image <stem> --labels <stem> --output-dir <dir>
//! ```
//!
//! GPU calls see only their leased device through `CUDA_VISIBLE_DEVICES`.
//! Output of each call goes to `<work_dir>/logs/<stage>.log`. On Unix each
//! call runs in its own process group, so a terminal interrupt reaches the
//! batch but not the running stages.

use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use ndarray::Array3;
use serde::Deserialize;
use tracing::debug;

use crate::backend::exchange::{read_exchange, read_labels, write_exchange};
use crate::backend::{Localizer, QcRenderer, SegmentOptions, Segmentation, Segmenter, StageContext, VolumeIo};
use crate::domain::{Device, Localization, PipelineConfig, StageConfig};
use crate::error::AppError;
use crate::volume::Volume;

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const LOG_TAIL_LINES: usize = 20;

pub const ENV_TOOLKIT: &str = "OB_TOOLKIT";
pub const ENV_TOOLKIT_TIMEOUT: &str = "OB_TOOLKIT_TIMEOUT_SECS";

/// How to reach the toolkit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolkitSettings {
    pub program: PathBuf,
    /// Upper bound for a single toolkit call. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl ToolkitSettings {
    /// Read settings from the environment (and `.env`).
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        let program = std::env::var_os(ENV_TOOLKIT)
            .map(PathBuf::from)
            .ok_or_else(|| AppError::config(format!("Missing {ENV_TOOLKIT} in environment (.env).")))?;

        let timeout = match std::env::var(ENV_TOOLKIT_TIMEOUT) {
            Ok(raw) => Some(parse_timeout(&raw)?),
            Err(_) => None,
        };

        Ok(Self { program, timeout })
    }
}

fn parse_timeout(raw: &str) -> Result<Duration, AppError> {
    let secs: u64 = raw
        .trim()
        .parse()
        .map_err(|_| AppError::config(format!("Invalid {ENV_TOOLKIT_TIMEOUT} value '{raw}'.")))?;
    if secs == 0 {
        return Err(AppError::config(format!("{ENV_TOOLKIT_TIMEOUT} must be positive.")));
    }
    Ok(Duration::from_secs(secs))
}

#[derive(Debug, Deserialize)]
struct LocalizationReply {
    center: Option<[f32; 3]>,
    #[serde(default)]
    confidence: f32,
}

#[derive(Debug, Clone)]
pub struct ExternalToolkit {
    settings: ToolkitSettings,
}

impl ExternalToolkit {
    pub fn new(settings: ToolkitSettings) -> Self {
        Self { settings }
    }

    /// Run one toolkit stage and wait for it (bounded by the configured timeout).
    fn invoke(&self, stage: &str, args: Vec<OsString>, ctx: StageContext<'_>) -> Result<(), AppError> {
        let log_dir = ctx.work_dir.join("logs");
        fs::create_dir_all(&log_dir)
            .map_err(|e| AppError::runtime(format!("Failed to create log dir '{}': {e}", log_dir.display())))?;
        let log_path = log_dir.join(format!("{stage}.log"));
        let log = File::create(&log_path)
            .map_err(|e| AppError::runtime(format!("Failed to create log '{}': {e}", log_path.display())))?;
        let log_err = log
            .try_clone()
            .map_err(|e| AppError::runtime(format!("Failed to share log handle: {e}")))?;

        let mut cmd = Command::new(&self.settings.program);
        cmd.arg(stage)
            .args(&args)
            .arg("--device")
            .arg(device_arg(ctx.device))
            .current_dir(ctx.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .env("CUDA_DEVICE_ORDER", "PCI_BUS_ID");
        match ctx.device {
            Device::Gpu(id) => cmd.env("CUDA_VISIBLE_DEVICES", id.to_string()),
            Device::Cpu => cmd.env("CUDA_VISIBLE_DEVICES", ""),
        };
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        debug!(stage, program = %self.settings.program.display(), device = %ctx.device, "toolkit call");

        let mut child = cmd.spawn().map_err(|e| {
            AppError::runtime(format!(
                "Failed to start toolkit '{}': {e}",
                self.settings.program.display()
            ))
        })?;

        let status = match self.settings.timeout {
            Some(limit) => wait_with_timeout(&mut child, limit).map_err(|e| {
                AppError::runtime(format!("Toolkit stage '{stage}' {e}"))
            })?,
            None => child
                .wait()
                .map_err(|e| AppError::runtime(format!("Failed to wait for toolkit stage '{stage}': {e}")))?,
        };

        if !status.success() {
            return Err(AppError::runtime(format!(
                "Toolkit stage '{stage}' exited with {status}: {}",
                log_tail(&log_path)
            )));
        }
        Ok(())
    }

    fn scratch(ctx: StageContext<'_>, name: &str) -> Result<PathBuf, AppError> {
        let dir = ctx.work_dir.join("scratch");
        fs::create_dir_all(&dir)
            .map_err(|e| AppError::runtime(format!("Failed to create scratch dir '{}': {e}", dir.display())))?;
        Ok(dir.join(name))
    }
}

fn wait_with_timeout(child: &mut Child, limit: Duration) -> Result<ExitStatus, String> {
    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {}
            Err(e) => return Err(format!("could not be polled: {e}")),
        }
        if started.elapsed() >= limit {
            let _ = child.kill();
            let _ = child.wait();
            return Err(format!("timed out after {}s", limit.as_secs()));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn log_tail(path: &Path) -> String {
    let Ok(text) = fs::read_to_string(path) else {
        return "(no log output)".to_string();
    };
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(LOG_TAIL_LINES);
    let tail = lines[start..].join("\n");
    if tail.trim().is_empty() {
        "(no log output)".to_string()
    } else {
        tail
    }
}

fn device_arg(device: Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Gpu(_) => "cuda",
    }
}

fn join_list<T: ToString>(values: &[T]) -> OsString {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
        .into()
}

fn stage_args(input: &Path, stage: &StageConfig) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--input".into(),
        input.into(),
        "--architecture".into(),
        stage.architecture.clone().into(),
        "--image-size".into(),
        join_list(&stage.image_size),
        "--spacing".into(),
        join_list(&stage.spacing),
    ];
    for (name, path) in stage.weights.iter() {
        args.push("--weights".into());
        let mut pair = OsString::from(format!("{name}="));
        pair.push(path);
        args.push(pair);
    }
    args
}

impl VolumeIo for ExternalToolkit {
    fn load_conformed(
        &self,
        input: &Path,
        config: &PipelineConfig,
        ctx: StageContext<'_>,
    ) -> Result<Volume, AppError> {
        if !input.is_file() {
            return Err(AppError::input(format!("Input volume '{}' not found.", input.display())));
        }
        let mri_dir = ctx.work_dir.join("mri");
        fs::create_dir_all(&mri_dir)
            .map_err(|e| AppError::runtime(format!("Failed to create '{}': {e}", mri_dir.display())))?;
        let exchange = Self::scratch(ctx, "conformed")?;

        let args: Vec<OsString> = vec![
            "--input".into(),
            input.into(),
            "--output".into(),
            mri_dir.join("t2_conformed.nii.gz").into(),
            "--exchange".into(),
            exchange.clone().into(),
            "--orientation".into(),
            config.orientation.clone().into(),
            "--spacing".into(),
            join_list(&config.spacing),
            "--thickness".into(),
            config.thickness.to_string().into(),
        ];
        self.invoke("conform", args, ctx)
            .map_err(|e| AppError::input(format!("Cannot read '{}': {e}", input.display())))?;
        read_exchange(&exchange)
    }

    fn save_volume(&self, volume: &Volume, path: &Path, ctx: StageContext<'_>) -> Result<(), AppError> {
        let stem_name = path
            .file_name()
            .map(|n| n.to_string_lossy().replace('.', "_"))
            .unwrap_or_else(|| "volume".to_string());
        let stem = Self::scratch(ctx, &format!("export_{stem_name}"))?;
        write_exchange(volume, &stem)?;
        let args: Vec<OsString> = vec!["--input".into(), stem.into(), "--output".into(), path.into()];
        self.invoke("export", args, StageContext { device: Device::Cpu, ..ctx })
    }
}

impl Localizer for ExternalToolkit {
    fn localize(
        &self,
        volume: &Volume,
        stage: &StageConfig,
        ctx: StageContext<'_>,
    ) -> Result<Option<Localization>, AppError> {
        let input = Self::scratch(ctx, "localization_input")?;
        let reply_path = Self::scratch(ctx, "localization.json")?;
        write_exchange(volume, &input)?;

        let mut args = stage_args(&input, stage);
        args.push("--output".into());
        args.push(reply_path.clone().into());
        self.invoke("localize", args, ctx)?;

        let file = File::open(&reply_path)
            .map_err(|e| AppError::runtime(format!("Localization produced no result: {e}")))?;
        let reply: LocalizationReply = serde_json::from_reader(file)
            .map_err(|e| AppError::runtime(format!("Invalid localization result: {e}")))?;

        Ok(reply.center.map(|center| Localization {
            center,
            confidence: reply.confidence,
        }))
    }
}

impl Segmenter for ExternalToolkit {
    fn segment(
        &self,
        crop: &Volume,
        stage: &StageConfig,
        options: SegmentOptions,
        ctx: StageContext<'_>,
    ) -> Result<Segmentation, AppError> {
        let input = Self::scratch(ctx, "segmentation_input")?;
        let prediction = Self::scratch(ctx, "prediction")?;
        let probabilities = Self::scratch(ctx, "probabilities")?;
        write_exchange(crop, &input)?;

        let mut args = stage_args(&input, stage);
        let extra: [OsString; 6] = [
            "--batch-size".into(),
            options.batch_size.to_string().into(),
            "--num-classes".into(),
            options.num_classes.to_string().into(),
            "--output".into(),
            prediction.clone().into(),
        ];
        args.extend(extra);
        if options.volumetric {
            args.push("--volumetric".into());
        }
        if options.probabilities {
            args.push("--probabilities".into());
            args.push(probabilities.clone().into());
        }
        self.invoke("segment", args, ctx)?;

        let labels = read_labels(&prediction)?;
        let probabilities = if options.probabilities {
            Some(read_exchange(&probabilities)?.data)
        } else {
            None
        };
        Ok(Segmentation { labels, probabilities })
    }
}

impl QcRenderer for ExternalToolkit {
    fn render(
        &self,
        image: &Volume,
        labels: &Array3<u8>,
        qc_dir: &Path,
        ctx: StageContext<'_>,
    ) -> Result<Vec<PathBuf>, AppError> {
        let image_stem = Self::scratch(ctx, "qc_image")?;
        let labels_stem = Self::scratch(ctx, "qc_labels")?;
        write_exchange(image, &image_stem)?;
        write_exchange(&Volume::new(labels.mapv(f32::from), image.spacing), &labels_stem)?;

        let args: Vec<OsString> = vec![
            "--image".into(),
            image_stem.into(),
            "--labels".into(),
            labels_stem.into(),
            "--output-dir".into(),
            qc_dir.into(),
        ];
        self.invoke("qc", args, StageContext { device: Device::Cpu, ..ctx })?;

        let mut files: Vec<PathBuf> = fs::read_dir(qc_dir)
            .map_err(|e| AppError::runtime(format!("Failed to list QC dir '{}': {e}", qc_dir.display())))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        Ok(files)
    }
}
