//! Test doubles shared by unit tests.
//!
//! `FakeBackend` decides what to do from the content of the input file:
//!
//! - `ok`: localizes and segments a small block
//! - `miss`: localization finds nothing
//! - `fail`: segmentation returns an error
//! - `panic`: localization panics

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use ndarray::Array3;

use crate::backend::{
    Backend, Localizer, QcRenderer, SegmentOptions, Segmentation, Segmenter, StageContext, VolumeIo,
};
use crate::domain::{
    CANONICAL_ORIENTATION, Device, DeviceMode, Localization, ModelWeightSet, PipelineConfig, StageConfig,
};
use crate::error::AppError;
use crate::volume::Volume;

const OK: f32 = 1.0;
const MISS: f32 = 2.0;
const FAIL: f32 = 3.0;
const PANIC: f32 = 4.0;

pub fn pipeline_config(root: &Path) -> PipelineConfig {
    let weights = |name: &str| {
        let mut entries = BTreeMap::new();
        entries.insert(format!("{name}_split_2"), root.join(format!("{name}_split_2.pkl")));
        ModelWeightSet::new(entries)
    };
    PipelineConfig {
        orientation: CANONICAL_ORIENTATION.to_string(),
        spacing: [0.8, 0.8, 0.8],
        thickness: 1,
        crop_shape: [4, 4, 4],
        batch_size: 16,
        num_classes: 2,
        localization: StageConfig {
            architecture: "FastSurferCNN".to_string(),
            image_size: [192, 192],
            spacing: [1.6, 1.6, 1.6],
            weights: weights("loc"),
        },
        segmentation: StageConfig {
            architecture: "AttFastSurferCNN".to_string(),
            image_size: [96, 96],
            spacing: [0.8, 0.8, 0.8],
            weights: weights("seg"),
        },
        volumetric: false,
        device: DeviceMode::Cpu,
        save_logits: false,
    }
}

/// Write a scan for `subject` under `scans/<subject>/T2_<subject>.nii.gz`.
pub fn write_scan(scans: &Path, subject: &str, behaviour: &str) -> PathBuf {
    let dir = scans.join(subject);
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("T2_{subject}.nii.gz"));
    fs::write(&path, behaviour).unwrap();
    path
}

#[derive(Default)]
pub struct FakeBackend {
    /// Sleep inside each call so concurrent tasks overlap.
    pub delay: Duration,
    /// Subjects between conform and their last backend call.
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    gpu_active: AtomicUsize,
    pub max_gpu_active: AtomicUsize,
    per_device: Mutex<BTreeMap<usize, usize>>,
    pub max_per_device: AtomicUsize,
}

impl FakeBackend {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn backend(self: &Arc<Self>) -> Backend {
        Backend {
            io: self.clone(),
            localizer: self.clone(),
            segmenter: self.clone(),
            qc: self.clone(),
        }
    }

    fn enter_gpu(&self, device: Device) {
        if let Device::Gpu(id) = device {
            let now = self.gpu_active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_gpu_active.fetch_max(now, Ordering::SeqCst);
            let mut per_device = self.per_device.lock().unwrap();
            let count = per_device.entry(id).or_insert(0);
            *count += 1;
            self.max_per_device.fetch_max(*count, Ordering::SeqCst);
        }
    }

    fn leave_gpu(&self, device: Device) {
        if let Device::Gpu(id) = device {
            self.gpu_active.fetch_sub(1, Ordering::SeqCst);
            let mut per_device = self.per_device.lock().unwrap();
            if let Some(count) = per_device.get_mut(&id) {
                *count -= 1;
            }
        }
    }

    fn finish_subject(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn pause(&self) {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
    }
}

fn behaviour(volume: &Volume) -> f32 {
    volume.data.iter().next().copied().unwrap_or(OK)
}

impl VolumeIo for FakeBackend {
    fn load_conformed(
        &self,
        input: &Path,
        config: &PipelineConfig,
        _ctx: StageContext<'_>,
    ) -> Result<Volume, AppError> {
        let text = fs::read_to_string(input)
            .map_err(|e| AppError::input(format!("Cannot read '{}': {e}", input.display())))?;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.pause();

        let fill = match text.trim() {
            "miss" => MISS,
            "fail" => FAIL,
            "panic" => PANIC,
            _ => OK,
        };
        Ok(Volume::new(Array3::from_elem((8, 8, 8), fill), config.spacing))
    }

    fn save_volume(&self, volume: &Volume, path: &Path, _ctx: StageContext<'_>) -> Result<(), AppError> {
        fs::write(path, format!("volume {:?}", volume.shape()))
            .map_err(|e| AppError::runtime(format!("Failed to save '{}': {e}", path.display())))
    }
}

impl Localizer for FakeBackend {
    fn localize(
        &self,
        volume: &Volume,
        _stage: &StageConfig,
        ctx: StageContext<'_>,
    ) -> Result<Option<Localization>, AppError> {
        self.enter_gpu(ctx.device);
        self.pause();
        self.leave_gpu(ctx.device);

        match behaviour(volume) {
            v if v == MISS => {
                self.finish_subject();
                Ok(None)
            }
            v if v == PANIC => {
                self.finish_subject();
                panic!("localizer crashed")
            }
            _ => Ok(Some(Localization {
                center: [4.0, 4.0, 4.0],
                confidence: 0.95,
            })),
        }
    }
}

impl Segmenter for FakeBackend {
    fn segment(
        &self,
        crop: &Volume,
        _stage: &StageConfig,
        options: SegmentOptions,
        ctx: StageContext<'_>,
    ) -> Result<Segmentation, AppError> {
        self.enter_gpu(ctx.device);
        self.pause();
        self.leave_gpu(ctx.device);

        if behaviour(crop) == FAIL {
            self.finish_subject();
            return Err(AppError::runtime("injected inference failure"));
        }
        let (x, y, z) = crop.data.dim();
        let labels = Array3::from_shape_fn((x, y, z), |(i, j, k)| {
            u8::from((1..3).contains(&i) && (1..3).contains(&j) && (1..3).contains(&k))
        });
        let probabilities = options
            .probabilities
            .then(|| Array3::from_elem((x, y, z), 0.8f32));
        Ok(Segmentation { labels, probabilities })
    }
}

impl QcRenderer for FakeBackend {
    fn render(
        &self,
        _image: &Volume,
        _labels: &Array3<u8>,
        qc_dir: &Path,
        _ctx: StageContext<'_>,
    ) -> Result<Vec<PathBuf>, AppError> {
        self.pause();
        self.finish_subject();
        let path = qc_dir.join("ob_overlay.png");
        fs::write(&path, b"png").map_err(|e| AppError::runtime(e.to_string()))?;
        Ok(vec![path])
    }
}
