//! In-memory voxel volumes and cropping.

use ndarray::{Array3, s};

use crate::error::AppError;

/// A scalar voxel volume with its voxel spacing in millimetres.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub data: Array3<f32>,
    pub spacing: [f32; 3],
}

/// A sub-volume together with where it was cut from.
#[derive(Debug, Clone, PartialEq)]
pub struct Crop {
    pub volume: Volume,
    /// Voxel index of the crop's first voxel in the source volume.
    pub origin: [usize; 3],
}

impl Volume {
    pub fn new(data: Array3<f32>, spacing: [f32; 3]) -> Self {
        Self { data, spacing }
    }

    pub fn shape(&self) -> [usize; 3] {
        let (x, y, z) = self.data.dim();
        [x, y, z]
    }

    /// Volume of one voxel in mm³.
    pub fn voxel_volume(&self) -> f64 {
        self.spacing.iter().map(|&s| f64::from(s)).product()
    }

    /// Cut a box of `shape` voxels centred on `center`.
    ///
    /// The box is shifted inward when it would cross a border and shrunk
    /// along axes where the volume itself is smaller than requested.
    pub fn crop_around(&self, center: [f32; 3], shape: [usize; 3]) -> Result<Crop, AppError> {
        let dims = self.shape();
        if dims.iter().any(|&d| d == 0) {
            return Err(AppError::runtime("Cannot crop an empty volume."));
        }
        if center.iter().any(|c| !c.is_finite()) {
            return Err(AppError::runtime(format!(
                "Localization center {center:?} is not finite."
            )));
        }

        let mut origin = [0usize; 3];
        let mut extent = [0usize; 3];
        for axis in 0..3 {
            let len = shape[axis].clamp(1, dims[axis]);
            let c = center[axis].round().clamp(0.0, (dims[axis] - 1) as f32) as usize;
            let start = c.saturating_sub(len / 2).min(dims[axis] - len);
            origin[axis] = start;
            extent[axis] = len;
        }

        let view = self.data.slice(s![
            origin[0]..origin[0] + extent[0],
            origin[1]..origin[1] + extent[1],
            origin[2]..origin[2] + extent[2]
        ]);

        Ok(Crop {
            volume: Volume::new(view.to_owned(), self.spacing),
            origin,
        })
    }
}
