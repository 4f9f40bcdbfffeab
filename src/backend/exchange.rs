//! Volume exchange files shared with the inference toolkit.
//!
//! A volume `<stem>` is stored as two files:
//!
//! - `<stem>.json`: header with shape and spacing
//! - `<stem>.raw`: voxels as little-endian `f32`, C order (last axis fastest)

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::volume::Volume;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeHeader {
    pub shape: [usize; 3],
    pub spacing: [f32; 3],
    pub dtype: String,
}

const DTYPE: &str = "float32";

pub fn header_path(stem: &Path) -> PathBuf {
    stem.with_extension("json")
}

pub fn data_path(stem: &Path) -> PathBuf {
    stem.with_extension("raw")
}

pub fn write_exchange(volume: &Volume, stem: &Path) -> Result<(), AppError> {
    let header = ExchangeHeader {
        shape: volume.shape(),
        spacing: volume.spacing,
        dtype: DTYPE.to_string(),
    };
    let header_file = File::create(header_path(stem))
        .map_err(|e| AppError::runtime(format!("Failed to create exchange header '{}': {e}", stem.display())))?;
    serde_json::to_writer(header_file, &header)
        .map_err(|e| AppError::runtime(format!("Failed to write exchange header: {e}")))?;

    let data_file = File::create(data_path(stem))
        .map_err(|e| AppError::runtime(format!("Failed to create exchange data '{}': {e}", stem.display())))?;
    let mut out = BufWriter::new(data_file);
    for v in volume.data.iter() {
        out.write_all(&v.to_le_bytes())
            .map_err(|e| AppError::runtime(format!("Failed to write exchange data: {e}")))?;
    }
    out.flush()
        .map_err(|e| AppError::runtime(format!("Failed to write exchange data: {e}")))?;
    Ok(())
}

pub fn read_exchange(stem: &Path) -> Result<Volume, AppError> {
    let header_file = File::open(header_path(stem)).map_err(|e| {
        AppError::runtime(format!("Missing exchange header for '{}': {e}", stem.display()))
    })?;
    let header: ExchangeHeader = serde_json::from_reader(header_file)
        .map_err(|e| AppError::runtime(format!("Invalid exchange header '{}': {e}", stem.display())))?;
    if header.dtype != DTYPE {
        return Err(AppError::runtime(format!(
            "Unsupported exchange dtype '{}' in '{}'.",
            header.dtype,
            stem.display()
        )));
    }

    let bytes = fs::read(data_path(stem))
        .map_err(|e| AppError::runtime(format!("Missing exchange data for '{}': {e}", stem.display())))?;
    let expected: usize = header.shape.iter().product::<usize>() * 4;
    if bytes.len() != expected {
        return Err(AppError::runtime(format!(
            "Exchange data '{}' has {} bytes, expected {expected}.",
            stem.display(),
            bytes.len()
        )));
    }

    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    let [x, y, z] = header.shape;
    let data = Array3::from_shape_vec((x, y, z), values)
        .map_err(|e| AppError::runtime(format!("Exchange data shape mismatch: {e}")))?;

    Ok(Volume::new(data, header.spacing))
}

/// Read an exchange volume as integer labels (values rounded).
pub fn read_labels(stem: &Path) -> Result<Array3<u8>, AppError> {
    let volume = read_exchange(stem)?;
    Ok(volume.data.mapv(|v| v.round().clamp(0.0, f32::from(u8::MAX)) as u8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_preserves_voxel_order_and_spacing() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("crop");
        let data = Array3::from_shape_fn((2, 3, 4), |(x, y, z)| (x * 100 + y * 10 + z) as f32);
        let volume = Volume::new(data, [0.8, 0.8, 1.0]);

        write_exchange(&volume, &stem).unwrap();
        assert_eq!(fs::metadata(data_path(&stem)).unwrap().len(), 2 * 3 * 4 * 4);

        let back = read_exchange(&stem).unwrap();
        assert_eq!(back, volume);
        assert_eq!(back.data[[1, 2, 3]], 123.0);
    }

    #[test]
    fn truncated_data_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("labels");
        let volume = Volume::new(Array3::from_elem((2, 2, 2), 1.0), [1.0, 1.0, 1.0]);
        write_exchange(&volume, &stem).unwrap();
        fs::write(data_path(&stem), [0u8; 12]).unwrap();
        assert!(read_exchange(&stem).is_err());
    }

    #[test]
    fn labels_are_rounded() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("labels");
        let mut data = Array3::zeros((1, 1, 3));
        data[[0, 0, 1]] = 0.9;
        data[[0, 0, 2]] = 1.2;
        write_exchange(&Volume::new(data, [1.0, 1.0, 1.0]), &stem).unwrap();
        let labels = read_labels(&stem).unwrap();
        assert_eq!(labels.iter().copied().collect::<Vec<_>>(), vec![0, 1, 1]);
    }
}
