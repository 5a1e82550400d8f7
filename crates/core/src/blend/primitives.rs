//! Windowing, accumulation and oracle batching shared by every blend mode.

use std::collections::HashMap;
use std::fs;
use std::ops::Range;
use std::path::PathBuf;

use anyhow::anyhow;
use ndarray::{Array3, Ix3};
use tracing::{debug, warn};

use super::{CorrespondenceOracle, Image};
use crate::error::{FuseError, Result};
use crate::tensor_io::{read_tensor, write_tensor};

/// Sources within `±window` of `target`, clipped to `[0, n)`. Includes `target`.
pub(crate) fn neighbor_range(target: usize, n: usize, window: usize) -> Range<usize> {
    target.saturating_sub(window)..(target + window + 1).min(n)
}

/// Number of frames a target averages over, itself included.
pub fn neighbor_count(target: usize, n: usize, window: usize) -> usize {
    neighbor_range(target, n, window).len()
}

/// Clip to `[0, 255]` and truncate to `u8`.
pub fn quantize(image: &Image) -> Array3<u8> {
    image.mapv(|v| v.clamp(0.0, 255.0) as u8)
}

/// Online weighted mean of frames.
#[derive(Debug, Clone)]
pub(crate) struct RunningMean {
    pub value: Image,
    pub weight: f32,
}

impl RunningMean {
    pub fn new(value: Image, weight: f32) -> Self {
        Self { value, weight }
    }

    pub fn accumulate(&mut self, frame: &Image, weight: f32) {
        let total = self.weight + weight;
        let keep = self.weight / total;
        let take = weight / total;
        self.value
            .zip_mut_with(frame, |acc, &new| *acc = *acc * keep + new * take);
        self.weight = total;
    }
}

/// One `(source → target)` remap request.
pub(crate) struct RemapTask<'a> {
    /// Frame index in the caller's original ordering, for error reports.
    pub target: usize,
    pub source_guide: &'a Image,
    pub target_guide: &'a Image,
    pub source_style: &'a Image,
}

/// Owns the oracle for the duration of one blend call and releases its memory
/// pools when dropped.
pub(crate) struct OracleSession<'o, O: CorrespondenceOracle + ?Sized> {
    oracle: &'o mut O,
    batch_size: usize,
    calls: usize,
}

impl<'o, O: CorrespondenceOracle + ?Sized> OracleSession<'o, O> {
    pub fn new(oracle: &'o mut O, batch_size: usize) -> Self {
        Self {
            oracle,
            batch_size: batch_size.max(1),
            calls: 0,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn calls(&self) -> usize {
        self.calls
    }

    /// Remaps one batch. A failed batch is re-issued once as two halves; a
    /// second failure is fatal.
    pub fn remap(&mut self, tasks: &[RemapTask<'_>], context: &str) -> Result<Vec<Image>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        match self.estimate(tasks) {
            Ok(frames) => Ok(frames),
            Err(first) => {
                warn!(
                    context,
                    target = tasks[0].target,
                    batch = tasks.len(),
                    error = %first,
                    "oracle batch failed; retrying in halves"
                );
                let mid = tasks.len().div_ceil(2);
                let mut frames = Vec::with_capacity(tasks.len());
                for half in [&tasks[..mid], &tasks[mid..]] {
                    if half.is_empty() {
                        continue;
                    }
                    let remapped = self.estimate(half).map_err(|e| {
                        FuseError::engine(format!("{context} remap"), half[0].target, e)
                    })?;
                    frames.extend(remapped);
                }
                Ok(frames)
            }
        }
    }

    fn estimate(&mut self, tasks: &[RemapTask<'_>]) -> anyhow::Result<Vec<Image>> {
        let source_guide: Vec<&Image> = tasks.iter().map(|t| t.source_guide).collect();
        let target_guide: Vec<&Image> = tasks.iter().map(|t| t.target_guide).collect();
        let source_style: Vec<&Image> = tasks.iter().map(|t| t.source_style).collect();

        self.calls += 1;
        let remapped = self
            .oracle
            .estimate(&source_guide, &target_guide, &source_style)?;

        if remapped.len() != tasks.len() {
            return Err(anyhow!(
                "oracle returned {} frames for a batch of {}",
                remapped.len(),
                tasks.len()
            ));
        }
        for (frame, task) in remapped.iter().zip(tasks) {
            if frame.dim() != task.source_style.dim() {
                return Err(anyhow!(
                    "oracle returned shape {:?} for style shape {:?}",
                    frame.dim(),
                    task.source_style.dim()
                ));
            }
            if frame.iter().any(|v| !v.is_finite()) {
                return Err(anyhow!("oracle returned non-finite values for frame {}", task.target));
            }
        }
        Ok(remapped)
    }
}

impl<O: CorrespondenceOracle + ?Sized> Drop for OracleSession<'_, O> {
    fn drop(&mut self) {
        self.oracle.release_memory();
        debug!(calls = self.calls, "oracle memory released");
    }
}

/// Intermediate frames keyed by name, held in memory or spilled to a directory.
pub(crate) enum FrameStore {
    Memory(HashMap<String, Image>),
    Disk(PathBuf),
}

impl FrameStore {
    pub fn memory() -> Self {
        Self::Memory(HashMap::new())
    }

    pub fn disk(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).map_err(|e| FuseError::io("create blend cache", &dir, e))?;
        Ok(Self::Disk(dir))
    }

    pub fn put(&mut self, key: &str, image: Image) -> Result<()> {
        match self {
            Self::Memory(frames) => {
                frames.insert(key.to_string(), image);
                Ok(())
            }
            Self::Disk(dir) => write_tensor(&dir.join(key), &image.into_dyn()),
        }
    }

    pub fn get(&self, key: &str) -> Result<Image> {
        match self {
            Self::Memory(frames) => frames.get(key).cloned().ok_or_else(|| {
                FuseError::io(
                    "read blend intermediate",
                    &PathBuf::from(key),
                    std::io::Error::new(std::io::ErrorKind::NotFound, "frame not in store"),
                )
            }),
            Self::Disk(dir) => {
                let path = dir.join(key);
                read_tensor(&path)?
                    .into_dimensionality::<Ix3>()
                    .map_err(|e| {
                        FuseError::io(
                            "decode blend intermediate",
                            &path,
                            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
                        )
                    })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighbor_counts_clip_at_sequence_edges() {
        assert_eq!(neighbor_count(2, 5, 1), 3);
        assert_eq!(neighbor_count(0, 5, 1), 2);
        assert_eq!(neighbor_count(4, 5, 1), 2);
        assert_eq!(neighbor_count(0, 1, 3), 1);
        assert_eq!(neighbor_range(3, 10, 2), 1..6);
    }

    #[test]
    fn quantize_clips_then_truncates() {
        let image = Array3::from_shape_vec((1, 1, 4), vec![-3.0, 12.9, 254.99, 300.0])
            .expect("shape");
        let q = quantize(&image);
        assert_eq!(q.as_slice().expect("contiguous"), &[0, 12, 254, 255]);
    }

    #[test]
    fn running_mean_with_unit_weights_is_arithmetic_mean() {
        let mut mean = RunningMean::new(Array3::from_elem((1, 1, 1), 2.0), 1.0);
        mean.accumulate(&Array3::from_elem((1, 1, 1), 4.0), 1.0);
        mean.accumulate(&Array3::from_elem((1, 1, 1), 9.0), 1.0);
        assert!((mean.value[[0, 0, 0]] - 5.0).abs() < 1e-5);
        assert_eq!(mean.weight, 3.0);
    }

    #[test]
    fn disk_store_round_trips_frames() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut store = FrameStore::disk(dir.path().join("left")).expect("store");
        let frame = Array3::from_shape_fn((2, 3, 3), |(y, x, c)| (y * 9 + x * 3 + c) as f32);
        store.put("4_1", frame.clone()).expect("put");
        assert_eq!(store.get("4_1").expect("get"), frame);
        assert!(dir.path().join("left").join("4_1").is_file());
        assert!(store.get("missing").is_err());
    }
}
