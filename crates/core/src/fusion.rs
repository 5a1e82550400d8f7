//! Sliding-window inference over long sequences with overlap-weighted fusion.
//!
//! Sequences are `ArrayD<f32>` with frames on axis 0. Each window is sent to the
//! external engine; every frame's result is folded into a running weighted
//! average, so the final value is ready without a separate normalization pass
//! and does not depend on window order.

use anyhow::anyhow;
use ndarray::{ArrayD, ArrayViewD, Axis, Slice};
use tracing::{debug, warn};

use crate::cache::{Conditioning, ConditioningCache};
use crate::error::{FuseError, Result};
use crate::window::{Window, WindowPlan};

/// Which classifier-free guidance branch a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GuidanceBranch {
    #[default]
    Positive,
    Negative,
}

pub struct InferenceRequest<'a> {
    pub window: Window,
    /// Frames `window.start..window.end`, axis 0.
    pub batch: ArrayViewD<'a, f32>,
    pub conditioning: Option<&'a Conditioning>,
    pub branch: GuidanceBranch,
    /// Engine-internal sub-batch (or tile) size. Halved on retry.
    pub sub_batch_size: usize,
}

/// External denoiser call. Must return exactly one output per input frame with
/// the input's shape.
pub trait InferenceEngine {
    fn infer(&mut self, request: &InferenceRequest<'_>) -> anyhow::Result<ArrayD<f32>>;
}

impl<F> InferenceEngine for F
where
    F: FnMut(&InferenceRequest<'_>) -> anyhow::Result<ArrayD<f32>>,
{
    fn infer(&mut self, request: &InferenceRequest<'_>) -> anyhow::Result<ArrayD<f32>> {
        self(request)
    }
}

/// Pins a closure to the [`InferenceEngine`] call signature.
pub fn engine_fn<F>(f: F) -> F
where
    F: FnMut(&InferenceRequest<'_>) -> anyhow::Result<ArrayD<f32>>,
{
    f
}

/// Per-frame online weighted averages.
#[derive(Debug, Clone)]
pub struct FusionAccumulator {
    values: ArrayD<f32>,
    weights: Vec<f64>,
}

impl FusionAccumulator {
    /// Zeroed accumulator for a sequence shaped like `shape` (frames on axis 0).
    pub fn zeros(shape: &[usize]) -> Result<Self> {
        let Some(&frames) = shape.first() else {
            return Err(FuseError::config("sequence must have a frame axis"));
        };
        Ok(Self {
            values: ArrayD::zeros(shape),
            weights: vec![0.0; frames],
        })
    }

    pub fn frame_count(&self) -> usize {
        self.weights.len()
    }

    pub fn weight(&self, frame: usize) -> f64 {
        self.weights[frame]
    }

    /// `value ← value·old/(old+w) + new·w/(old+w)`, `weight ← old + w`.
    pub fn accumulate(&mut self, frame: usize, value: ArrayViewD<'_, f32>, weight: f64) {
        let old = self.weights[frame];
        let total = old + weight;
        if total <= 0.0 {
            return;
        }
        let keep = (old / total) as f32;
        let take = (weight / total) as f32;
        self.values
            .index_axis_mut(Axis(0), frame)
            .zip_mut_with(&value, |acc, &new| *acc = *acc * keep + new * take);
        self.weights[frame] = total;
    }

    /// Folds another partial accumulator into this one.
    pub fn merge(&mut self, other: &FusionAccumulator) -> Result<()> {
        if self.values.shape() != other.values.shape() {
            return Err(FuseError::config(format!(
                "cannot merge accumulators of shape {:?} and {:?}",
                self.values.shape(),
                other.values.shape()
            )));
        }
        for frame in 0..other.frame_count() {
            let weight = other.weights[frame];
            if weight > 0.0 {
                self.accumulate(frame, other.values.index_axis(Axis(0), frame), weight);
            }
        }
        Ok(())
    }

    /// Frames with zero weight (never covered) are returned as zeros.
    pub fn finalize(self) -> ArrayD<f32> {
        self.values
    }
}

#[derive(Debug, Clone)]
pub struct ChunkedFusion {
    window_size: usize,
    stride: usize,
    sub_batch_size: usize,
    branch: GuidanceBranch,
}

impl ChunkedFusion {
    pub fn new(window_size: usize, stride: usize, sub_batch_size: usize) -> Result<Self> {
        crate::window::validate_window_params(window_size, stride)?;
        if sub_batch_size == 0 {
            return Err(FuseError::config("sub_batch_size must be at least 1"));
        }
        Ok(Self {
            window_size,
            stride,
            sub_batch_size,
            branch: GuidanceBranch::Positive,
        })
    }

    pub fn with_branch(mut self, branch: GuidanceBranch) -> Self {
        self.branch = branch;
        self
    }

    pub fn set_branch(&mut self, branch: GuidanceBranch) {
        self.branch = branch;
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Runs the engine over every window of `sample` and returns the fused
    /// per-frame results.
    pub fn run<E>(
        &self,
        sample: &ArrayD<f32>,
        engine: &mut E,
        mut conditioning: Option<&mut ConditioningCache>,
    ) -> Result<ArrayD<f32>>
    where
        E: InferenceEngine + ?Sized,
    {
        let total_frames = sample.shape().first().copied().unwrap_or(0);
        let plan = WindowPlan::new(total_frames, self.window_size, self.stride)?;
        let mut accumulator = FusionAccumulator::zeros(sample.shape())?;

        for window in &plan {
            let cond = match conditioning.as_deref_mut() {
                Some(cache) if cache.processor_count() > 0 => Some(cache.load_window(window)?),
                _ => None,
            };
            let batch = sample.slice_axis(Axis(0), Slice::from(window.start..window.end));
            let output = self.infer_window(engine, window, batch, cond.as_ref())?;

            for (offset, frame) in window.indices().enumerate() {
                accumulator.accumulate(frame, output.index_axis(Axis(0), offset), window.weight(frame));
            }
            debug!(%window, branch = ?self.branch, "window fused");
        }

        Ok(accumulator.finalize())
    }

    fn infer_window<E>(
        &self,
        engine: &mut E,
        window: Window,
        batch: ArrayViewD<'_, f32>,
        conditioning: Option<&Conditioning>,
    ) -> Result<ArrayD<f32>>
    where
        E: InferenceEngine + ?Sized,
    {
        let mut attempt = |sub_batch_size: usize| -> std::result::Result<ArrayD<f32>, (usize, anyhow::Error)> {
            let request = InferenceRequest {
                window,
                batch: batch.view(),
                conditioning,
                branch: self.branch,
                sub_batch_size,
            };
            let output = engine
                .infer(&request)
                .map_err(|e| (window.start, e))?;
            check_engine_output(&batch, &output, window)?;
            Ok(output)
        };

        match attempt(self.sub_batch_size) {
            Ok(output) => Ok(output),
            Err((frame, first)) => {
                let reduced = (self.sub_batch_size / 2).max(1);
                warn!(
                    %window,
                    frame,
                    error = %first,
                    sub_batch_size = reduced,
                    "engine failed on window; retrying with reduced sub-batch"
                );
                attempt(reduced).map_err(|(frame, second)| {
                    FuseError::engine(format!("inference on window {window}"), frame, second)
                })
            }
        }
    }
}

fn check_engine_output(
    input: &ArrayViewD<'_, f32>,
    output: &ArrayD<f32>,
    window: Window,
) -> std::result::Result<(), (usize, anyhow::Error)> {
    if output.shape() != input.shape() {
        return Err((
            window.start,
            anyhow!(
                "engine returned shape {:?} for input shape {:?}",
                output.shape(),
                input.shape()
            ),
        ));
    }
    for (offset, frame) in output.axis_iter(Axis(0)).enumerate() {
        if frame.iter().any(|v| !v.is_finite()) {
            return Err((
                window.start + offset,
                anyhow!("engine returned non-finite values"),
            ));
        }
    }
    Ok(())
}
