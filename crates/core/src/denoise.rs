//! Multi-step denoising over a long latent sequence.
//!
//! Every timestep runs [`ChunkedFusion`] over the whole sequence (once per
//! guidance branch), combines the branches with classifier-free guidance and
//! lets the scheduler advance the latents. Steps are checkpointed, so an
//! interrupted run resumes at the first unfinished timestep.
//!
//! With a [`Smoother`], selected steps decode the scheduler's fully denoised
//! estimate, blend it for temporal consistency, encode it back and steer the
//! step towards the blended frames. The decoded output can get one more
//! blending pass at the end.

use std::collections::BTreeSet;

use anyhow::anyhow;
use ndarray::{Array3, ArrayD};
use tracing::{debug, info};

use crate::blend::{quantize, CorrespondenceOracle, Image, TemporalBlender};
use crate::cache::ConditioningCache;
use crate::checkpoint::{CheckpointManager, CheckpointedLoop};
use crate::error::{FuseError, Result};
use crate::fusion::{engine_fn, ChunkedFusion, GuidanceBranch, InferenceRequest};

/// Timestep schedule and update rule.
pub trait DenoiseScheduler {
    fn timesteps(&self) -> Vec<f32>;

    fn step(
        &mut self,
        step_index: usize,
        noise_pred: &ArrayD<f32>,
        latents: &ArrayD<f32>,
    ) -> anyhow::Result<ArrayD<f32>>;

    /// Fully denoised estimate of `latents` at `step_index`. Only called at
    /// smoothing steps.
    fn predict_final(
        &mut self,
        _step_index: usize,
        _noise_pred: &ArrayD<f32>,
        _latents: &ArrayD<f32>,
    ) -> anyhow::Result<ArrayD<f32>> {
        Err(anyhow!("scheduler does not support in-loop smoothing"))
    }

    /// Noise prediction that makes `step` move `latents` towards `target`.
    /// Only called at smoothing steps.
    fn return_to_timestep(
        &mut self,
        _step_index: usize,
        _latents: &ArrayD<f32>,
        _target: &ArrayD<f32>,
    ) -> anyhow::Result<ArrayD<f32>> {
        Err(anyhow!("scheduler does not support in-loop smoothing"))
    }
}

/// Conversion between latents and `0..=255` HWC frames.
pub trait FrameCodec {
    fn decode(&mut self, latents: &ArrayD<f32>) -> anyhow::Result<Vec<Image>>;

    fn encode(&mut self, frames: &[Image]) -> anyhow::Result<ArrayD<f32>>;
}

/// Noise prediction for one window at one timestep.
pub trait Denoiser {
    fn predict(&mut self, timestep: f32, request: &InferenceRequest<'_>) -> anyhow::Result<ArrayD<f32>>;
}

impl<F> Denoiser for F
where
    F: FnMut(f32, &InferenceRequest<'_>) -> anyhow::Result<ArrayD<f32>>,
{
    fn predict(&mut self, timestep: f32, request: &InferenceRequest<'_>) -> anyhow::Result<ArrayD<f32>> {
        self(timestep, request)
    }
}

/// Pins a closure to the [`Denoiser`] call signature.
pub fn denoiser_fn<F>(f: F) -> F
where
    F: FnMut(f32, &InferenceRequest<'_>) -> anyhow::Result<ArrayD<f32>>,
{
    f
}

/// Temporal blending hooked into a denoising run.
///
/// `guide` holds the source frames the oracle matches against; decoded frames
/// are the style side.
pub struct Smoother<'a> {
    blender: &'a TemporalBlender,
    guide: &'a [Image],
    oracle: &'a mut dyn CorrespondenceOracle,
    codec: &'a mut dyn FrameCodec,
    steps: BTreeSet<usize>,
    final_pass: bool,
}

impl<'a> Smoother<'a> {
    /// Blends the decoded output once at the end and at no intermediate step.
    pub fn new(
        blender: &'a TemporalBlender,
        guide: &'a [Image],
        oracle: &'a mut dyn CorrespondenceOracle,
        codec: &'a mut dyn FrameCodec,
    ) -> Self {
        Self {
            blender,
            guide,
            oracle,
            codec,
            steps: BTreeSet::new(),
            final_pass: true,
        }
    }

    pub fn at_steps(mut self, steps: impl IntoIterator<Item = usize>) -> Self {
        self.steps = steps.into_iter().collect();
        self
    }

    pub fn with_final_pass(mut self, final_pass: bool) -> Self {
        self.final_pass = final_pass;
        self
    }

    pub fn runs_at(&self, step: usize) -> bool {
        self.steps.contains(&step)
    }

    fn smooth_latents(&mut self, step: usize, estimate: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let frames = self
            .codec
            .decode(estimate)
            .map_err(|e| FuseError::sequence_engine(format!("decode at step {step}"), e))?;
        let blended: Vec<Image> = self
            .blender
            .blend(self.guide, &frames, &mut *self.oracle)?
            .iter()
            .map(|frame| frame.mapv(f32::from))
            .collect();
        self.codec
            .encode(&blended)
            .map_err(|e| FuseError::sequence_engine(format!("encode at step {step}"), e))
    }

    fn finish(&mut self, latents: &ArrayD<f32>) -> Result<Vec<Array3<u8>>> {
        let frames = self
            .codec
            .decode(latents)
            .map_err(|e| FuseError::sequence_engine("decode output", e))?;
        if self.final_pass {
            self.blender.blend(self.guide, &frames, &mut *self.oracle)
        } else {
            Ok(frames.iter().map(quantize).collect())
        }
    }
}

#[derive(Debug, Clone)]
pub struct DenoisePipeline {
    fusion: ChunkedFusion,
    cfg_scale: f32,
}

impl DenoisePipeline {
    pub fn new(fusion: ChunkedFusion, cfg_scale: f32) -> Result<Self> {
        if !cfg_scale.is_finite() {
            return Err(FuseError::config(format!("cfg_scale must be finite, got {cfg_scale}")));
        }
        Ok(Self { fusion, cfg_scale })
    }

    pub fn cfg_scale(&self) -> f32 {
        self.cfg_scale
    }

    /// Whether each step also runs the negative branch.
    pub fn uses_guidance(&self) -> bool {
        self.cfg_scale != 1.0
    }

    /// Denoises `latents` through every scheduler timestep, resuming from and
    /// recording to `checkpoint`. A checkpoint that is already complete is
    /// returned as-is without touching the denoiser.
    pub fn run<D, S>(
        &self,
        latents: ArrayD<f32>,
        denoiser: &mut D,
        scheduler: &mut S,
        conditioning: Option<&mut ConditioningCache>,
        checkpoint: &mut CheckpointManager,
    ) -> Result<ArrayD<f32>>
    where
        D: Denoiser + ?Sized,
        S: DenoiseScheduler + ?Sized,
    {
        self.denoise(latents, denoiser, scheduler, conditioning, checkpoint, None)
    }

    /// [`run`](Self::run) with `smoother` applied at its steps, then decodes
    /// the final latents into frames.
    pub fn run_smoothed<D, S>(
        &self,
        latents: ArrayD<f32>,
        denoiser: &mut D,
        scheduler: &mut S,
        conditioning: Option<&mut ConditioningCache>,
        checkpoint: &mut CheckpointManager,
        smoother: &mut Smoother<'_>,
    ) -> Result<Vec<Array3<u8>>>
    where
        D: Denoiser + ?Sized,
        S: DenoiseScheduler + ?Sized,
    {
        let latents = self.denoise(
            latents,
            denoiser,
            scheduler,
            conditioning,
            checkpoint,
            Some(&mut *smoother),
        )?;
        smoother.finish(&latents)
    }

    fn denoise<D, S>(
        &self,
        latents: ArrayD<f32>,
        denoiser: &mut D,
        scheduler: &mut S,
        mut conditioning: Option<&mut ConditioningCache>,
        checkpoint: &mut CheckpointManager,
        mut smoother: Option<&mut Smoother<'_>>,
    ) -> Result<ArrayD<f32>>
    where
        D: Denoiser + ?Sized,
        S: DenoiseScheduler + ?Sized,
    {
        let timesteps = scheduler.timesteps();
        info!(
            steps = timesteps.len(),
            frames = latents.shape().first().copied().unwrap_or(0),
            cfg_scale = self.cfg_scale,
            smoothing_steps = smoother.as_ref().map_or(0, |s| s.steps.len()),
            "denoise start"
        );

        let positive = self.fusion.clone().with_branch(GuidanceBranch::Positive);
        let negative = self.fusion.clone().with_branch(GuidanceBranch::Negative);

        let result = CheckpointedLoop::new(checkpoint).run(timesteps.len(), latents, |step, latents| {
            let timestep = timesteps[step];
            let mut engine = engine_fn(|request| denoiser.predict(timestep, request));

            let posi = positive.run(&latents, &mut engine, conditioning.as_deref_mut())?;
            let mut noise_pred = if self.uses_guidance() {
                let nega = negative.run(&latents, &mut engine, conditioning.as_deref_mut())?;
                classifier_free_guidance(&posi, &nega, self.cfg_scale)
            } else {
                posi
            };

            if let Some(smoother) = smoother.as_deref_mut().filter(|s| s.runs_at(step)) {
                let estimate = scheduler
                    .predict_final(step, &noise_pred, &latents)
                    .map_err(|e| scheduler_error(step, e))?;
                ensure_latent_shape(step, "final estimate", &estimate, &latents)?;
                let target = smoother.smooth_latents(step, &estimate)?;
                ensure_latent_shape(step, "smoothed latents", &target, &latents)?;
                noise_pred = scheduler
                    .return_to_timestep(step, &latents, &target)
                    .map_err(|e| scheduler_error(step, e))?;
                debug!(step, "smoothed step estimate");
            }

            let next = scheduler
                .step(step, &noise_pred, &latents)
                .map_err(|e| scheduler_error(step, e))?;
            ensure_latent_shape(step, "next latents", &next, &latents)?;
            debug!(step, timestep, "denoise step done");
            Ok(next)
        })?;

        info!("denoise done");
        Ok(result)
    }
}

fn scheduler_error(step: usize, source: anyhow::Error) -> FuseError {
    FuseError::sequence_engine(format!("scheduler step {step}"), source)
}

fn ensure_latent_shape(step: usize, what: &str, got: &ArrayD<f32>, latents: &ArrayD<f32>) -> Result<()> {
    if got.shape() == latents.shape() {
        return Ok(());
    }
    Err(scheduler_error(
        step,
        anyhow!("{what} has shape {:?} for latents {:?}", got.shape(), latents.shape()),
    ))
}

/// `nega + cfg_scale * (posi - nega)`.
pub fn classifier_free_guidance(posi: &ArrayD<f32>, nega: &ArrayD<f32>, cfg_scale: f32) -> ArrayD<f32> {
    let mut guided = posi - nega;
    guided *= cfg_scale;
    guided += nega;
    guided
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use ndarray::IxDyn;

    use super::*;
    use crate::blend::test_support::{index_guides, IdentityOracle};
    use crate::blend::BlendMode;

    /// `latents - 0.5 * noise_pred` per step.
    struct HalfStep {
        steps: Vec<f32>,
        calls: usize,
    }

    impl DenoiseScheduler for HalfStep {
        fn timesteps(&self) -> Vec<f32> {
            self.steps.clone()
        }

        fn step(
            &mut self,
            _step_index: usize,
            noise_pred: &ArrayD<f32>,
            latents: &ArrayD<f32>,
        ) -> anyhow::Result<ArrayD<f32>> {
            self.calls += 1;
            Ok(latents - &(noise_pred * 0.5))
        }
    }

    fn latents(frames: usize) -> ArrayD<f32> {
        ArrayD::from_elem(IxDyn(&[frames, 2]), 8.0)
    }

    #[test]
    fn cfg_combines_branches() {
        let posi = ArrayD::from_elem(IxDyn(&[2]), 3.0);
        let nega = ArrayD::from_elem(IxDyn(&[2]), 1.0);
        let guided = classifier_free_guidance(&posi, &nega, 7.5);
        assert!(guided.iter().all(|v| (v - 16.0).abs() < 1e-5));
    }

    #[test]
    fn unit_cfg_skips_negative_branch() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut checkpoint = CheckpointManager::new(dir.path());
        let pipeline = DenoisePipeline::new(ChunkedFusion::new(4, 2, 1).expect("fusion"), 1.0)
            .expect("pipeline");
        let mut scheduler = HalfStep {
            steps: vec![2.0, 1.0],
            calls: 0,
        };
        let negative_calls = Cell::new(0);
        let mut denoiser = denoiser_fn(|_, request| {
            if request.branch == GuidanceBranch::Negative {
                negative_calls.set(negative_calls.get() + 1);
            }
            Ok(request.batch.to_owned())
        });

        let out = pipeline
            .run(latents(6), &mut denoiser, &mut scheduler, None, &mut checkpoint)
            .expect("denoise");

        assert_eq!(negative_calls.get(), 0);
        assert_eq!(scheduler.calls, 2);
        // Identity prediction halves the latents every step.
        assert!(out.iter().all(|v| (v - 2.0).abs() < 1e-4));
    }

    #[test]
    fn guidance_runs_both_branches_with_timestep() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut checkpoint = CheckpointManager::new(dir.path());
        let pipeline = DenoisePipeline::new(ChunkedFusion::new(3, 3, 1).expect("fusion"), 2.0)
            .expect("pipeline");
        let mut scheduler = HalfStep {
            steps: vec![10.0],
            calls: 0,
        };
        let mut seen = Vec::new();
        let mut denoiser = denoiser_fn(|timestep, request| {
            seen.push((timestep, request.branch));
            let value = match request.branch {
                GuidanceBranch::Positive => 3.0,
                GuidanceBranch::Negative => 1.0,
            };
            Ok(ArrayD::from_elem(request.batch.shape(), value))
        });

        let out = pipeline
            .run(latents(3), &mut denoiser, &mut scheduler, None, &mut checkpoint)
            .expect("denoise");

        assert_eq!(
            seen,
            vec![(10.0, GuidanceBranch::Positive), (10.0, GuidanceBranch::Negative)]
        );
        // noise_pred = 1 + 2 * (3 - 1) = 5; 8 - 2.5 = 5.5
        assert!(out.iter().all(|v| (v - 5.5).abs() < 1e-4));
    }

    #[test]
    fn failed_step_resumes_where_it_stopped() {
        let dir = tempfile::tempdir().expect("temp dir");
        let pipeline = DenoisePipeline::new(ChunkedFusion::new(2, 1, 1).expect("fusion"), 1.0)
            .expect("pipeline");
        let steps = vec![4.0, 3.0, 2.0, 1.0];

        let mut checkpoint = CheckpointManager::new(dir.path());
        let mut scheduler = HalfStep {
            steps: steps.clone(),
            calls: 0,
        };
        let mut flaky = denoiser_fn(|timestep, request| {
            if timestep == 2.0 {
                anyhow::bail!("device lost");
            }
            Ok(request.batch.to_owned())
        });
        let err = pipeline
            .run(latents(3), &mut flaky, &mut scheduler, None, &mut checkpoint)
            .expect_err("third step fails");
        assert!(err.is_engine());

        let mut checkpoint = CheckpointManager::new(dir.path());
        let mut scheduler = HalfStep { steps, calls: 0 };
        let mut timesteps_seen = Vec::new();
        let mut steady = denoiser_fn(|timestep, request| {
            timesteps_seen.push(timestep);
            Ok(request.batch.to_owned())
        });
        let out = pipeline
            .run(latents(3), &mut steady, &mut scheduler, None, &mut checkpoint)
            .expect("resumed run");

        assert_eq!(scheduler.calls, 2);
        assert!(timesteps_seen.iter().all(|&t| t == 2.0 || t == 1.0));
        assert!(out.iter().all(|v| (v - 0.5).abs() < 1e-4));
    }

    #[test]
    fn non_finite_cfg_scale_is_rejected() {
        let fusion = ChunkedFusion::new(4, 2, 1).expect("fusion");
        let err = DenoisePipeline::new(fusion, f32::NAN).expect_err("nan cfg");
        assert!(err.is_configuration());
    }

    /// `step` subtracts the full noise prediction, so a steered step lands
    /// exactly on its target.
    #[derive(Default)]
    struct DirectScheduler {
        steps: usize,
        steered: Vec<usize>,
    }

    impl DenoiseScheduler for DirectScheduler {
        fn timesteps(&self) -> Vec<f32> {
            (0..self.steps).rev().map(|t| t as f32).collect()
        }

        fn step(
            &mut self,
            _step_index: usize,
            noise_pred: &ArrayD<f32>,
            latents: &ArrayD<f32>,
        ) -> anyhow::Result<ArrayD<f32>> {
            Ok(latents - noise_pred)
        }

        fn predict_final(
            &mut self,
            _step_index: usize,
            noise_pred: &ArrayD<f32>,
            latents: &ArrayD<f32>,
        ) -> anyhow::Result<ArrayD<f32>> {
            Ok(latents - noise_pred)
        }

        fn return_to_timestep(
            &mut self,
            step_index: usize,
            latents: &ArrayD<f32>,
            target: &ArrayD<f32>,
        ) -> anyhow::Result<ArrayD<f32>> {
            self.steered.push(step_index);
            Ok(latents - target)
        }
    }

    /// Latents are `[frames, h, w, c]`; frame `i` is slice `i`.
    #[derive(Default)]
    struct StackCodec {
        decodes: usize,
        encodes: usize,
    }

    impl FrameCodec for StackCodec {
        fn decode(&mut self, latents: &ArrayD<f32>) -> anyhow::Result<Vec<Image>> {
            self.decodes += 1;
            latents
                .outer_iter()
                .map(|frame| -> anyhow::Result<Image> {
                    Ok(frame.to_owned().into_dimensionality::<ndarray::Ix3>()?)
                })
                .collect()
        }

        fn encode(&mut self, frames: &[Image]) -> anyhow::Result<ArrayD<f32>> {
            self.encodes += 1;
            let views: Vec<_> = frames.iter().map(|f| f.view()).collect();
            Ok(ndarray::stack(ndarray::Axis(0), &views)?.into_dyn())
        }
    }

    fn frame_latents(values: &[f32]) -> ArrayD<f32> {
        ArrayD::from_shape_fn(IxDyn(&[values.len(), 2, 3, 3]), |idx| values[idx[0]])
    }

    fn zero_noise(_: f32, request: &InferenceRequest<'_>) -> anyhow::Result<ArrayD<f32>> {
        Ok(ArrayD::zeros(request.batch.shape()))
    }

    fn frame_values(frames: &[Array3<u8>]) -> Vec<u8> {
        frames.iter().map(|f| f[[1, 2, 0]]).collect()
    }

    #[test]
    fn smoother_runs_only_at_selected_steps() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut checkpoint = CheckpointManager::new(dir.path());
        let pipeline = DenoisePipeline::new(ChunkedFusion::new(2, 1, 1).expect("fusion"), 1.0)
            .expect("pipeline");
        let blender = TemporalBlender::new(BlendMode::Accurate, 1, 4).expect("blender");
        let guide = index_guides(3);
        let mut oracle = IdentityOracle::default();
        let mut codec = StackCodec::default();
        let mut scheduler = DirectScheduler {
            steps: 4,
            ..Default::default()
        };

        let mut smoother = Smoother::new(&blender, &guide, &mut oracle, &mut codec)
            .at_steps([1, 3])
            .with_final_pass(false);
        let frames = pipeline
            .run_smoothed(
                frame_latents(&[10.0, 40.0, 70.0]),
                &mut denoiser_fn(zero_noise),
                &mut scheduler,
                None,
                &mut checkpoint,
                &mut smoother,
            )
            .expect("smoothed run");

        assert_eq!(scheduler.steered, vec![1, 3]);
        // Step 1: [25, 40, 55]. Step 3: [32.5, 40, 47.5], truncated.
        assert_eq!(frame_values(&frames), vec![32, 40, 47]);
        assert_eq!((codec.decodes, codec.encodes), (3, 2));
        assert_eq!(oracle.released, 2);
    }

    #[test]
    fn final_pass_blends_decoded_output_once() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut checkpoint = CheckpointManager::new(dir.path());
        let pipeline = DenoisePipeline::new(ChunkedFusion::new(2, 1, 1).expect("fusion"), 1.0)
            .expect("pipeline");
        let blender = TemporalBlender::new(BlendMode::Accurate, 1, 4).expect("blender");
        let guide = index_guides(3);
        let mut oracle = IdentityOracle::default();
        let mut codec = StackCodec::default();
        let mut scheduler = DirectScheduler {
            steps: 3,
            ..Default::default()
        };

        let mut smoother = Smoother::new(&blender, &guide, &mut oracle, &mut codec);
        let frames = pipeline
            .run_smoothed(
                frame_latents(&[10.0, 40.0, 70.0]),
                &mut denoiser_fn(zero_noise),
                &mut scheduler,
                None,
                &mut checkpoint,
                &mut smoother,
            )
            .expect("smoothed run");

        assert!(scheduler.steered.is_empty());
        assert_eq!(frame_values(&frames), vec![25, 40, 55]);
        assert_eq!((codec.decodes, codec.encodes), (1, 0));
        assert_eq!(oracle.released, 1);
    }

    #[test]
    fn scheduler_failure_is_reported_for_the_whole_sequence() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut checkpoint = CheckpointManager::new(dir.path());
        let pipeline = DenoisePipeline::new(ChunkedFusion::new(2, 1, 1).expect("fusion"), 1.0)
            .expect("pipeline");
        let blender = TemporalBlender::new(BlendMode::Fast, 1, 4).expect("blender");
        let guide = index_guides(3);
        let mut oracle = IdentityOracle::default();
        let mut codec = StackCodec::default();
        // HalfStep keeps the default hooks, which cannot smooth.
        let mut scheduler = HalfStep {
            steps: vec![1.0, 0.0],
            calls: 0,
        };

        let mut smoother = Smoother::new(&blender, &guide, &mut oracle, &mut codec).at_steps([0]);
        let err = pipeline
            .run_smoothed(
                frame_latents(&[10.0, 40.0, 70.0]),
                &mut denoiser_fn(zero_noise),
                &mut scheduler,
                None,
                &mut checkpoint,
                &mut smoother,
            )
            .expect_err("scheduler cannot smooth");

        assert!(err.is_engine());
        assert_eq!(err.frame(), None);
        assert!(err.to_string().contains("scheduler step 0"), "{err}");
        assert_eq!(scheduler.calls, 0);
    }
}
