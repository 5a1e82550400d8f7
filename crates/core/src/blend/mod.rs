//! Temporal-consistency blending of independently rendered frames.
//!
//! Every mode remaps style frames between neighbors with an external
//! correspondence oracle (guided by the guide frames) and averages the results:
//!
//! - **fast**: two directional Fenwick-table passes over a trailing window, merged
//!   with the original frame weighted `-1`.
//! - **balanced**: all `(source, target)` pairs within `±W`, streamed through
//!   per-target running means seeded with the target frame.
//! - **accurate**: per-target unweighted mean over `±W`, no amortization.
//!
//! Frames are HWC `f32` on a `0..=255` scale. All accumulation stays in `f32`;
//! quantization to `u8` happens once, when a frame is emitted.

mod accurate;
mod balanced;
mod fast;
mod primitives;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::anyhow;
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FuseError, Result};
use crate::tensor_io::save_png;

pub use primitives::{neighbor_count, quantize};

use primitives::OracleSession;

/// HWC frame, `0..=255` scale.
pub type Image = Array3<f32>;

/// External patch-matching engine. Batches are aligned: element `i` of the
/// result is `source_style[i]` remapped from `source_guide[i]` onto
/// `target_guide[i]`.
pub trait CorrespondenceOracle {
    fn estimate(
        &mut self,
        source_guide: &[&Image],
        target_guide: &[&Image],
        source_style: &[&Image],
    ) -> anyhow::Result<Vec<Image>>;

    /// Frees accelerator memory pools. Called once at the end of every blend.
    fn release_memory(&mut self) {}
}

impl<F> CorrespondenceOracle for F
where
    F: FnMut(&[&Image], &[&Image], &[&Image]) -> anyhow::Result<Vec<Image>>,
{
    fn estimate(
        &mut self,
        source_guide: &[&Image],
        target_guide: &[&Image],
        source_style: &[&Image],
    ) -> anyhow::Result<Vec<Image>> {
        self(source_guide, target_guide, source_style)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlendMode {
    #[default]
    Fast,
    Balanced,
    Accurate,
}

impl BlendMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Balanced => "balanced",
            Self::Accurate => "accurate",
        }
    }
}

impl fmt::Display for BlendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlendMode {
    type Err = FuseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "balanced" => Ok(Self::Balanced),
            "accurate" => Ok(Self::Accurate),
            other => Err(FuseError::config(format!(
                "blend mode must be fast, balanced or accurate, got '{other}'"
            ))),
        }
    }
}

/// Receives each finished frame exactly once, in any order.
pub(crate) type EmitFn<'e> = dyn FnMut(usize, Image) -> Result<()> + 'e;

pub struct TemporalBlender {
    mode: BlendMode,
    window_size: usize,
    batch_size: usize,
    cache_dir: Option<PathBuf>,
    spill_to_disk: bool,
}

impl TemporalBlender {
    pub fn new(mode: BlendMode, window_size: usize, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(FuseError::config("blend batch_size must be at least 1"));
        }
        Ok(Self {
            mode,
            window_size,
            batch_size,
            cache_dir: None,
            spill_to_disk: false,
        })
    }

    /// Emit `{dir}/{index}.png` per frame; with `spill_to_disk`, fast-mode
    /// tables live under `{dir}/left` and `{dir}/right`.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>, spill_to_disk: bool) -> Self {
        self.cache_dir = Some(dir.into());
        self.spill_to_disk = spill_to_disk;
        self
    }

    pub fn mode(&self) -> BlendMode {
        self.mode
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    /// Blends `style` towards temporal consistency using `guide` for
    /// correspondence. Returns one `u8` frame per style frame.
    pub fn blend<O>(&self, guide: &[Image], style: &[Image], oracle: &mut O) -> Result<Vec<Array3<u8>>>
    where
        O: CorrespondenceOracle + ?Sized,
    {
        let n = style.len();
        let mut frames: Vec<Option<Array3<u8>>> = vec![None; n];
        let cache_dir = self.cache_dir.clone();

        let mut emit = |index: usize, value: Image| -> Result<()> {
            let quantized = quantize(&value);
            if let Some(dir) = cache_dir.as_deref() {
                save_png(&dir.join(format!("{index}.png")), &quantized)?;
            }
            frames[index] = Some(quantized);
            Ok(())
        };
        self.blend_with(guide, style, oracle, &mut emit)?;

        frames
            .into_iter()
            .enumerate()
            .map(|(index, frame)| {
                frame.ok_or_else(|| {
                    FuseError::engine("blend emission", index, anyhow!("frame was never finalized"))
                })
            })
            .collect()
    }

    pub(crate) fn blend_with<O>(
        &self,
        guide: &[Image],
        style: &[Image],
        oracle: &mut O,
        emit: &mut EmitFn<'_>,
    ) -> Result<()>
    where
        O: CorrespondenceOracle + ?Sized,
    {
        validate_sequences(guide, style)?;
        if style.is_empty() {
            return Ok(());
        }

        info!(
            mode = %self.mode,
            frames = style.len(),
            window_size = self.window_size,
            batch_size = self.batch_size,
            "temporal blend start"
        );

        let mut session = OracleSession::new(oracle, self.batch_size);
        match self.mode {
            BlendMode::Fast => {
                let stores = match (&self.cache_dir, self.spill_to_disk) {
                    (Some(dir), true) => fast::PassStores::on_disk(dir)?,
                    _ => fast::PassStores::in_memory(),
                };
                fast::run(&mut session, guide, style, self.window_size, stores, emit)?
            }
            BlendMode::Balanced => balanced::run(&mut session, guide, style, self.window_size, emit)?,
            BlendMode::Accurate => accurate::run(&mut session, guide, style, self.window_size, emit)?,
        }

        info!(mode = %self.mode, oracle_calls = session.calls(), "temporal blend done");
        Ok(())
    }
}

fn validate_sequences(guide: &[Image], style: &[Image]) -> Result<()> {
    if guide.len() != style.len() {
        return Err(FuseError::config(format!(
            "guide has {} frames but style has {}",
            guide.len(),
            style.len()
        )));
    }
    for (name, frames) in [("guide", guide), ("style", style)] {
        if let Some(first) = frames.first() {
            if let Some(index) = frames.iter().position(|f| f.dim() != first.dim()) {
                return Err(FuseError::config(format!(
                    "{name} frame {index} has shape {:?}, expected {:?}",
                    frames[index].dim(),
                    first.dim()
                )));
            }
        }
    }
    if let (Some(g), Some(s)) = (guide.first(), style.first()) {
        if g.dim().0 != s.dim().0 || g.dim().1 != s.dim().1 {
            return Err(FuseError::config(format!(
                "guide resolution {:?} does not match style resolution {:?}",
                (g.dim().0, g.dim().1),
                (s.dim().0, s.dim().1)
            )));
        }
    }
    Ok(())
}
