//! Accurate mode: each target independently averages every frame in its window,
//! itself included, remapped onto the target. No work is shared between targets.

use ndarray::Array3;

use super::primitives::{neighbor_range, OracleSession, RemapTask};
use super::{CorrespondenceOracle, EmitFn, Image};
use crate::error::Result;

pub(crate) fn run<O>(
    session: &mut OracleSession<'_, O>,
    guide: &[Image],
    style: &[Image],
    window: usize,
    emit: &mut EmitFn<'_>,
) -> Result<()>
where
    O: CorrespondenceOracle + ?Sized,
{
    let n = style.len();
    for target in 0..n {
        let sources: Vec<usize> = neighbor_range(target, n, window).collect();
        let mut sum: Image = Array3::zeros(style[target].dim());

        for chunk in sources.chunks(session.batch_size()) {
            let requests: Vec<RemapTask<'_>> = chunk
                .iter()
                .map(|&source| RemapTask {
                    target,
                    source_guide: &guide[source],
                    target_guide: &guide[target],
                    source_style: &style[source],
                })
                .collect();
            for frame in session.remap(&requests, "accurate")? {
                sum += &frame;
            }
        }

        emit(target, sum / sources.len() as f32)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{BlendMode, TemporalBlender};

    #[test]
    fn every_target_remaps_its_whole_window_including_itself() {
        let guide = index_guides(5);
        let style = constant_frames(&[0.0, 10.0, 20.0, 30.0, 40.0]);
        let blender = TemporalBlender::new(BlendMode::Accurate, 1, 8).expect("blender");
        let mut oracle = IdentityOracle::default();
        let out = collect_blend(&blender, &guide, &style, &mut oracle);

        let targets = oracle.targets.borrow();
        assert_eq!(targets.iter().filter(|&&t| t == 2).count(), 3);
        assert_eq!(targets.iter().filter(|&&t| t == 0).count(), 2);
        // One batch per target when the window fits in a batch.
        assert_eq!(oracle.calls, 5);
        assert!((out[4][[0, 0, 0]] - 35.0).abs() < 1e-4);
    }

    #[test]
    fn windows_larger_than_batch_are_split() {
        let guide = index_guides(4);
        let style = constant_frames(&[4.0, 8.0, 12.0, 16.0]);
        let blender = TemporalBlender::new(BlendMode::Accurate, 3, 3).expect("blender");
        let mut oracle = IdentityOracle::default();
        let out = collect_blend(&blender, &guide, &style, &mut oracle);

        assert_eq!(oracle.calls, 8);
        assert_eq!(oracle.max_batch, 3);
        assert!(out.iter().all(|f| (f[[1, 1, 1]] - 10.0).abs() < 1e-4));
    }
}
