//! Balanced mode: every `(source, target)` pair within the window is remapped
//! once. Each target keeps a running mean seeded with its own style frame and
//! is emitted as soon as its last neighbor arrives, so only targets with
//! in-flight contributions stay resident.

use std::collections::HashMap;

use tracing::trace;

use super::primitives::{neighbor_count, neighbor_range, OracleSession, RemapTask, RunningMean};
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
    let mut tasks = Vec::new();
    for target in 0..n {
        if neighbor_count(target, n, window) == 1 {
            emit(target, style[target].clone())?;
            continue;
        }
        tasks.extend(
            neighbor_range(target, n, window)
                .filter(|&source| source != target)
                .map(|source| (source, target)),
        );
    }

    let mut pending: HashMap<usize, RunningMean> = HashMap::new();
    for batch in tasks.chunks(session.batch_size()) {
        let requests: Vec<RemapTask<'_>> = batch
            .iter()
            .map(|&(source, target)| RemapTask {
                target,
                source_guide: &guide[source],
                target_guide: &guide[target],
                source_style: &style[source],
            })
            .collect();
        let remapped = session.remap(&requests, "balanced")?;

        for (&(_, target), frame) in batch.iter().zip(remapped) {
            let mean = pending
                .entry(target)
                .or_insert_with(|| RunningMean::new(style[target].clone(), 1.0));
            mean.accumulate(&frame, 1.0);

            let needed = neighbor_count(target, n, window);
            if mean.weight >= needed as f32 {
                if let Some(done) = pending.remove(&target) {
                    trace!(target, contributions = needed - 1, "balanced target finalized");
                    emit(target, done.value)?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::super::test_support::*;
    use super::super::{BlendMode, TemporalBlender};
    use super::*;

    fn contributions(targets: &[usize]) -> HashMap<usize, usize> {
        let mut counts = HashMap::new();
        for &t in targets {
            *counts.entry(t).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn targets_finalize_after_all_in_range_neighbors() {
        let guide = index_guides(5);
        let style = constant_frames(&[0.0, 10.0, 20.0, 30.0, 40.0]);
        let blender = TemporalBlender::new(BlendMode::Balanced, 1, 3).expect("blender");
        let mut oracle = IdentityOracle::default();
        let out = collect_blend(&blender, &guide, &style, &mut oracle);

        let counts = contributions(&oracle.targets.borrow());
        assert_eq!(counts[&2], 2);
        assert_eq!(counts[&0], 1);
        assert_eq!(counts[&4], 1);
        // Emitted value is the updated mean, not the seed.
        assert!((out[0][[0, 0, 0]] - 5.0).abs() < 1e-4);
        assert!((out[2][[0, 0, 0]] - 20.0).abs() < 1e-4);
    }

    #[test]
    fn frames_are_emitted_as_they_finalize() {
        let guide = index_guides(6);
        let style = constant_frames(&[1.0; 6]);
        let blender = TemporalBlender::new(BlendMode::Balanced, 1, 2).expect("blender");
        let mut oracle = IdentityOracle::default();
        let calls_at_emit = std::cell::RefCell::new(Vec::new());
        let targets = oracle.targets.clone();
        let mut emit = |index: usize, _: Image| -> Result<()> {
            calls_at_emit.borrow_mut().push((index, targets.borrow().len()));
            Ok(())
        };
        blender
            .blend_with(&guide, &style, &mut oracle, &mut emit)
            .expect("blend");

        let order = calls_at_emit.into_inner();
        assert_eq!(order.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4, 5]);
        // Frame 0 finishes long before the last task is issued.
        assert!(order[0].1 < order[5].1);
    }
}
