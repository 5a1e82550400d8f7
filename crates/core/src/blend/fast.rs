//! Fast mode.
//!
//! Each direction builds a Fenwick table: node `(p, level)` holds the mean of
//! every style frame in `p - 2^level + 1 ..= p`, remapped onto frame `p`. A
//! trailing window sum then needs one remap per table node the window
//! decomposes into, so each frame costs `O(log W)` oracle tasks per direction.
//! The backward direction runs the same pass over the reversed sequence.

use std::path::Path;

use anyhow::anyhow;
use tracing::debug;

use super::primitives::{FrameStore, OracleSession, RemapTask, RunningMean};
use super::{CorrespondenceOracle, EmitFn, Image};
use crate::error::{FuseError, Result};

/// Intermediate storage for the two directional passes.
pub(crate) struct PassStores {
    forward: FrameStore,
    backward: FrameStore,
}

impl PassStores {
    pub fn in_memory() -> Self {
        Self {
            forward: FrameStore::memory(),
            backward: FrameStore::memory(),
        }
    }

    /// Spills tables to `{dir}/left` and `{dir}/right`.
    pub fn on_disk(dir: &Path) -> Result<Self> {
        Ok(Self {
            forward: FrameStore::disk(dir.join("left"))?,
            backward: FrameStore::disk(dir.join("right"))?,
        })
    }
}

pub(crate) fn run<O>(
    session: &mut OracleSession<'_, O>,
    guide: &[Image],
    style: &[Image],
    window: usize,
    stores: PassStores,
    emit: &mut EmitFn<'_>,
) -> Result<()>
where
    O: CorrespondenceOracle + ?Sized,
{
    let n = style.len();
    let PassStores {
        mut forward,
        mut backward,
    } = stores;

    let left_weights = window_sums(session, &Direction::forward(guide, style), &mut forward, window)?;
    let right_weights = window_sums(session, &Direction::backward(guide, style), &mut backward, window)?;

    for (t, frame) in style.iter().enumerate() {
        let mirrored = n - 1 - t;
        let (wl, wr) = (left_weights[t], right_weights[mirrored]);
        let total = wl + wr - 1.0;
        if !(total.is_finite() && total > 0.0) {
            return Err(FuseError::engine(
                "fast blend merge",
                t,
                anyhow!("merge weight {total} is not positive"),
            ));
        }

        let mut merged = forward.get(&sum_key(t))? * (wl / total);
        merged.scaled_add(-1.0 / total, frame);
        merged.scaled_add(wr / total, &backward.get(&sum_key(mirrored))?);
        emit(t, merged)?;
    }
    Ok(())
}

/// One pass over the sequence. Position `p` of a backward pass is frame `n - 1 - p`.
struct Direction<'a> {
    name: &'static str,
    guide: Vec<&'a Image>,
    style: Vec<&'a Image>,
    reversed: bool,
}

impl<'a> Direction<'a> {
    fn forward(guide: &'a [Image], style: &'a [Image]) -> Self {
        Self {
            name: "fast forward",
            guide: guide.iter().collect(),
            style: style.iter().collect(),
            reversed: false,
        }
    }

    fn backward(guide: &'a [Image], style: &'a [Image]) -> Self {
        Self {
            name: "fast backward",
            guide: guide.iter().rev().collect(),
            style: style.iter().rev().collect(),
            reversed: true,
        }
    }

    fn len(&self) -> usize {
        self.style.len()
    }

    fn frame(&self, position: usize) -> usize {
        if self.reversed {
            self.len() - 1 - position
        } else {
            position
        }
    }

    fn remap_task<'s>(&'s self, task: &TableTask, source_style: &'s Image) -> RemapTask<'s> {
        RemapTask {
            target: self.frame(task.target),
            source_guide: self.guide[task.source],
            target_guide: self.guide[task.target],
            source_style,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TableTask {
    source: usize,
    target: usize,
    level: usize,
}

fn table_key(position: usize, level: usize) -> String {
    format!("{position}_{level}")
}

fn sum_key(position: usize) -> String {
    format!("sum_{position}")
}

/// Remaps that populate the Fenwick table, ordered by level.
fn table_tasks(n: usize) -> Vec<TableTask> {
    let mut max_level: usize = 1;
    while (1usize << max_level) <= n {
        max_level += 1;
    }

    let mut tasks = Vec::new();
    for source in 0..n {
        let mut target = source;
        for level in 0..max_level {
            if source & (1 << level) != 0 {
                continue;
            }
            target |= 1 << level;
            if target >= n {
                break;
            }
            tasks.push(TableTask {
                source,
                target,
                level: level + 1,
            });
        }
    }
    tasks.sort_by_key(|task| task.level);
    tasks
}

/// Decomposes `left..=right` into disjoint table nodes `(position, level)`,
/// starting at `right`.
fn tree_query(left: usize, right: usize) -> Vec<(usize, usize)> {
    let left = left as isize;
    let mut idx = right as isize;
    let mut nodes = Vec::new();
    while idx >= left {
        let mut level = 0;
        while (idx >> level) & 1 == 1 && idx - (1isize << (level + 1)) + 1 >= left {
            level += 1;
        }
        nodes.push((idx as usize, level));
        idx -= 1isize << level;
    }
    nodes
}

/// Level 0 is the style frame itself; level `l > 0` averages the remaps of the
/// sources that climb to this node at level `l`. Returns per-node weights.
fn build_remapping_table<O>(
    session: &mut OracleSession<'_, O>,
    direction: &Direction<'_>,
    store: &mut FrameStore,
) -> Result<Vec<Vec<f32>>>
where
    O: CorrespondenceOracle + ?Sized,
{
    let mut weights = Vec::with_capacity(direction.len());
    for (position, frame) in direction.style.iter().enumerate() {
        store.put(&table_key(position, 0), (*frame).clone())?;
        weights.push(vec![1.0f32]);
    }

    let tasks = table_tasks(direction.len());
    debug!(pass = direction.name, tasks = tasks.len(), "building remapping table");
    for batch in tasks.chunks(session.batch_size()) {
        let requests: Vec<RemapTask<'_>> = batch
            .iter()
            .map(|task| direction.remap_task(task, direction.style[task.source]))
            .collect();
        let remapped = session.remap(&requests, direction.name)?;

        for (task, frame) in batch.iter().zip(remapped) {
            let levels = &mut weights[task.target];
            let key = table_key(task.target, task.level);
            debug_assert!(task.level <= levels.len());
            if levels.len() == task.level {
                store.put(&key, frame)?;
                levels.push(1.0);
            } else {
                let mut mean = RunningMean::new(store.get(&key)?, levels[task.level]);
                mean.accumulate(&frame, 1.0);
                levels[task.level] = mean.weight;
                store.put(&key, mean.value)?;
            }
        }
    }
    Ok(weights)
}

/// Folds each level into the next so node `(p, l)` covers its whole span.
fn remapping_to_blending_table(store: &mut FrameStore, weights: &mut [Vec<f32>]) -> Result<()> {
    for (position, levels) in weights.iter_mut().enumerate() {
        for level in 1..levels.len() {
            let mut mean = RunningMean::new(store.get(&table_key(position, level - 1))?, levels[level - 1]);
            mean.accumulate(&store.get(&table_key(position, level))?, levels[level]);
            levels[level] = mean.weight;
            store.put(&table_key(position, level), mean.value)?;
        }
    }
    Ok(())
}

/// Mean of every frame in `p - window ..= p` remapped onto `p`, stored under
/// `sum_{p}`. Returns the weight (frame count) of each sum.
fn window_sums<O>(
    session: &mut OracleSession<'_, O>,
    direction: &Direction<'_>,
    store: &mut FrameStore,
    window: usize,
) -> Result<Vec<f32>>
where
    O: CorrespondenceOracle + ?Sized,
{
    let mut table = build_remapping_table(session, direction, store)?;
    remapping_to_blending_table(store, &mut table)?;

    let mut sum_weights = Vec::with_capacity(direction.len());
    let mut tasks = Vec::new();
    for target in 0..direction.len() {
        let nodes = tree_query(target.saturating_sub(window), target);
        for &(source, level) in &nodes {
            if source == target {
                let own = store.get(&table_key(target, level))?;
                store.put(&sum_key(target), own)?;
                sum_weights.push(table[target][level]);
            } else {
                tasks.push(TableTask {
                    source,
                    target,
                    level,
                });
            }
        }
    }
    debug!(pass = direction.name, tasks = tasks.len(), "summing windows");

    for batch in tasks.chunks(session.batch_size()) {
        let styles = batch
            .iter()
            .map(|task| store.get(&table_key(task.source, task.level)))
            .collect::<Result<Vec<_>>>()?;
        let requests: Vec<RemapTask<'_>> = batch
            .iter()
            .zip(&styles)
            .map(|(task, style)| direction.remap_task(task, style))
            .collect();
        let remapped = session.remap(&requests, direction.name)?;

        for (task, frame) in batch.iter().zip(remapped) {
            let key = sum_key(task.target);
            let mut mean = RunningMean::new(store.get(&key)?, sum_weights[task.target]);
            mean.accumulate(&frame, table[task.source][task.level]);
            sum_weights[task.target] = mean.weight;
            store.put(&key, mean.value)?;
        }
    }
    Ok(sum_weights)
}
