//! Step-granular resume support for long multi-step loops.
//!
//! Layout under the output directory:
//! - `latents`: the last completed step together with the state after it,
//!   written as one record so the pair can never disagree
//! - `last_process_id`: the same step as a plain integer, rewritten after
//!   `latents`; a run resumes only when it parses, but the step to resume
//!   after always comes from `latents`
//! - `completed`: final state, written when the loop finishes
//!
//! Every file is replaced via temp-file + rename.
//!
//! Snapshot record (little-endian): `b"FCK1"` | step: u64 | tensor (see [`crate::tensor_io`]).

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use ndarray::ArrayD;
use tracing::{debug, info, warn};

use crate::error::{FuseError, Result};
use crate::tensor_io::{decode_tensor, encode_tensor, read_tensor, write_atomic, write_tensor_atomic};

pub const MARKER_FILE_NAME: &str = "last_process_id";
pub const SNAPSHOT_FILE_NAME: &str = "latents";
pub const COMPLETED_FILE_NAME: &str = "completed";

const SNAPSHOT_MAGIC: &[u8; 4] = b"FCK1";
const SNAPSHOT_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStatus {
    NotStarted,
    Running { last_completed_step: usize },
    Complete,
}

/// A resumable point: skip every step `<= last_completed_step`.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointState {
    pub last_completed_step: usize,
    pub snapshot: ArrayD<f32>,
}

#[derive(Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    last_recorded: Option<usize>,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            last_recorded: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn marker_path(&self) -> PathBuf {
        self.dir.join(MARKER_FILE_NAME)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE_NAME)
    }

    pub fn completed_path(&self) -> PathBuf {
        self.dir.join(COMPLETED_FILE_NAME)
    }

    /// Persists `snapshot` as the state after `step`. Steps must not go backwards.
    ///
    /// The step and the state land in a single atomic write; the marker file is
    /// refreshed afterwards and may lag behind after a crash.
    pub fn record(&mut self, step: usize, snapshot: &ArrayD<f32>) -> Result<()> {
        if let Some(last) = self.last_recorded {
            if step < last {
                return Err(FuseError::config(format!(
                    "checkpoint step regressed from {last} to {step}; call clear() to restart"
                )));
            }
        }

        write_atomic(&self.snapshot_path(), &encode_snapshot(step, snapshot))?;
        write_atomic(&self.marker_path(), step.to_string().as_bytes())?;
        self.last_recorded = Some(step);
        debug!(step, dir = %self.dir.display(), "checkpoint recorded");
        Ok(())
    }

    /// Loads the last recorded state. A missing or unparseable marker, or a
    /// missing or undecodable snapshot, means "no checkpoint"; other I/O
    /// failures propagate. The step comes from the snapshot record, which can
    /// be one ahead of a marker whose rewrite was interrupted.
    pub fn resume(&mut self) -> Result<Option<CheckpointState>> {
        let Some(marker) = self.read_marker()? else {
            return Ok(None);
        };

        let snapshot_path = self.snapshot_path();
        let bytes = match fs::read(&snapshot_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(
                    marker,
                    path = %snapshot_path.display(),
                    "checkpoint marker has no snapshot; restarting from scratch"
                );
                return Ok(None);
            }
            Err(e) => return Err(FuseError::io("read checkpoint snapshot", &snapshot_path, e)),
        };

        let (step, snapshot) = match decode_snapshot(&bytes) {
            Ok(decoded) => decoded,
            Err(error) => {
                warn!(
                    path = %snapshot_path.display(),
                    %error,
                    "checkpoint snapshot is corrupt; restarting from scratch"
                );
                return Ok(None);
            }
        };
        if step != marker {
            warn!(marker, step, "checkpoint marker disagrees with snapshot; using the snapshot step");
        }

        self.last_recorded = Some(step);
        info!(step, dir = %self.dir.display(), "resuming from checkpoint");
        Ok(Some(CheckpointState {
            last_completed_step: step,
            snapshot,
        }))
    }

    /// Persists the final state and drops the in-flight marker and snapshot.
    pub fn complete(&mut self, final_state: &ArrayD<f32>) -> Result<()> {
        write_tensor_atomic(&self.completed_path(), final_state)?;
        remove_if_exists(&self.marker_path())?;
        remove_if_exists(&self.snapshot_path())?;
        self.last_recorded = None;
        info!(dir = %self.dir.display(), "checkpointed run complete");
        Ok(())
    }

    /// Final state of a completed run, if any.
    pub fn completed(&self) -> Result<Option<ArrayD<f32>>> {
        let path = self.completed_path();
        match read_tensor(&path) {
            Ok(state) => Ok(Some(state)),
            Err(FuseError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) if err.is_corrupt_data() => {
                warn!(error = %err, "completed state is corrupt; ignoring it");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Reads only the snapshot header, so it stays cheap for large states.
    pub fn status(&self) -> Result<CheckpointStatus> {
        if self.completed_path().is_file() {
            return Ok(CheckpointStatus::Complete);
        }
        if self.read_marker()?.is_none() {
            return Ok(CheckpointStatus::NotStarted);
        }
        Ok(match self.read_snapshot_step()? {
            Some(last_completed_step) => CheckpointStatus::Running {
                last_completed_step,
            },
            None => CheckpointStatus::NotStarted,
        })
    }

    /// Explicit restart: removes every checkpoint file.
    pub fn clear(&mut self) -> Result<()> {
        remove_if_exists(&self.marker_path())?;
        remove_if_exists(&self.snapshot_path())?;
        remove_if_exists(&self.completed_path())?;
        self.last_recorded = None;
        info!(dir = %self.dir.display(), "checkpoint cleared");
        Ok(())
    }

    fn read_snapshot_step(&self) -> Result<Option<usize>> {
        let path = self.snapshot_path();
        let mut header = [0u8; SNAPSHOT_HEADER_LEN];
        let read = fs::File::open(&path).and_then(|mut file| file.read_exact(&mut header));
        match read {
            Ok(()) => Ok(parse_snapshot_header(&header).ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(FuseError::io("read checkpoint snapshot", &path, e)),
        }
    }

    fn read_marker(&self) -> Result<Option<usize>> {
        let path = self.marker_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!(path = %path.display(), "checkpoint marker is not text; ignoring it");
                return Ok(None);
            }
            Err(e) => return Err(FuseError::io("read checkpoint marker", &path, e)),
        };

        match raw.trim().parse::<usize>() {
            Ok(step) => Ok(Some(step)),
            Err(error) => {
                warn!(
                    path = %path.display(),
                    content = %raw.trim(),
                    %error,
                    "checkpoint marker is unparseable; restarting from scratch"
                );
                Ok(None)
            }
        }
    }
}

fn encode_snapshot(step: usize, state: &ArrayD<f32>) -> Vec<u8> {
    let tensor = encode_tensor(state);
    let mut out = Vec::with_capacity(SNAPSHOT_HEADER_LEN + tensor.len());
    out.extend_from_slice(SNAPSHOT_MAGIC);
    out.extend_from_slice(&(step as u64).to_le_bytes());
    out.extend_from_slice(&tensor);
    out
}

fn parse_snapshot_header(header: &[u8]) -> io::Result<usize> {
    if header.len() < SNAPSHOT_HEADER_LEN || &header[..4] != SNAPSHOT_MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "missing checkpoint header"));
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&header[4..SNAPSHOT_HEADER_LEN]);
    usize::try_from(u64::from_le_bytes(raw))
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "checkpoint step overflows usize"))
}

fn decode_snapshot(bytes: &[u8]) -> io::Result<(usize, ArrayD<f32>)> {
    let step = parse_snapshot_header(bytes)?;
    let state = decode_tensor(&bytes[SNAPSHOT_HEADER_LEN..])?;
    Ok((step, state))
}

/// Runs `total_steps` steps with resume support.
///
/// A completed run returns its persisted final state without calling `step_fn`.
/// An interrupted run resumes after its last recorded step. A failing step
/// leaves the checkpoint untouched. Persisted state whose shape differs from
/// `initial` belongs to another run and is rejected.
pub struct CheckpointedLoop<'a> {
    checkpoint: &'a mut CheckpointManager,
}

impl<'a> CheckpointedLoop<'a> {
    pub fn new(checkpoint: &'a mut CheckpointManager) -> Self {
        Self { checkpoint }
    }

    pub fn run<F>(&mut self, total_steps: usize, initial: ArrayD<f32>, mut step_fn: F) -> Result<ArrayD<f32>>
    where
        F: FnMut(usize, ArrayD<f32>) -> Result<ArrayD<f32>>,
    {
        if let Some(done) = self.checkpoint.completed()? {
            self.ensure_same_shape("completed state", &done, &initial)?;
            info!("run already complete; returning persisted result");
            return Ok(done);
        }

        let (first_step, mut state) = match self.checkpoint.resume()? {
            Some(resumed) => {
                self.ensure_same_shape("snapshot", &resumed.snapshot, &initial)?;
                (resumed.last_completed_step + 1, resumed.snapshot)
            }
            None => (0, initial),
        };
        if first_step > 0 {
            info!(skipped = first_step, total_steps, "skipping completed steps");
        }

        for step in first_step..total_steps {
            state = step_fn(step, state)?;
            self.checkpoint.record(step, &state)?;
        }

        self.checkpoint.complete(&state)?;
        Ok(state)
    }

    fn ensure_same_shape(&self, what: &str, persisted: &ArrayD<f32>, initial: &ArrayD<f32>) -> Result<()> {
        if persisted.shape() == initial.shape() {
            return Ok(());
        }
        Err(FuseError::config(format!(
            "checkpoint {what} in {} has shape {:?} but the input has shape {:?}; clear the checkpoint to restart",
            self.checkpoint.dir().display(),
            persisted.shape(),
            initial.shape()
        )))
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FuseError::io("remove checkpoint file", path, e)),
    }
}
