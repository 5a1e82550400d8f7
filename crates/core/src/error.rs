//! Error taxonomy shared by every stage of the fusion core.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

type BoxedSource = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum FuseError {
    /// Invalid window/stride/mode/capacity. Raised before any work starts.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Cache, checkpoint or intermediate read/write failure. Never retried.
    #[error("I/O error during {operation} ({}): {source}", path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// External inference engine, scheduler, codec or correspondence oracle
    /// failure. `frame` is `None` when the failing call covered the whole sequence.
    #[error("engine error{} during {context}: {source}", at_frame(.frame))]
    Engine {
        context: String,
        frame: Option<usize>,
        #[source]
        source: BoxedSource,
    },
}

pub type Result<T> = std::result::Result<T, FuseError>;

impl FuseError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn io(operation: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn engine(context: impl Into<String>, frame: usize, source: anyhow::Error) -> Self {
        Self::Engine {
            context: context.into(),
            frame: Some(frame),
            source: source.into(),
        }
    }

    /// Engine failure not tied to one frame, e.g. a scheduler step.
    pub fn sequence_engine(context: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Engine {
            context: context.into(),
            frame: None,
            source: source.into(),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    pub fn is_engine(&self) -> bool {
        matches!(self, Self::Engine { .. })
    }

    /// True for persisted data that exists but does not decode.
    pub fn is_corrupt_data(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::InvalidData)
    }

    /// Frame index attached to an engine failure.
    pub fn frame(&self) -> Option<usize> {
        match self {
            Self::Engine { frame, .. } => *frame,
            _ => None,
        }
    }
}

fn at_frame(frame: &Option<usize>) -> String {
    frame.map(|f| format!(" at frame {f}")).unwrap_or_default()
}
