//! Log filters for the console and the rolling log file.
//!
//! Both sinks share one base filter, picked in order from an explicit filter,
//! `-v`/`-vv`, `RUST_LOG`, then `info`. Unless the user picked a filter, the
//! console additionally caps the stages that log per oracle batch or per cache
//! lookup, so a long blend does not flood the terminal. The file keeps
//! everything the base filter lets through.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

use crate::error::{FuseError, Result};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const LOG_DIR_NAME: &str = "logs";
pub const LOG_FILE_PREFIX: &str = "framefuse";
/// One file per day; older files are pruned.
pub const LOG_RETENTION_DAYS: usize = 14;

/// Pipeline stages, each logging under its own module target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Window,
    Fusion,
    Cache,
    Checkpoint,
    Blend,
    Denoise,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Window,
        Stage::Fusion,
        Stage::Cache,
        Stage::Checkpoint,
        Stage::Blend,
        Stage::Denoise,
    ];

    pub fn target(self) -> &'static str {
        match self {
            Stage::Window => "framefuse_core::window",
            Stage::Fusion => "framefuse_core::fusion",
            Stage::Cache => "framefuse_core::cache",
            Stage::Checkpoint => "framefuse_core::checkpoint",
            Stage::Blend => "framefuse_core::blend",
            Stage::Denoise => "framefuse_core::denoise",
        }
    }

    /// Emits debug/trace events per cache lookup or per oracle batch.
    pub fn is_per_item(self) -> bool {
        matches!(self, Stage::Cache | Stage::Blend)
    }
}

/// `target=level` directives for `stages`, comma-separated.
pub fn stage_directives(stages: impl IntoIterator<Item = Stage>, level: &str) -> String {
    stages
        .into_iter()
        .map(|stage| format!("{}={level}", stage.target()))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSettings {
    pub verbose: u8,
    pub explicit_filter: Option<String>,
    pub rust_log: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub console: String,
    pub file: String,
}

impl LogSettings {
    /// Reads `RUST_LOG` from the environment.
    pub fn from_env(verbose: u8, explicit_filter: Option<&str>) -> Self {
        Self {
            verbose,
            explicit_filter: explicit_filter.map(str::to_string),
            rust_log: std::env::var("RUST_LOG").ok(),
        }
    }

    pub fn base_filter(&self) -> String {
        if let Some(filter) = &self.explicit_filter {
            return filter.clone();
        }
        match self.verbose {
            0 => self
                .rust_log
                .clone()
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    }

    /// True when neither `--log-filter` nor `-v` was given.
    pub fn is_implicit(&self) -> bool {
        self.explicit_filter.is_none() && self.verbose == 0
    }

    pub fn filters(&self) -> LogFilters {
        let base = self.base_filter();
        let console = if self.is_implicit() {
            let capped = stage_directives(Stage::ALL.into_iter().filter(|s| s.is_per_item()), "info");
            format!("{capped},{base}")
        } else {
            base.clone()
        };
        LogFilters { console, file: base }
    }
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR_NAME)
}

/// Daily `{data_dir}/logs/framefuse.YYYY-MM-DD.log`.
pub fn open_log_file(data_dir: &Path) -> Result<RollingFileAppender> {
    let dir = log_dir(data_dir);
    fs::create_dir_all(&dir).map_err(|e| FuseError::io("create log directory", &dir, e))?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(LOG_RETENTION_DAYS)
        .build(&dir)
        .map_err(|e| FuseError::io("open log file", &dir, io::Error::new(io::ErrorKind::Other, e)))
}
