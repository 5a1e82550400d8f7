//! Windowed fusion, caching, checkpointing and temporal blending for long
//! frame sequences.

pub mod blend;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod denoise;
pub mod error;
pub mod fusion;
pub mod logging;
pub mod tensor_io;
pub mod window;

pub use error::{FuseError, Result};
