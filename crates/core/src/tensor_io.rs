//! On-disk tensor snapshots and PNG emission.
//!
//! Snapshot layout (little-endian):
//! `b"FFT1"` | rank: u32 | dims: rank × u64 | payload: product(dims) × f32

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use ndarray::{Array3, ArrayD, IxDyn};
use tempfile::NamedTempFile;

use crate::error::{FuseError, Result};

const MAGIC: &[u8; 4] = b"FFT1";
const MAX_RANK: usize = 8;

pub fn encode_tensor(tensor: &ArrayD<f32>) -> Vec<u8> {
    let shape = tensor.shape();
    let mut out = Vec::with_capacity(8 + shape.len() * 8 + tensor.len() * 4);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(shape.len() as u32).to_le_bytes());
    for &dim in shape {
        out.extend_from_slice(&(dim as u64).to_le_bytes());
    }
    for value in tensor.iter() {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub fn decode_tensor(bytes: &[u8]) -> io::Result<ArrayD<f32>> {
    if bytes.len() < 8 || &bytes[..4] != MAGIC {
        return Err(invalid("missing tensor header"));
    }
    let rank = u32::from_le_bytes(bytes[4..8].try_into().map_err(|_| invalid("bad rank"))?) as usize;
    if rank > MAX_RANK {
        return Err(invalid(format!("tensor rank {rank} exceeds {MAX_RANK}")));
    }

    let dims_end = 8 + rank * 8;
    if bytes.len() < dims_end {
        return Err(invalid("truncated tensor dims"));
    }
    let mut shape = Vec::with_capacity(rank);
    let mut count: usize = 1;
    for chunk in bytes[8..dims_end].chunks_exact(8) {
        let dim = u64::from_le_bytes(chunk.try_into().map_err(|_| invalid("bad dim"))?);
        let dim = usize::try_from(dim).map_err(|_| invalid("dim overflows usize"))?;
        count = count
            .checked_mul(dim)
            .ok_or_else(|| invalid("tensor element count overflows"))?;
        shape.push(dim);
    }

    let payload = &bytes[dims_end..];
    if payload.len() != count * 4 {
        return Err(invalid(format!(
            "tensor payload length mismatch: expected {} bytes, got {}",
            count * 4,
            payload.len()
        )));
    }
    let data: Vec<f32> = payload
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|e| invalid(e.to_string()))
}

pub fn read_tensor(path: &Path) -> Result<ArrayD<f32>> {
    let bytes = fs::read(path).map_err(|e| FuseError::io("read tensor", path, e))?;
    decode_tensor(&bytes).map_err(|e| FuseError::io("decode tensor", path, e))
}

/// Plain write; used for regenerable cache files.
pub fn write_tensor(path: &Path, tensor: &ArrayD<f32>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| FuseError::io("create directory", parent, e))?;
    }
    fs::write(path, encode_tensor(tensor)).map_err(|e| FuseError::io("write tensor", path, e))
}

/// Temp-file write followed by fsync and rename into place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| FuseError::io("create directory", parent, e))?;

    let mut tmp =
        NamedTempFile::new_in(parent).map_err(|e| FuseError::io("create temp file", parent, e))?;
    tmp.write_all(bytes)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| FuseError::io("write temp file", tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| FuseError::io("rename temp file", path, e.error))?;
    Ok(())
}

pub fn write_tensor_atomic(path: &Path, tensor: &ArrayD<f32>) -> Result<()> {
    write_atomic(path, &encode_tensor(tensor))
}

/// Save an HWC `u8` frame as PNG. Supports 1, 3 and 4 channels.
pub fn save_png(path: &Path, frame: &Array3<u8>) -> Result<()> {
    let (height, width, channels) = frame.dim();
    let color = match channels {
        1 => image::ColorType::L8,
        3 => image::ColorType::Rgb8,
        4 => image::ColorType::Rgba8,
        other => {
            return Err(FuseError::config(format!(
                "cannot save {other}-channel frame as PNG: {}",
                path.display()
            )))
        }
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| FuseError::io("create directory", parent, e))?;
    }

    let standard = frame.as_standard_layout();
    let data = standard
        .as_slice()
        .ok_or_else(|| FuseError::config("frame buffer is not contiguous"))?;
    image::save_buffer(path, data, width as u32, height as u32, color)
        .map_err(|e| FuseError::io("write png", path, io::Error::new(io::ErrorKind::Other, e)))
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}
