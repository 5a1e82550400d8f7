//! Overlapping frame windows and their triangular contribution weights.

use std::fmt;

use crate::error::{FuseError, Result};

/// Floor applied to every triangular weight so each window a frame belongs to
/// contributes something.
pub const WEIGHT_EPSILON: f64 = 1e-2;

/// Half-open frame range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    pub start: usize,
    pub end: usize,
}

impl Window {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, index: usize) -> bool {
        index >= self.start && index < self.end
    }

    pub fn indices(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }

    /// Weight of frame `index` inside this window.
    pub fn weight(&self, index: usize) -> f64 {
        weight(index, self.start, self.end)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Lazy window sequence. [`WindowPlan::iter`] restarts it from frame 0.
#[derive(Debug, Clone)]
pub struct Windows {
    total_frames: usize,
    window_size: usize,
    stride: usize,
    next_start: usize,
    done: bool,
}

impl Iterator for Windows {
    type Item = Window;

    fn next(&mut self) -> Option<Window> {
        if self.done || self.next_start >= self.total_frames {
            self.done = true;
            return None;
        }

        let start = self.next_start;
        let end = (start + self.window_size).min(self.total_frames);
        if end == self.total_frames {
            self.done = true;
        }
        self.next_start += self.stride;
        Some(Window { start, end })
    }
}

impl std::iter::FusedIterator for Windows {}

/// Validated `(total_frames, window_size, stride)` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPlan {
    total_frames: usize,
    window_size: usize,
    stride: usize,
}

impl WindowPlan {
    pub fn new(total_frames: usize, window_size: usize, stride: usize) -> Result<Self> {
        validate_window_params(window_size, stride)?;
        Ok(Self {
            total_frames,
            window_size,
            stride,
        })
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn iter(&self) -> Windows {
        Windows {
            total_frames: self.total_frames,
            window_size: self.window_size,
            stride: self.stride,
            next_start: 0,
            done: false,
        }
    }
}

impl IntoIterator for &WindowPlan {
    type Item = Window;
    type IntoIter = Windows;

    fn into_iter(self) -> Windows {
        self.iter()
    }
}

/// Windows starting at 0 and advancing by `stride`, stopping after the first
/// window that reaches `total_frames`.
pub fn windows(total_frames: usize, window_size: usize, stride: usize) -> Result<Windows> {
    Ok(WindowPlan::new(total_frames, window_size, stride)?.iter())
}

pub fn validate_window_params(window_size: usize, stride: usize) -> Result<()> {
    if window_size == 0 {
        return Err(FuseError::config("window_size must be at least 1"));
    }
    if stride == 0 {
        return Err(FuseError::config("stride must be at least 1"));
    }
    if stride > window_size {
        return Err(FuseError::config(format!(
            "stride ({stride}) must not exceed window_size ({window_size}); frames would be skipped"
        )));
    }
    Ok(())
}

/// Triangular weight peaking at the window center, floored at [`WEIGHT_EPSILON`].
pub fn weight(index: usize, start: usize, end: usize) -> f64 {
    let center = (start + end) as f64 / 2.0 - 0.5;
    let half_width = ((end - start) as f64 - 1.0 + WEIGHT_EPSILON) / 2.0;
    let distance = (index as f64 - center).abs();
    (1.0 - distance / half_width).max(WEIGHT_EPSILON)
}
