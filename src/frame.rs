//! Frame index space shared by every scheduling component.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{GenerationError, Result};

/// Position of a frame in the generated sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameIndex(usize);

impl FrameIndex {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn get(self) -> usize {
        self.0
    }

    /// Absolute distance between two frames
    pub fn distance(self, other: FrameIndex) -> usize {
        self.0.abs_diff(other.0)
    }
}

impl From<usize> for FrameIndex {
    fn from(index: usize) -> Self {
        Self(index)
    }
}

impl fmt::Display for FrameIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The range `[0, duration)` a generation run is defined over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpace {
    duration: usize,
}

impl FrameSpace {
    /// Create a frame space; `duration` must be positive.
    pub fn new(duration: usize) -> Result<Self> {
        if duration == 0 {
            return Err(GenerationError::InvalidWindowConfig {
                reason: "duration must be positive",
                duration,
                context: 0,
                overlap: 0,
                stride: 0,
            });
        }
        Ok(Self { duration })
    }

    pub fn duration(&self) -> usize {
        self.duration
    }

    pub fn contains(&self, frame: FrameIndex) -> bool {
        frame.0 < self.duration
    }

    /// Reject frames outside the space.
    pub fn check(&self, frame: FrameIndex) -> Result<FrameIndex> {
        if self.contains(frame) {
            Ok(frame)
        } else {
            Err(GenerationError::IndexOutOfRange {
                index: frame.0,
                duration: self.duration,
            })
        }
    }

    pub fn frames(&self) -> impl Iterator<Item = FrameIndex> + '_ {
        (0..self.duration).map(FrameIndex)
    }

    pub fn last(&self) -> FrameIndex {
        FrameIndex(self.duration - 1)
    }
}
