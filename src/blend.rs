//! Merging window outputs into one frame sequence
//!
//! Each frame can be produced by several windows (consecutive windows overlap,
//! and stride passes revisit frames). The accumulator folds every window's
//! output into a per-frame slot according to an `OverlapBlend` policy.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::context::ContextWindow;
use crate::error::{GenerationError, Result};
use crate::frame::FrameSpace;

/// How frames shared between windows are merged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapBlend {
    /// Later window (in schedule order) replaces earlier output
    Overwrite,
    /// Normalized weighted average with linear ramps across overlaps
    #[default]
    Ramp,
}

/// Per-position weights of `window` under `policy`.
///
/// Ramp: a leading overlap of `k` frames rises `1/(k+1) .. k/(k+1)`, a trailing
/// overlap falls symmetrically, everything else is 1. Two windows sharing `k`
/// frames therefore sum to exactly 1 on every shared frame.
pub fn window_weights(window: &ContextWindow, policy: OverlapBlend) -> Vec<f64> {
    let len = window.len();
    match policy {
        OverlapBlend::Overwrite => vec![1.0; len],
        OverlapBlend::Ramp => ramp_weights(len, window.lead_overlap(), window.tail_overlap()),
    }
}

/// Linear ramp over `len` positions rising across the first `lead` and falling
/// across the last `tail`.
pub fn ramp_weights(len: usize, lead: usize, tail: usize) -> Vec<f64> {
    (0..len)
        .map(|i| {
            let rise = if i < lead {
                (i + 1) as f64 / (lead + 1) as f64
            } else {
                1.0
            };
            let fall = if i + tail >= len {
                (len - i) as f64 / (tail + 1) as f64
            } else {
                1.0
            };
            rise.min(fall)
        })
        .collect()
}

#[derive(Debug)]
struct Slot {
    sum: Tensor,
    weight: f64,
}

/// Collects window outputs until every frame has been produced
#[derive(Debug)]
pub struct FrameAccumulator {
    policy: OverlapBlend,
    slots: Vec<Option<Slot>>,
}

impl FrameAccumulator {
    pub fn new(space: FrameSpace, policy: OverlapBlend) -> Self {
        Self {
            policy,
            slots: (0..space.duration()).map(|_| None).collect(),
        }
    }

    pub fn policy(&self) -> OverlapBlend {
        self.policy
    }

    /// Fold one window's output (one tensor per window frame, in window order).
    pub fn accumulate(&mut self, window: &ContextWindow, frames: &[Tensor]) -> Result<()> {
        if frames.len() != window.len() {
            return Err(GenerationError::MalformedDenoiserOutput {
                window: window.ordinal(),
                expected: window.len(),
                actual: frames.len(),
            });
        }

        let weights = window_weights(window, self.policy);
        for ((frame, tensor), weight) in window.frames().iter().zip(frames).zip(weights) {
            let Some(slot) = self.slots.get_mut(frame.get()) else {
                return Err(GenerationError::IndexOutOfRange {
                    index: frame.get(),
                    duration: self.slots.len(),
                });
            };
            *slot = Some(match (self.policy, slot.take()) {
                (OverlapBlend::Ramp, Some(prev)) => Slot {
                    sum: prev.sum.add(&tensor.affine(weight, 0.0)?)?,
                    weight: prev.weight + weight,
                },
                (OverlapBlend::Ramp, None) => Slot {
                    sum: tensor.affine(weight, 0.0)?,
                    weight,
                },
                (OverlapBlend::Overwrite, _) => Slot {
                    sum: tensor.clone(),
                    weight: 1.0,
                },
            });
        }
        Ok(())
    }

    /// Number of frames produced so far
    pub fn covered(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Normalize and return the frames in index order.
    pub fn finish(self) -> Result<Vec<Tensor>> {
        self.slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                let slot = slot.ok_or(GenerationError::UncoveredFrame { index })?;
                if slot.weight == 1.0 {
                    Ok(slot.sum)
                } else {
                    Ok(slot.sum.affine(1.0 / slot.weight, 0.0)?)
                }
            })
            .collect()
    }
}
