//! Context window scheduling for motion modules
//!
//! A motion module attends over a fixed number of frames (its context). Longer
//! animations are denoised as a sequence of overlapping windows so that every
//! frame is seen by at least one window and neighbouring windows share frames.
//!
//! Key features:
//! - Defaults derived from the motion module (native window 16, hard cap 24 for
//!   v1 modules and 32 for v2)
//! - Overlap between consecutive windows, `context / 4` unless overridden
//! - Motion stride: extra dilated passes (frame spacing `2^level`) that give the
//!   motion module a longer temporal reach
//! - A short final window instead of padding past the end of the sequence

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read};
use std::ops::Range;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{GenerationError, Result};
use crate::frame::{FrameIndex, FrameSpace};

/// Window length motion modules are trained on
pub const NATIVE_CONTEXT: usize = 16;
/// Largest context a v1 motion module tolerates
pub const V1_MAX_CONTEXT: usize = 24;
/// Largest context a v2 motion module tolerates
pub const V2_MAX_CONTEXT: usize = 32;

/// Key prefix only present in v2 motion module checkpoints
const V2_MARKER_KEY: &str = "mid_block.motion_modules";
/// Refuse to read safetensors headers larger than this
const MAX_HEADER_LEN: u64 = 64 * 1024 * 1024;

// =============================================================================
// Motion Module
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotionModuleVersion {
    V1,
    #[default]
    V2,
}

impl MotionModuleVersion {
    pub fn max_context(self) -> usize {
        match self {
            Self::V1 => V1_MAX_CONTEXT,
            Self::V2 => V2_MAX_CONTEXT,
        }
    }

    pub fn native_context(self) -> usize {
        NATIVE_CONTEXT
    }

    /// Detect the module version from its safetensors header.
    ///
    /// Falls back to the file name when the header cannot be read (missing
    /// file, `.ckpt` pickles, truncated downloads).
    pub fn detect(path: &Path) -> Self {
        match read_safetensors_keys(path) {
            Ok(keys) => {
                if keys.iter().any(|k| k.starts_with(V2_MARKER_KEY)) {
                    Self::V2
                } else {
                    Self::V1
                }
            }
            Err(err) => {
                let guess = Self::from_file_name(path);
                warn!(
                    path = %path.display(),
                    error = %err,
                    version = ?guess,
                    "Could not read motion module header, guessing version from file name"
                );
                guess
            }
        }
    }

    /// `mm_sd_v15_v2.ckpt`, `v3_sd15_mm.ckpt` -> V2; anything else -> V1
    pub fn from_file_name(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.contains("v2") || name.contains("v3") {
            Self::V2
        } else {
            Self::V1
        }
    }
}

/// Read tensor names from a safetensors header: `u64` little-endian length
/// followed by a JSON object keyed by tensor name.
fn read_safetensors_keys(path: &Path) -> io::Result<Vec<String>> {
    let mut file = File::open(path)?;

    let mut len_buf = [0u8; 8];
    file.read_exact(&mut len_buf)?;
    let header_len = u64::from_le_bytes(len_buf);
    if header_len > MAX_HEADER_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("safetensors header of {header_len} bytes is too large"),
        ));
    }

    let mut header = vec![0u8; header_len as usize];
    file.read_exact(&mut header)?;
    let entries: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(&header).map_err(io::Error::other)?;

    Ok(entries
        .into_iter()
        .map(|(name, _)| name)
        .filter(|name| name != "__metadata__")
        .collect())
}

// =============================================================================
// Settings
// =============================================================================

/// User overrides; unset fields take motion-module defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextParams {
    #[serde(default)]
    pub context: Option<usize>,
    #[serde(default)]
    pub overlap: Option<usize>,
    /// Max motion stride as a power of two
    #[serde(default)]
    pub stride: Option<u32>,
}

/// Validated window parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContextSettings {
    pub context: usize,
    pub overlap: usize,
    pub stride: u32,
}

impl ContextParams {
    /// Fill defaults, clamp to the module cap and validate.
    pub fn resolve(&self, duration: usize, version: MotionModuleVersion) -> Result<ContextSettings> {
        let stride = self.stride.unwrap_or(0);
        let invalid = |reason, context, overlap| GenerationError::InvalidWindowConfig {
            reason,
            duration,
            context,
            overlap,
            stride: stride as usize,
        };

        if duration == 0 {
            return Err(invalid(
                "duration must be positive",
                self.context.unwrap_or(0),
                self.overlap.unwrap_or(0),
            ));
        }

        let mut context = self
            .context
            .unwrap_or_else(|| duration.min(version.native_context()));
        if context == 0 {
            return Err(invalid(
                "context must be positive",
                context,
                self.overlap.unwrap_or(0),
            ));
        }

        // The default overlap follows the requested context, not the clamped one
        let overlap = self.overlap.unwrap_or(context / 4);

        let cap = version.max_context();
        if context > cap {
            warn!(
                requested = context,
                cap,
                ?version,
                "Context exceeds what the motion module supports, clamping"
            );
            context = cap;
        }

        if overlap >= context {
            return Err(invalid("overlap must be smaller than context", context, overlap));
        }

        Ok(ContextSettings {
            context,
            overlap,
            stride,
        })
    }
}

// =============================================================================
// Windows
// =============================================================================

/// One denoising window over ascending frame indices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextWindow {
    ordinal: usize,
    frames: Vec<FrameIndex>,
    /// Spacing between consecutive frames (1 = contiguous)
    dilation: usize,
    /// Leading frames shared with the previous window of the same pass
    lead_overlap: usize,
    /// Trailing frames shared with the next window of the same pass
    tail_overlap: usize,
}

impl ContextWindow {
    /// A window holding a single frame, used for per-frame work such as upscaling.
    pub fn single(frame: FrameIndex) -> Self {
        Self {
            ordinal: frame.get(),
            frames: vec![frame],
            dilation: 1,
            lead_overlap: 0,
            tail_overlap: 0,
        }
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn frames(&self) -> &[FrameIndex] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn first(&self) -> FrameIndex {
        self.frames[0]
    }

    pub fn last(&self) -> FrameIndex {
        self.frames[self.frames.len() - 1]
    }

    pub fn dilation(&self) -> usize {
        self.dilation
    }

    pub fn lead_overlap(&self) -> usize {
        self.lead_overlap
    }

    pub fn tail_overlap(&self) -> usize {
        self.tail_overlap
    }

    /// Position of `frame` inside this window
    pub fn position(&self, frame: FrameIndex) -> Option<usize> {
        self.frames.binary_search(&frame).ok()
    }

    pub fn contains(&self, frame: FrameIndex) -> bool {
        self.position(frame).is_some()
    }
}

/// Split `0..len` into spans of at most `size` items where consecutive spans
/// share `overlap` items. The last span ends exactly at `len` and may be shorter.
///
/// Callers guarantee `size > 0` and `overlap < size`.
pub fn overlapping_spans(len: usize, size: usize, overlap: usize) -> Vec<Range<usize>> {
    debug_assert!(size > 0 && overlap < size);
    if len <= size {
        return vec![0..len];
    }

    let step = size - overlap;
    let mut spans = Vec::with_capacity(len.div_ceil(step));
    let mut start = 0;
    loop {
        let end = (start + size).min(len);
        spans.push(start..end);
        if end == len {
            break;
        }
        start += step;
    }
    spans
}

/// Ordered, immutable window partition for one generation run
#[derive(Debug, Clone)]
pub struct ContextSchedule {
    space: FrameSpace,
    settings: ContextSettings,
    windows: Vec<ContextWindow>,
}

impl ContextSchedule {
    pub fn new(space: FrameSpace, settings: ContextSettings) -> Result<Self> {
        let duration = space.duration();
        if settings.context == 0 || settings.overlap >= settings.context {
            return Err(GenerationError::InvalidWindowConfig {
                reason: "overlap must be smaller than a positive context",
                duration,
                context: settings.context,
                overlap: settings.overlap,
                stride: settings.stride as usize,
            });
        }

        let mut windows = Vec::new();
        let base: Vec<usize> = (0..duration).collect();
        push_partition(&mut windows, &base, &settings, 1);

        for level in 1..=settings.stride {
            let Some(dilation) = 1usize.checked_shl(level) else {
                break;
            };
            let fits = settings
                .context
                .checked_mul(dilation)
                .is_some_and(|span| span <= duration);
            if !fits {
                debug!(level, duration, context = settings.context, "Stride level does not fit, stopping");
                break;
            }
            for phase in 0..dilation {
                let sequence: Vec<usize> = (phase..duration).step_by(dilation).collect();
                push_partition(&mut windows, &sequence, &settings, dilation);
            }
        }

        debug!(
            duration,
            context = settings.context,
            overlap = settings.overlap,
            stride = settings.stride,
            windows = windows.len(),
            "Context schedule built"
        );

        Ok(Self {
            space,
            settings,
            windows,
        })
    }

    /// Resolve user overrides against the motion module and build the schedule.
    pub fn from_params(
        space: FrameSpace,
        params: &ContextParams,
        version: MotionModuleVersion,
    ) -> Result<Self> {
        let settings = params.resolve(space.duration(), version)?;
        Self::new(space, settings)
    }

    pub fn space(&self) -> FrameSpace {
        self.space
    }

    pub fn settings(&self) -> ContextSettings {
        self.settings
    }

    pub fn windows(&self) -> &[ContextWindow] {
        &self.windows
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Number of windows covering each frame
    pub fn coverage(&self) -> Vec<usize> {
        let mut counts = vec![0; self.space.duration()];
        for window in &self.windows {
            for frame in window.frames() {
                counts[frame.get()] += 1;
            }
        }
        counts
    }
}

fn push_partition(
    windows: &mut Vec<ContextWindow>,
    sequence: &[usize],
    settings: &ContextSettings,
    dilation: usize,
) {
    let spans = overlapping_spans(sequence.len(), settings.context, settings.overlap);
    for (i, span) in spans.iter().enumerate() {
        let lead_overlap = match i.checked_sub(1) {
            Some(prev) => spans[prev].end.saturating_sub(span.start),
            None => 0,
        };
        let tail_overlap = match spans.get(i + 1) {
            Some(next) => span.end.saturating_sub(next.start),
            None => 0,
        };
        windows.push(ContextWindow {
            ordinal: windows.len(),
            frames: sequence[span.clone()]
                .iter()
                .copied()
                .map(FrameIndex::new)
                .collect(),
            dilation,
            lead_overlap,
            tail_overlap,
        });
    }
}
