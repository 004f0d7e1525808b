//! Per-frame conditioning alignment
//!
//! ControlNet maps, reference images and IP-Adapter images are all handled as
//! one `ConditioningSignal` shape: a name, an enable flag, and either a single
//! tensor broadcast to every frame or a sparse `frame -> tensor` map.
//!
//! For a context window the aligner returns, per active signal, one entry per
//! window frame in ascending frame order, so signals can be zipped positionally.
//! Frames without data are marked `Absent`; disabled or empty signals are left
//! out entirely.

use candle_core::Tensor;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::context::ContextWindow;
use crate::error::{GenerationError, Result};
use crate::frame::{FrameIndex, FrameSpace};

/// ControlNet signal names understood in `controlnet_map` / `upscale_config`
pub const CONTROLNET_SIGNALS: &[&str] = &[
    "controlnet_tile",
    "controlnet_lineart_anime",
    "controlnet_ip2p",
    "controlnet_openpose",
    "controlnet_softedge",
    "controlnet_shuffle",
    "controlnet_depth",
    "controlnet_canny",
    "controlnet_inpaint",
    "controlnet_lineart",
    "controlnet_mlsd",
    "controlnet_normalbae",
    "controlnet_scribble",
    "controlnet_seg",
    "controlnet_mediapipe_face",
    "qr_code_monster_v1",
    "qr_code_monster_v2",
    "animatediff_controlnet",
];
/// Reference-only ControlNet (one image for the whole animation)
pub const REFERENCE_SIGNAL: &str = "controlnet_ref";
pub const IP_ADAPTER_SIGNAL: &str = "ip_adapter";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    ControlNet,
    Reference,
    IpAdapter,
}

impl SignalKind {
    /// Kind of a registered signal name, `None` for unknown names
    pub fn for_name(name: &str) -> Option<Self> {
        match name {
            REFERENCE_SIGNAL => Some(Self::Reference),
            IP_ADAPTER_SIGNAL => Some(Self::IpAdapter),
            _ if CONTROLNET_SIGNALS.contains(&name) => Some(Self::ControlNet),
            _ => None,
        }
    }

    /// Whether a single entry means "same image for every frame"
    pub fn broadcasts(self) -> bool {
        matches!(self, Self::Reference | Self::IpAdapter)
    }
}

#[derive(Debug, Clone)]
pub enum SignalSource {
    Constant(Tensor),
    Sparse(BTreeMap<FrameIndex, Tensor>),
}

impl SignalSource {
    pub fn bound_frames(&self) -> usize {
        match self {
            Self::Constant(_) => 1,
            Self::Sparse(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bound_frames() == 0
    }
}

/// Strength schedule handed to the denoiser with each aligned signal
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalParams {
    /// `controlnet_conditioning_scale` / IP-Adapter `scale`
    pub scale: f64,
    /// Fraction of denoising steps where the signal starts applying
    pub guidance_start: f64,
    /// Fraction of denoising steps where the signal stops applying
    pub guidance_end: f64,
    pub guess_mode: bool,
    /// Scale multipliers for frames borrowing a neighbour's entry, by distance
    pub scale_list: Vec<f64>,
}

impl Default for SignalParams {
    fn default() -> Self {
        Self {
            scale: 1.0,
            guidance_start: 0.0,
            guidance_end: 1.0,
            guess_mode: false,
            scale_list: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConditioningSignal {
    name: String,
    kind: SignalKind,
    enabled: bool,
    source: SignalSource,
    params: SignalParams,
}

impl ConditioningSignal {
    pub fn new(name: impl Into<String>, kind: SignalKind, source: SignalSource) -> Self {
        Self {
            name: name.into(),
            kind,
            enabled: true,
            source,
            params: SignalParams::default(),
        }
    }

    /// Build from loaded frames. Broadcasting kinds with exactly one frame
    /// become a constant signal.
    pub fn from_frames(
        name: impl Into<String>,
        kind: SignalKind,
        mut frames: BTreeMap<FrameIndex, Tensor>,
    ) -> Self {
        let source = if kind.broadcasts() && frames.len() == 1 {
            match frames.pop_first() {
                Some((_, tensor)) => SignalSource::Constant(tensor),
                None => SignalSource::Sparse(frames),
            }
        } else {
            SignalSource::Sparse(frames)
        };
        Self::new(name, kind, source)
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_params(mut self, params: SignalParams) -> Self {
        self.params = params;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enabled and bound to at least one frame
    pub fn is_active(&self) -> bool {
        self.enabled && !self.source.is_empty()
    }

    pub fn source(&self) -> &SignalSource {
        &self.source
    }

    pub fn params(&self) -> &SignalParams {
        &self.params
    }

    fn condition_at(&self, frame: FrameIndex) -> FrameCondition {
        match &self.source {
            SignalSource::Constant(tensor) => FrameCondition::Present {
                tensor: tensor.clone(),
                scale: self.params.scale,
            },
            SignalSource::Sparse(entries) => {
                if let Some(tensor) = entries.get(&frame) {
                    return FrameCondition::Present {
                        tensor: tensor.clone(),
                        scale: self.params.scale,
                    };
                }
                self.borrowed_at(entries, frame)
                    .unwrap_or(FrameCondition::Absent)
            }
        }
    }

    /// Nearest entry within `scale_list.len()` frames; ties go to the earlier frame.
    fn borrowed_at(
        &self,
        entries: &BTreeMap<FrameIndex, Tensor>,
        frame: FrameIndex,
    ) -> Option<FrameCondition> {
        let reach = self.params.scale_list.len();
        if reach == 0 {
            return None;
        }

        let before = entries.range(..frame).next_back();
        let after = entries.range(frame..).next();
        let (source, tensor) = match (before, after) {
            (Some(b), Some(a)) => {
                if frame.distance(*b.0) <= frame.distance(*a.0) {
                    b
                } else {
                    a
                }
            }
            (Some(b), None) => b,
            (None, Some(a)) => a,
            (None, None) => return None,
        };

        let distance = frame.distance(*source);
        if distance == 0 || distance > reach {
            return None;
        }
        Some(FrameCondition::Present {
            tensor: tensor.clone(),
            scale: self.params.scale * self.params.scale_list[distance - 1],
        })
    }
}

/// One frame's view of one signal
#[derive(Debug, Clone)]
pub enum FrameCondition {
    Present { tensor: Tensor, scale: f64 },
    Absent,
}

impl FrameCondition {
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present { .. })
    }

    pub fn tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Present { tensor, .. } => Some(tensor),
            Self::Absent => None,
        }
    }

    pub fn scale(&self) -> Option<f64> {
        match self {
            Self::Present { scale, .. } => Some(*scale),
            Self::Absent => None,
        }
    }
}

/// A signal aligned 1:1 with a window's frames
#[derive(Debug, Clone)]
pub struct AlignedSignal {
    pub name: String,
    pub kind: SignalKind,
    pub params: SignalParams,
    /// Source was a single tensor broadcast to every frame
    pub broadcast: bool,
    pub frames: Vec<FrameIndex>,
    pub entries: Vec<FrameCondition>,
}

impl AlignedSignal {
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_present()).count()
    }
}

/// Registry of the signals of one run
#[derive(Debug, Clone)]
pub struct ConditioningAligner {
    space: FrameSpace,
    signals: BTreeMap<String, ConditioningSignal>,
}

impl ConditioningAligner {
    pub fn new(space: FrameSpace) -> Self {
        Self {
            space,
            signals: BTreeMap::new(),
        }
    }

    pub fn space(&self) -> FrameSpace {
        self.space
    }

    /// Register a signal, replacing any previous signal of the same name.
    ///
    /// Sparse entries past the end of the frame space are rejected.
    pub fn register(&mut self, signal: ConditioningSignal) -> Result<()> {
        if let SignalSource::Sparse(entries) = &signal.source {
            if let Some((&frame, _)) = entries.last_key_value() {
                self.space.check(frame)?;
            }
        }
        self.signals.insert(signal.name.clone(), signal);
        Ok(())
    }

    pub fn signal(&self, name: &str) -> Result<&ConditioningSignal> {
        self.signals
            .get(name)
            .ok_or_else(|| GenerationError::UnknownSignal {
                name: name.to_string(),
            })
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<()> {
        let signal = self
            .signals
            .get_mut(name)
            .ok_or_else(|| GenerationError::UnknownSignal {
                name: name.to_string(),
            })?;
        signal.enabled = enabled;
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.signals.keys().map(String::as_str)
    }

    pub fn active_names(&self) -> impl Iterator<Item = &str> {
        self.signals
            .values()
            .filter(|s| s.is_active())
            .map(|s| s.name.as_str())
    }

    /// Align one signal to `frames` (ascending). `None` when the signal is
    /// disabled or has no data.
    pub fn align_frames(&self, frames: &[FrameIndex], name: &str) -> Result<Option<AlignedSignal>> {
        let signal = self.signal(name)?;
        if !signal.is_active() {
            return Ok(None);
        }

        let entries = frames
            .iter()
            .map(|&frame| {
                self.space.check(frame)?;
                Ok(signal.condition_at(frame))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(AlignedSignal {
            name: signal.name.clone(),
            kind: signal.kind,
            params: signal.params.clone(),
            broadcast: matches!(signal.source, SignalSource::Constant(_)),
            frames: frames.to_vec(),
            entries,
        }))
    }

    pub fn align(&self, window: &ContextWindow, name: &str) -> Result<Option<AlignedSignal>> {
        self.align_frames(window.frames(), name)
    }

    /// Every active signal aligned to `window`, in name order.
    pub fn align_window(&self, window: &ContextWindow) -> Result<Vec<AlignedSignal>> {
        let mut aligned = Vec::new();
        for name in self.signals.keys() {
            if let Some(signal) = self.align(window, name)? {
                aligned.push(signal);
            }
        }
        Ok(aligned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_for_name() {
        assert_eq!(
            SignalKind::for_name("controlnet_openpose"),
            Some(SignalKind::ControlNet)
        );
        assert_eq!(SignalKind::for_name("controlnet_ref"), Some(SignalKind::Reference));
        assert_eq!(SignalKind::for_name("ip_adapter"), Some(SignalKind::IpAdapter));
        assert_eq!(SignalKind::for_name("controlnet_bogus"), None);
    }

    #[test]
    fn test_single_reference_frame_becomes_constant() -> candle_core::Result<()> {
        let t = Tensor::zeros((3, 2, 2), candle_core::DType::F32, &candle_core::Device::Cpu)?;
        let signal = ConditioningSignal::from_frames(
            REFERENCE_SIGNAL,
            SignalKind::Reference,
            BTreeMap::from([(FrameIndex::new(5), t)]),
        );
        assert!(matches!(signal.source(), SignalSource::Constant(_)));
        Ok(())
    }
}
