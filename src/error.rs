//! Error taxonomy for scheduling, resolution, alignment and generation.
//!
//! Configuration-shape errors (`InvalidWindowConfig`, `UnknownSignal`,
//! `EmptyPromptTimeline`, `Config`) are raised while a run is being planned.
//! `DenoisingFailure` aborts a run that is already in progress.

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error(
        "Invalid context window configuration: {reason} \
         (duration={duration}, context={context}, overlap={overlap}, stride={stride})"
    )]
    InvalidWindowConfig {
        reason: &'static str,
        duration: usize,
        context: usize,
        overlap: usize,
        stride: usize,
    },

    #[error("Frame index {index} is outside [0, {duration})")]
    IndexOutOfRange { index: usize, duration: usize },

    #[error("Unknown conditioning signal: {name}")]
    UnknownSignal { name: String },

    #[error("Prompt timeline has no keyframes inside [0, {duration})")]
    EmptyPromptTimeline { duration: usize },

    #[error("Frame {index} was not covered by any context window")]
    UncoveredFrame { index: usize },

    #[error("Denoising failed in window {window} (frames {first}..={last})")]
    DenoisingFailure {
        window: usize,
        first: usize,
        last: usize,
        #[source]
        source: candle_core::Error,
    },

    #[error("Denoiser returned {actual} frames for window {window} of {expected} frames")]
    MalformedDenoiserOutput {
        window: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Generation cancelled before window {window}")]
    Cancelled { window: usize },

    #[error("Upscale cancelled before frame {frame}")]
    UpscaleCancelled { frame: usize },

    #[error("Invalid upscale configuration: {0}")]
    InvalidUpscaleConfig(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T, E = GenerationError> = std::result::Result<T, E>;
