//! Candle-Animate: context-windowed text-to-video orchestration.
//!
//! This crate schedules AnimateDiff-style generation around an opaque
//! denoising backend: it partitions long frame sequences into overlapping
//! motion-module windows, resolves keyframed prompts per frame, aligns
//! ControlNet / IP-Adapter conditioning to each window, drives the backend
//! window by window and merges the results. It also tiles previously
//! generated frames for upscaling.

pub mod blend;
pub mod conditioning;
pub mod config;
pub mod context;
pub mod error;
pub mod frame;
pub mod input_image;
pub mod lora;
pub mod media;
pub mod mock;
pub mod output;
pub mod pipeline;
pub mod prompt;
pub mod seed;
pub mod upscale;
pub mod utils;

pub use blend::OverlapBlend;
pub use conditioning::{ConditioningAligner, ConditioningSignal, SignalKind, SignalSource};
pub use config::{ConfigError, GenerateRequest, PromptConfig, RunSettings};
pub use context::{ContextParams, ContextSchedule, ContextSettings, ContextWindow, MotionModuleVersion};
pub use error::{GenerationError, Result};
pub use frame::{FrameIndex, FrameSpace};
pub use pipeline::{Denoiser, GenerationControl, GenerationDriver, GenerationOutput, GenerationPlan};
pub use prompt::{PromptTimeline, ResolvedPrompt};
pub use seed::{SeedSchedule, SeedSpec};
