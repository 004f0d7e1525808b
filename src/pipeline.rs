//! Window-by-window generation driver
//!
//! The driver walks a `ContextSchedule` in order, hands each window to the
//! denoising capability together with the window's resolved prompts and
//! aligned conditioning, and folds the window outputs into one frame sequence.
//!
//! # Architecture Overview
//!
//! ```text
//! ContextSchedule ──► window ──► PromptTimeline::resolve_window ─┐
//!                           └──► ConditioningAligner::align_window ┤
//!                                                                ▼
//!                                          Denoiser::denoise (ScratchGuard)
//!                                                                ▼
//!                                          FrameAccumulator ──► GenerationOutput
//! ```
//!
//! # Features
//!
//! - **Repeats**: independent runs with cyclic seeds and negative prompts
//! - **Fail fast**: a denoising failure aborts the run, no retries
//! - **Scratch scoping**: per-window scratch is released on every exit path
//! - **Cancellation**: checked at window boundaries
//! - **Progress callbacks** after each window
//! - **Pipeline cache**: reuse a loaded model across invocations

use candle_core::Tensor;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::blend::{FrameAccumulator, OverlapBlend};
use crate::conditioning::{AlignedSignal, ConditioningAligner};
use crate::config::RunSettings;
use crate::context::{ContextSchedule, ContextWindow};
use crate::error::{GenerationError, Result};
use crate::frame::FrameSpace;
use crate::output::OutputSink;
use crate::prompt::{PromptTimeline, ResolvedPrompt};
use crate::seed::SeedSchedule;

// =============================================================================
// Denoising capability
// =============================================================================

/// Everything the denoiser gets for one window
#[derive(Debug)]
pub struct DenoiseRequest<'a> {
    pub repeat: usize,
    pub window: &'a ContextWindow,
    /// One entry per window frame
    pub prompts: &'a [ResolvedPrompt],
    pub negative_prompt: &'a str,
    /// Active signals only, in name order, each aligned to the window frames
    pub conditioning: &'a [AlignedSignal],
    pub seed: u64,
    pub steps: usize,
    pub guidance_scale: f64,
    /// Text encoder layers to skip from the end
    pub clip_skip: usize,
    pub width: usize,
    pub height: usize,
}

/// The opaque "denoise one window" capability (diffusion model + VAE).
pub trait Denoiser {
    /// Returns one frame tensor per window frame, in window order.
    fn denoise(&mut self, request: &DenoiseRequest<'_>) -> candle_core::Result<Vec<Tensor>>;

    /// Drop transient per-window buffers (activations, attention caches).
    fn release_scratch(&mut self) {}
}

/// Scoped access to a denoiser; releases scratch memory when dropped.
pub struct ScratchGuard<'a, D: Denoiser + ?Sized> {
    denoiser: &'a mut D,
}

impl<'a, D: Denoiser + ?Sized> ScratchGuard<'a, D> {
    pub fn new(denoiser: &'a mut D) -> Self {
        Self { denoiser }
    }
}

impl<D: Denoiser + ?Sized> Deref for ScratchGuard<'_, D> {
    type Target = D;

    fn deref(&self) -> &D {
        self.denoiser
    }
}

impl<D: Denoiser + ?Sized> DerefMut for ScratchGuard<'_, D> {
    fn deref_mut(&mut self) -> &mut D {
        self.denoiser
    }
}

impl<D: Denoiser + ?Sized> Drop for ScratchGuard<'_, D> {
    fn drop(&mut self) {
        self.denoiser.release_scratch();
    }
}

// =============================================================================
// Control
// =============================================================================

/// Progress information, reported after every window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationProgress {
    pub repeat: usize,
    pub repeats: usize,
    /// Windows finished in this repeat
    pub window: usize,
    pub windows: usize,
}

/// Callback type for progress updates
pub type ProgressCallback = Box<dyn FnMut(GenerationProgress) + Send>;

/// Control handle for cancelling generation from another thread
#[derive(Debug, Clone, Default)]
pub struct GenerationControl {
    cancelled: Arc<AtomicBool>,
}

impl GenerationControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; honoured at the next window boundary
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Plan
// =============================================================================

/// Immutable snapshot of everything a run reads
#[derive(Debug, Clone)]
pub struct GenerationPlan {
    schedule: ContextSchedule,
    timeline: PromptTimeline,
    aligner: ConditioningAligner,
    negative_prompts: Vec<String>,
    seeds: SeedSchedule,
    repeats: usize,
    steps: usize,
    guidance_scale: f64,
    clip_skip: usize,
    width: usize,
    height: usize,
    blend: OverlapBlend,
}

impl GenerationPlan {
    /// All three components must share one frame space.
    pub fn new(
        schedule: ContextSchedule,
        timeline: PromptTimeline,
        aligner: ConditioningAligner,
    ) -> Result<Self> {
        let space = schedule.space();
        for other in [timeline.space(), aligner.space()] {
            if other != space {
                return Err(mismatched_space(space, other, &schedule));
            }
        }

        Ok(Self {
            schedule,
            timeline,
            aligner,
            negative_prompts: vec![String::new()],
            seeds: SeedSchedule::new(Vec::new()),
            repeats: 1,
            steps: 25,
            guidance_scale: 7.5,
            clip_skip: 1,
            width: 512,
            height: 512,
            blend: OverlapBlend::default(),
        })
    }

    /// Plan from validated settings plus loaded conditioning.
    pub fn from_settings(settings: &RunSettings, aligner: ConditioningAligner) -> Result<Self> {
        Ok(Self::new(settings.schedule.clone(), settings.timeline.clone(), aligner)?
            .with_negative_prompts(settings.negative_prompts.clone())
            .with_seeds(settings.seeds.clone())
            .with_repeats(settings.repeats)
            .with_steps(settings.steps)
            .with_guidance_scale(settings.guidance_scale)
            .with_clip_skip(settings.clip_skip)
            .with_size(settings.width, settings.height)
            .with_blend(settings.blend))
    }

    pub fn with_negative_prompts(mut self, prompts: Vec<String>) -> Self {
        if !prompts.is_empty() {
            self.negative_prompts = prompts;
        }
        self
    }

    pub fn with_seeds(mut self, seeds: SeedSchedule) -> Self {
        self.seeds = seeds;
        self
    }

    pub fn with_repeats(mut self, repeats: usize) -> Self {
        self.repeats = repeats.max(1);
        self
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_guidance_scale(mut self, scale: f64) -> Self {
        self.guidance_scale = scale;
        self
    }

    pub fn with_clip_skip(mut self, clip_skip: usize) -> Self {
        self.clip_skip = clip_skip;
        self
    }

    pub fn with_size(mut self, width: usize, height: usize) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_blend(mut self, blend: OverlapBlend) -> Self {
        self.blend = blend;
        self
    }

    pub fn space(&self) -> FrameSpace {
        self.schedule.space()
    }

    pub fn schedule(&self) -> &ContextSchedule {
        &self.schedule
    }

    pub fn timeline(&self) -> &PromptTimeline {
        &self.timeline
    }

    pub fn aligner(&self) -> &ConditioningAligner {
        &self.aligner
    }

    pub fn seeds(&self) -> &SeedSchedule {
        &self.seeds
    }

    pub fn repeats(&self) -> usize {
        self.repeats
    }

    pub fn blend(&self) -> OverlapBlend {
        self.blend
    }

    pub fn negative_prompt(&self, repeat: usize) -> &str {
        &self.negative_prompts[repeat % self.negative_prompts.len()]
    }
}

fn mismatched_space(
    expected: FrameSpace,
    actual: FrameSpace,
    schedule: &ContextSchedule,
) -> GenerationError {
    let settings = schedule.settings();
    GenerationError::InvalidWindowConfig {
        reason: "prompt timeline, conditioning and schedule cover different durations",
        duration: actual.duration().max(expected.duration()),
        context: settings.context,
        overlap: settings.overlap,
        stride: settings.stride as usize,
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Frames of one finished repeat
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub repeat: usize,
    /// Concrete seed used (never the random sentinel)
    pub seed: u64,
    pub negative_prompt: String,
    /// One tensor per frame, `[3, H, W]`, in frame order
    pub frames: Vec<Tensor>,
}

impl GenerationOutput {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

pub struct GenerationDriver<'a, D: Denoiser + ?Sized> {
    denoiser: &'a mut D,
    control: GenerationControl,
    progress: Option<ProgressCallback>,
}

impl<'a, D: Denoiser + ?Sized> GenerationDriver<'a, D> {
    pub fn new(denoiser: &'a mut D) -> Self {
        Self {
            denoiser,
            control: GenerationControl::new(),
            progress: None,
        }
    }

    pub fn with_control(mut self, control: GenerationControl) -> Self {
        self.control = control;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn control(&self) -> &GenerationControl {
        &self.control
    }

    /// Run one repeat with an already drawn seed.
    pub fn run_repeat_with_seed(
        &mut self,
        plan: &GenerationPlan,
        repeat: usize,
        seed: u64,
    ) -> Result<GenerationOutput> {
        let windows = plan.schedule.windows();
        let negative_prompt = plan.negative_prompt(repeat);
        let mut accumulator = FrameAccumulator::new(plan.space(), plan.blend);

        for (done, window) in windows.iter().enumerate() {
            if self.control.is_cancelled() {
                info!(repeat, window = window.ordinal(), "Generation cancelled");
                return Err(GenerationError::Cancelled {
                    window: window.ordinal(),
                });
            }

            let prompts = plan.timeline.resolve_window(window)?;
            let conditioning = plan.aligner.align_window(window)?;

            debug!(
                repeat,
                window = window.ordinal(),
                first = window.first().get(),
                last = window.last().get(),
                frames = window.len(),
                dilation = window.dilation(),
                signals = conditioning.len(),
                "Denoising window"
            );

            let request = DenoiseRequest {
                repeat,
                window,
                prompts: &prompts,
                negative_prompt,
                conditioning: &conditioning,
                seed,
                steps: plan.steps,
                guidance_scale: plan.guidance_scale,
                clip_skip: plan.clip_skip,
                width: plan.width,
                height: plan.height,
            };

            let frames = {
                let mut guard = ScratchGuard::new(&mut *self.denoiser);
                guard
                    .denoise(&request)
                    .map_err(|source| GenerationError::DenoisingFailure {
                        window: window.ordinal(),
                        first: window.first().get(),
                        last: window.last().get(),
                        source,
                    })?
            };
            accumulator.accumulate(window, &frames)?;

            if let Some(callback) = self.progress.as_mut() {
                callback(GenerationProgress {
                    repeat,
                    repeats: plan.repeats,
                    window: done + 1,
                    windows: windows.len(),
                });
            }
        }

        Ok(GenerationOutput {
            repeat,
            seed,
            negative_prompt: negative_prompt.to_string(),
            frames: accumulator.finish()?,
        })
    }

    /// Run one repeat, drawing its seed now.
    pub fn run_repeat(&mut self, plan: &GenerationPlan, repeat: usize) -> Result<GenerationOutput> {
        let spec = plan.seeds.spec_for(repeat);
        let seed = spec.draw();
        info!(
            repeat = repeat + 1,
            repeats = plan.repeats,
            seed,
            random = spec.is_random(),
            "Generation seed"
        );
        self.run_repeat_with_seed(plan, repeat, seed)
    }

    /// Run every repeat, handing each output to `sink` as it finishes.
    ///
    /// Returns the concrete seed of each repeat.
    pub fn run_into(&mut self, plan: &GenerationPlan, sink: &mut dyn OutputSink) -> Result<Vec<u64>> {
        let mut seeds = Vec::with_capacity(plan.repeats);
        for repeat in 0..plan.repeats {
            let output = self.run_repeat(plan, repeat)?;
            seeds.push(output.seed);
            sink.save(&output)?;
        }
        sink.finish()?;
        info!(repeats = plan.repeats, "Generation complete");
        Ok(seeds)
    }

    /// Run every repeat and collect the outputs.
    pub fn run(&mut self, plan: &GenerationPlan) -> Result<Vec<GenerationOutput>> {
        (0..plan.repeats)
            .map(|repeat| self.run_repeat(plan, repeat))
            .collect()
    }
}

// =============================================================================
// Pipeline cache
// =============================================================================

/// Holds the most recently loaded pipeline, keyed by resolved model path.
#[derive(Debug)]
pub struct PipelineCache<P> {
    entry: Option<(PathBuf, P)>,
}

impl<P> Default for PipelineCache<P> {
    fn default() -> Self {
        Self { entry: None }
    }
}

/// Canonical form of a model path; the path itself when it cannot be resolved.
pub fn resolve_model_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

impl<P> PipelineCache<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached pipeline for `path`, loading (and replacing any other
    /// cached pipeline) on a miss.
    pub fn get_or_load<E, F>(&mut self, path: &Path, load: F) -> std::result::Result<&mut P, E>
    where
        F: FnOnce(&Path) -> std::result::Result<P, E>,
    {
        let key = resolve_model_path(path);
        let entry = match self.entry.take().filter(|(cached, _)| *cached == key) {
            Some(entry) => {
                info!(path = %key.display(), "Pipeline already loaded, skipping initialization");
                entry
            }
            None => {
                info!(path = %key.display(), "Loading pipeline");
                let pipeline = load(&key)?;
                (key, pipeline)
            }
        };
        let (_, pipeline) = self.entry.insert(entry);
        Ok(pipeline)
    }

    pub fn loaded_path(&self) -> Option<&Path> {
        self.entry.as_ref().map(|(path, _)| path.as_path())
    }

    pub fn clear(&mut self) {
        self.entry = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_cancel_and_reset() {
        let control = GenerationControl::new();
        let other = control.clone();
        other.cancel();
        assert!(control.is_cancelled());
        control.reset();
        assert!(!other.is_cancelled());
    }

    #[test]
    fn test_cache_reuses_same_path() {
        let mut cache: PipelineCache<u32> = PipelineCache::new();
        let mut loads = 0;
        for _ in 0..3 {
            let value = cache
                .get_or_load(Path::new("models/a.safetensors"), |_| {
                    loads += 1;
                    Ok::<_, std::io::Error>(7)
                })
                .unwrap();
            assert_eq!(*value, 7);
        }
        assert_eq!(loads, 1);

        cache
            .get_or_load(Path::new("models/b.safetensors"), |_| Ok::<_, std::io::Error>(9))
            .unwrap();
        assert_eq!(cache.loaded_path(), Some(Path::new("models/b.safetensors")));
    }
}
