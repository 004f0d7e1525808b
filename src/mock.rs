//! Deterministic stand-ins for the model backend
//!
//! `MockDenoiser` and `MockUpscaler` need no weights. Their output depends
//! only on the seed and the frame index, so the same frame rendered by two
//! different windows is identical. They record every call for inspection and
//! can be told to fail at a given window.

use candle_core::{Device, Tensor};

use crate::context::ContextWindow;
use crate::pipeline::{DenoiseRequest, Denoiser};
use crate::upscale::{TileRequest, Upscaler};
use crate::utils::deterministic_rng::Pcg32;

/// What one `denoise` call received
#[derive(Debug, Clone, PartialEq)]
pub struct DenoiseCall {
    pub repeat: usize,
    pub window: usize,
    pub frames: Vec<usize>,
    pub prompts: Vec<String>,
    pub negative_prompt: String,
    /// Names of the signals passed, in order
    pub signals: Vec<String>,
    /// Present entries per signal, in the same order
    pub present: Vec<usize>,
    pub seed: u64,
    pub clip_skip: usize,
}

#[derive(Debug)]
pub struct MockDenoiser {
    device: Device,
    width: Option<usize>,
    height: Option<usize>,
    window_offset: f32,
    fail_on_window: Option<usize>,
    calls: Vec<DenoiseCall>,
    scratch_releases: usize,
}

impl MockDenoiser {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            width: None,
            height: None,
            window_offset: 0.0,
            fail_on_window: None,
            calls: Vec::new(),
            scratch_releases: 0,
        }
    }

    /// Render frames at this size instead of the requested one
    pub fn with_frame_size(mut self, width: usize, height: usize) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    /// Add `offset * window ordinal` to every frame, making the source window visible
    pub fn with_window_offset(mut self, offset: f32) -> Self {
        self.window_offset = offset;
        self
    }

    /// Report a failure when asked to denoise this window ordinal
    pub fn failing_on_window(mut self, window: usize) -> Self {
        self.fail_on_window = Some(window);
        self
    }

    pub fn calls(&self) -> &[DenoiseCall] {
        &self.calls
    }

    pub fn scratch_releases(&self) -> usize {
        self.scratch_releases
    }

    /// Expected value of `frame` for `seed` with no window offset
    pub fn render_frame(&self, seed: u64, frame: usize, width: usize, height: usize) -> candle_core::Result<Tensor> {
        Pcg32::for_frame(seed, frame).uniform((3, height, width), &self.device)
    }

    fn record(&mut self, request: &DenoiseRequest<'_>) {
        self.calls.push(DenoiseCall {
            repeat: request.repeat,
            window: request.window.ordinal(),
            frames: request.window.frames().iter().map(|f| f.get()).collect(),
            prompts: request.prompts.iter().map(|p| p.text.to_string()).collect(),
            negative_prompt: request.negative_prompt.to_string(),
            signals: request.conditioning.iter().map(|s| s.name.clone()).collect(),
            present: request
                .conditioning
                .iter()
                .map(|s| s.present_count())
                .collect(),
            seed: request.seed,
            clip_skip: request.clip_skip,
        });
    }
}

impl Denoiser for MockDenoiser {
    fn denoise(&mut self, request: &DenoiseRequest<'_>) -> candle_core::Result<Vec<Tensor>> {
        self.record(request);
        let window: &ContextWindow = request.window;
        if self.fail_on_window == Some(window.ordinal()) {
            candle_core::bail!("MockDenoiser: out of memory in window {}", window.ordinal());
        }

        let width = self.width.unwrap_or(request.width);
        let height = self.height.unwrap_or(request.height);
        let offset = (self.window_offset * window.ordinal() as f32) as f64;
        window
            .frames()
            .iter()
            .map(|frame| {
                self.render_frame(request.seed, frame.get(), width, height)?
                    .affine(1.0, offset)
            })
            .collect()
    }

    fn release_scratch(&mut self) {
        self.scratch_releases += 1;
    }
}

/// What one `refine` call received
#[derive(Debug, Clone, PartialEq)]
pub struct TileCall {
    pub frame: usize,
    pub x: std::ops::Range<usize>,
    pub y: std::ops::Range<usize>,
    pub prompt: String,
    pub signals: Vec<String>,
    pub seed: u64,
    pub clip_skip: usize,
}

/// Returns each tile unchanged (optionally shifted by a constant)
#[derive(Debug, Default)]
pub struct MockUpscaler {
    shift: f64,
    fail_on_frame: Option<usize>,
    calls: Vec<TileCall>,
    scratch_releases: usize,
}

impl MockUpscaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shift(mut self, shift: f64) -> Self {
        self.shift = shift;
        self
    }

    pub fn failing_on_frame(mut self, frame: usize) -> Self {
        self.fail_on_frame = Some(frame);
        self
    }

    pub fn calls(&self) -> &[TileCall] {
        &self.calls
    }

    pub fn scratch_releases(&self) -> usize {
        self.scratch_releases
    }
}

impl Upscaler for MockUpscaler {
    fn refine(&mut self, request: &TileRequest<'_>) -> candle_core::Result<Tensor> {
        self.calls.push(TileCall {
            frame: request.frame.get(),
            x: request.tile.x.clone(),
            y: request.tile.y.clone(),
            prompt: request.prompt.text.to_string(),
            signals: request.conditioning.iter().map(|s| s.name.clone()).collect(),
            seed: request.seed,
            clip_skip: request.clip_skip,
        });
        if self.fail_on_frame == Some(request.frame.get()) {
            candle_core::bail!("MockUpscaler: failed on frame {}", request.frame);
        }
        request.image.affine(1.0, self.shift)
    }

    fn release_scratch(&mut self) {
        self.scratch_releases += 1;
    }
}
