//! Tiled upscaling of generated frames
//!
//! Frames of a finished run are resized to the target resolution, split into
//! overlapping spatial tiles, and each tile is refined by an `Upscaler`
//! (typically img2img with a tile ControlNet). Refined tiles are blended back
//! with 2-D linear ramps over their shared borders, the same ramp used for
//! temporal window overlaps.
//!
//! Key features:
//! - Target size from one or both of width/height, aspect kept, multiple of 8
//! - `controlnet_tile` entry filled in when the config has none
//! - At least one of tile / line-anime / ip2p must be enabled
//! - Prompts resolved over the number of frames on disk

use candle_core::{DType, Device, Tensor};
use std::ops::Range;
use tracing::{debug, info};

use crate::blend::ramp_weights;
use crate::conditioning::{
    AlignedSignal, ConditioningAligner, FrameCondition, REFERENCE_SIGNAL, SignalKind,
};
use crate::config::{
    ControlNetEntry, PromptConfig, SignalInput, SignalSpec, parse_frame_map,
};
use crate::context::{ContextWindow, overlapping_spans};
use crate::error::{GenerationError, Result};
use crate::frame::{FrameIndex, FrameSpace};
use crate::lora;
use crate::pipeline::GenerationControl;
use crate::prompt::{PromptTimeline, ResolvedPrompt};
use crate::seed::SeedSpec;

pub const TILE_SIGNAL: &str = "controlnet_tile";
pub const LINE_ANIME_SIGNAL: &str = "controlnet_line_anime";
pub const IP2P_SIGNAL: &str = "controlnet_ip2p";
/// Signals that refine from the source frame; at least one must be enabled
pub const UPSCALE_SIGNALS: &[&str] = &[TILE_SIGNAL, LINE_ANIME_SIGNAL, IP2P_SIGNAL];

pub const DEFAULT_TILE_SIZE: usize = 512;
pub const DEFAULT_TILE_OVERLAP: usize = 64;

fn round_down_to_8(value: usize) -> usize {
    value / 8 * 8
}

/// Output size from the source size and the requested width and/or height.
pub fn target_size(
    source: (usize, usize),
    width: Option<usize>,
    height: Option<usize>,
) -> Result<(usize, usize)> {
    let (src_w, src_h) = source;
    if src_w == 0 || src_h == 0 {
        return Err(GenerationError::InvalidUpscaleConfig(format!(
            "source frames are {src_w}x{src_h}"
        )));
    }

    let (w, h) = match (width, height) {
        (None, None) => {
            return Err(GenerationError::InvalidUpscaleConfig(
                "at least one of width and height must be specified".to_string(),
            ));
        }
        (Some(w), Some(h)) => (w, h),
        (Some(w), None) => (w, src_h * w / src_w),
        (None, Some(h)) => (src_w * h / src_h, h),
    };

    let size = (round_down_to_8(w), round_down_to_8(h));
    if size.0 == 0 || size.1 == 0 {
        return Err(GenerationError::InvalidUpscaleConfig(format!(
            "target size {w}x{h} rounds down to {}x{}",
            size.0, size.1
        )));
    }
    Ok(size)
}

// =============================================================================
// Tiles
// =============================================================================

/// One spatial tile and how much it shares with its neighbours
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub x: Range<usize>,
    pub y: Range<usize>,
    lead_x: usize,
    tail_x: usize,
    lead_y: usize,
    tail_y: usize,
}

impl Tile {
    pub fn width(&self) -> usize {
        self.x.len()
    }

    pub fn height(&self) -> usize {
        self.y.len()
    }
}

/// Overlap shared with the previous and next span of a partition
fn span_overlaps(spans: &[Range<usize>], i: usize) -> (usize, usize) {
    let lead = match i.checked_sub(1) {
        Some(prev) => spans[prev].end.saturating_sub(spans[i].start),
        None => 0,
    };
    let tail = match spans.get(i + 1) {
        Some(next) => spans[i].end.saturating_sub(next.start),
        None => 0,
    };
    (lead, tail)
}

#[derive(Debug, Clone)]
pub struct TileGrid {
    width: usize,
    height: usize,
    tiles: Vec<Tile>,
}

impl TileGrid {
    pub fn new(width: usize, height: usize, tile_size: usize, overlap: usize) -> Result<Self> {
        if width == 0 || height == 0 || tile_size == 0 || overlap >= tile_size {
            return Err(GenerationError::InvalidUpscaleConfig(format!(
                "cannot tile {width}x{height} with tile size {tile_size} and overlap {overlap}"
            )));
        }

        let axis = |len: usize| {
            let size = tile_size.min(len);
            overlapping_spans(len, size, overlap.min(size - 1))
        };
        let xs = axis(width);
        let ys = axis(height);

        let mut tiles = Vec::with_capacity(xs.len() * ys.len());
        for (iy, y) in ys.iter().enumerate() {
            let (lead_y, tail_y) = span_overlaps(&ys, iy);
            for (ix, x) in xs.iter().enumerate() {
                let (lead_x, tail_x) = span_overlaps(&xs, ix);
                tiles.push(Tile {
                    x: x.clone(),
                    y: y.clone(),
                    lead_x,
                    tail_x,
                    lead_y,
                    tail_y,
                });
            }
        }

        Ok(Self {
            width,
            height,
            tiles,
        })
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// `[1, h, w]` blend weights of a tile
    pub fn mask(&self, tile: &Tile, device: &Device) -> candle_core::Result<Tensor> {
        let to_f32 = |w: Vec<f64>| w.into_iter().map(|v| v as f32).collect::<Vec<_>>();
        let wy = to_f32(ramp_weights(tile.height(), tile.lead_y, tile.tail_y));
        let wx = to_f32(ramp_weights(tile.width(), tile.lead_x, tile.tail_x));
        let wy = Tensor::from_vec(wy, (1, tile.height(), 1), device)?;
        let wx = Tensor::from_vec(wx, (1, 1, tile.width()), device)?;
        wy.broadcast_mul(&wx)
    }

    /// Place a `[C, h, w]` tile tensor into a zeroed full-frame canvas.
    fn place(&self, tile: &Tile, tensor: &Tensor) -> candle_core::Result<Tensor> {
        tensor
            .pad_with_zeros(1, tile.y.start, self.height - tile.y.end)?
            .pad_with_zeros(2, tile.x.start, self.width - tile.x.end)
    }
}

fn crop(tensor: &Tensor, tile: &Tile) -> candle_core::Result<Tensor> {
    tensor
        .narrow(1, tile.y.start, tile.height())?
        .narrow(2, tile.x.start, tile.width())
}

// =============================================================================
// Settings
// =============================================================================

/// Per-invocation upscale options
#[derive(Debug, Clone)]
pub struct UpscaleRequest {
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub tile_size: usize,
    pub tile_overlap: usize,
}

impl Default for UpscaleRequest {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            tile_size: DEFAULT_TILE_SIZE,
            tile_overlap: DEFAULT_TILE_OVERLAP,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpscaleSettings {
    pub width: usize,
    pub height: usize,
    pub tile_size: usize,
    pub tile_overlap: usize,
    pub timeline: PromptTimeline,
    pub negative_prompt: String,
    pub seed: SeedSpec,
    pub steps: usize,
    pub guidance_scale: f64,
    pub clip_skip: usize,
    pub signals: Vec<SignalSpec>,
}

impl UpscaleSettings {
    /// Validate the prompt file's `upscale_config` for `frame_count` frames of
    /// size `source`. Adds the default `controlnet_tile` entry to `config`
    /// when it has none, so the saved config shows what was run.
    pub fn validate(
        config: &mut PromptConfig,
        request: &UpscaleRequest,
        frame_count: usize,
        source: (usize, usize),
    ) -> Result<Self> {
        let (width, height) = target_size(source, request.width, request.height)?;
        TileGrid::new(width, height, request.tile_size, request.tile_overlap)?;

        config
            .upscale_config
            .entry(TILE_SIGNAL.to_string())
            .or_insert_with(ControlNetEntry::default);

        let mut signals = Vec::new();
        for (name, entry) in &config.upscale_config {
            let (kind, input) = if name == REFERENCE_SIGNAL {
                let ref_image = entry
                    .extra
                    .get("ref_image")
                    .and_then(|v| v.as_str())
                    .map(std::path::PathBuf::from);
                match ref_image {
                    Some(path) => (SignalKind::Reference, SignalInput::Image(path)),
                    None if !entry.enable => continue,
                    None => {
                        return Err(GenerationError::InvalidUpscaleConfig(
                            "controlnet_ref is enabled but has no ref_image".to_string(),
                        ));
                    }
                }
            } else if UPSCALE_SIGNALS.contains(&name.as_str()) {
                (SignalKind::ControlNet, SignalInput::SourceFrames)
            } else {
                return Err(GenerationError::UnknownSignal { name: name.clone() });
            };
            signals.push(SignalSpec {
                name: name.clone(),
                kind,
                enabled: entry.enable,
                params: entry.params(),
                input,
            });
        }

        if !signals
            .iter()
            .any(|s| s.enabled && UPSCALE_SIGNALS.contains(&s.name.as_str()))
        {
            return Err(GenerationError::InvalidUpscaleConfig(format!(
                "at least one of {} must be enabled",
                UPSCALE_SIGNALS.join(", ")
            )));
        }

        let space = FrameSpace::new(frame_count)?;
        let entries = parse_frame_map("prompt_map", &config.merged_prompt_map())?
            .into_iter()
            .map(|(frame, text)| (frame, lora::extract_lora_tags(&text).0));
        let timeline = PromptTimeline::new(space, entries, &config.head_prompt, &config.tail_prompt)?;

        let seed = match config.seed.first() {
            Some(&raw) => SeedSpec::from_raw(0, raw)?,
            None => SeedSpec::Random,
        };
        let negative_prompt = config.n_prompt.first().cloned().unwrap_or_default();

        debug!(
            width,
            height,
            frames = frame_count,
            signals = signals.len(),
            "Upscale settings validated"
        );

        Ok(Self {
            width,
            height,
            tile_size: request.tile_size,
            tile_overlap: request.tile_overlap,
            timeline,
            negative_prompt,
            seed,
            steps: config.steps,
            guidance_scale: config.guidance_scale,
            clip_skip: config.clip_skip,
            signals,
        })
    }

    pub fn space(&self) -> FrameSpace {
        self.timeline.space()
    }

    /// Concrete seed for this run, logged
    pub fn draw_seed(&self) -> u64 {
        let seed = self.seed.draw();
        info!(seed, random = self.seed.is_random(), "Generation seed");
        seed
    }

    /// Output directory name: `{generation:02}-{seed}-upscaled`
    pub fn output_stem(generation: usize, seed: u64) -> String {
        format!("{generation:02}-{seed}-upscaled")
    }
}

// =============================================================================
// Refinement
// =============================================================================

/// Everything the upscaler gets for one tile
#[derive(Debug)]
pub struct TileRequest<'a> {
    pub frame: FrameIndex,
    pub tile: &'a Tile,
    /// Resized source pixels of the tile, `[3, h, w]`
    pub image: &'a Tensor,
    pub prompt: &'a ResolvedPrompt,
    pub negative_prompt: &'a str,
    /// Active signals, cropped to the tile where they are full-frame maps
    pub conditioning: &'a [AlignedSignal],
    pub seed: u64,
    pub steps: usize,
    pub guidance_scale: f64,
    pub clip_skip: usize,
}

/// The opaque "refine one tile" capability.
pub trait Upscaler {
    /// Returns the refined tile, same shape as `request.image`.
    fn refine(&mut self, request: &TileRequest<'_>) -> candle_core::Result<Tensor>;

    fn release_scratch(&mut self) {}
}

fn crop_conditioning(
    signals: &[AlignedSignal],
    tile: &Tile,
    frame_dims: &[usize],
) -> candle_core::Result<Vec<AlignedSignal>> {
    signals
        .iter()
        .map(|signal| {
            let entries = signal
                .entries
                .iter()
                .map(|entry| match entry {
                    FrameCondition::Present { tensor, scale } if tensor.dims() == frame_dims => {
                        Ok(FrameCondition::Present {
                            tensor: crop(tensor, tile)?,
                            scale: *scale,
                        })
                    }
                    other => Ok(other.clone()),
                })
                .collect::<candle_core::Result<Vec<_>>>()?;
            Ok(AlignedSignal {
                entries,
                ..signal.clone()
            })
        })
        .collect()
}

/// Upscale resized frames tile by tile.
///
/// `frames` are the source frames already resized to the target size. The
/// upscaler's scratch is released after every frame, on failure too.
pub fn run_upscale<U: Upscaler + ?Sized>(
    settings: &UpscaleSettings,
    aligner: &ConditioningAligner,
    frames: &[Tensor],
    upscaler: &mut U,
    control: &GenerationControl,
    seed: u64,
) -> Result<Vec<Tensor>> {
    let space = settings.space();
    if frames.len() != space.duration() {
        return Err(GenerationError::InvalidUpscaleConfig(format!(
            "expected {} frames, got {}",
            space.duration(),
            frames.len()
        )));
    }

    let grid = TileGrid::new(
        settings.width,
        settings.height,
        settings.tile_size,
        settings.tile_overlap,
    )?;
    let Some(first) = frames.first() else {
        return Ok(Vec::new());
    };
    let device = first.device();
    let masks = grid
        .tiles()
        .iter()
        .map(|tile| grid.mask(tile, device))
        .collect::<candle_core::Result<Vec<_>>>()?;

    info!(
        frames = frames.len(),
        width = settings.width,
        height = settings.height,
        tiles = grid.len(),
        "Upscaling"
    );

    let mut output = Vec::with_capacity(frames.len());
    for (i, frame) in frames.iter().enumerate() {
        if control.is_cancelled() {
            return Err(GenerationError::UpscaleCancelled { frame: i });
        }
        let index = FrameIndex::new(i);
        let result = upscale_frame(settings, aligner, &grid, &masks, index, frame, upscaler, seed);
        upscaler.release_scratch();
        output.push(result?);
        debug!(frame = i, "Frame upscaled");
    }
    Ok(output)
}

#[allow(clippy::too_many_arguments)]
fn upscale_frame<U: Upscaler + ?Sized>(
    settings: &UpscaleSettings,
    aligner: &ConditioningAligner,
    grid: &TileGrid,
    masks: &[Tensor],
    index: FrameIndex,
    frame: &Tensor,
    upscaler: &mut U,
    seed: u64,
) -> Result<Tensor> {
    let frame = frame.to_dtype(DType::F32)?;
    let prompt = settings.timeline.resolve(index)?;
    let conditioning = aligner.align_window(&ContextWindow::single(index))?;
    let frame_dims = frame.dims().to_vec();

    let mut sum = frame.zeros_like()?;
    let mut weight = Tensor::zeros((1, settings.height, settings.width), DType::F32, frame.device())?;

    for (tile, mask) in grid.tiles().iter().zip(masks) {
        let image = crop(&frame, tile)?;
        let cropped = crop_conditioning(&conditioning, tile, &frame_dims)?;
        let request = TileRequest {
            frame: index,
            tile,
            image: &image,
            prompt: &prompt,
            negative_prompt: &settings.negative_prompt,
            conditioning: &cropped,
            seed,
            steps: settings.steps,
            guidance_scale: settings.guidance_scale,
            clip_skip: settings.clip_skip,
        };
        let refined = upscaler
            .refine(&request)
            .map_err(|source| GenerationError::DenoisingFailure {
                window: index.get(),
                first: index.get(),
                last: index.get(),
                source,
            })?;

        let weighted = refined.to_dtype(DType::F32)?.broadcast_mul(mask)?;
        sum = sum.add(&grid.place(tile, &weighted)?)?;
        weight = weight.add(&grid.place(tile, mask)?)?;
    }

    Ok(sum.broadcast_div(&weight)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_size_keeps_aspect() {
        assert_eq!(target_size((512, 768), Some(1024), None).unwrap(), (1024, 1536));
        assert_eq!(target_size((512, 768), None, Some(1000)).unwrap(), (664, 1000));
        assert_eq!(target_size((512, 512), Some(770), Some(770)).unwrap(), (768, 768));
        assert!(target_size((512, 512), None, None).is_err());
    }

    #[test]
    fn test_grid_covers_frame() {
        let grid = TileGrid::new(40, 24, 16, 4).unwrap();
        let mut covered = vec![0usize; 40 * 24];
        for tile in grid.tiles() {
            for y in tile.y.clone() {
                for x in tile.x.clone() {
                    covered[y * 40 + x] += 1;
                }
            }
        }
        assert!(covered.iter().all(|&c| c > 0));
    }

    #[test]
    fn test_small_frame_is_one_tile() {
        let grid = TileGrid::new(64, 64, 512, 64).unwrap();
        assert_eq!(grid.len(), 1);
        assert_eq!(grid.tiles()[0].x, 0..64);
    }
}
