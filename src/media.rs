//! Image and animation I/O
//!
//! Frames are `[3, H, W]` f32 tensors with values in `[0, 1]`. Conditioning
//! images are read from frame-numbered files (`0000.png`, `0016.png`, ...) and
//! resized to the generation size.

use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::conditioning::{ConditioningAligner, ConditioningSignal};
use crate::config::{ConfigError, SignalInput, SignalSpec};
use crate::error::Result;
use crate::frame::{FrameIndex, FrameSpace};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

// =============================================================================
// Tensor <-> image
// =============================================================================

/// Convert a `[3, H, W]` frame in `[0, 1]` to an RGB image.
pub fn tensor_to_image(frame: &Tensor) -> Result<RgbImage> {
    let dims = frame.dims();
    let &[3, height, width] = dims else {
        return Err(ConfigError::FrameShape {
            shape: dims.to_vec(),
        }
        .into());
    };

    let data: Vec<u8> = frame
        .to_dtype(DType::F32)?
        .clamp(0f32, 1f32)?
        .affine(255.0, 0.0)?
        .round()?
        .to_dtype(DType::U8)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1()?;

    RgbImage::from_raw(width as u32, height as u32, data).ok_or_else(|| {
        ConfigError::FrameShape {
            shape: dims.to_vec(),
        }
        .into()
    })
}

/// Convert an image to a `[3, H, W]` f32 tensor in `[0, 1]`.
pub fn image_to_tensor(image: &DynamicImage, device: &Device) -> Result<Tensor> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    let tensor = Tensor::from_vec(rgb.into_raw(), (height as usize, width as usize, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1.0 / 255.0, 0.0)?;
    Ok(tensor)
}

fn open_image(path: &Path) -> Result<DynamicImage> {
    Ok(image::open(path).map_err(|source| ConfigError::ImageDecode {
        path: path.to_path_buf(),
        source,
    })?)
}

/// Load an image at its own size.
pub fn load_image(path: &Path, device: &Device) -> Result<Tensor> {
    image_to_tensor(&open_image(path)?, device)
}

/// Load an image resized to `width` x `height`.
pub fn load_image_resized(path: &Path, width: usize, height: usize, device: &Device) -> Result<Tensor> {
    let image = open_image(path)?;
    let image = if image.width() as usize == width && image.height() as usize == height {
        image
    } else {
        image.resize_exact(width as u32, height as u32, FilterType::Lanczos3)
    };
    image_to_tensor(&image, device)
}

// =============================================================================
// Frame directories
// =============================================================================

/// Frame number of a file named like `0016.png` or `0016-pose.png`
pub fn frame_number(path: &Path) -> Option<usize> {
    let stem = path.file_stem()?.to_str()?;
    let digits: String = stem.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    let read_err = |source| ConfigError::Read {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(read_err)? {
        paths.push(entry.map_err(read_err)?.path());
    }
    paths.sort();
    Ok(paths)
}

/// PNG files whose name starts with a digit, sorted by name.
pub fn list_numbered_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    Ok(read_dir_sorted(dir)?
        .into_iter()
        .filter(|p| p.extension().is_some_and(|ext| ext == "png") && frame_number(p).is_some())
        .collect())
}

/// Load frame-numbered images from `dir`, resized, keyed by frame.
///
/// A missing directory yields an empty map. Frames outside `space` are skipped.
pub fn load_frame_map(
    dir: &Path,
    space: FrameSpace,
    width: usize,
    height: usize,
    device: &Device,
) -> Result<BTreeMap<FrameIndex, Tensor>> {
    let mut frames = BTreeMap::new();
    if !dir.is_dir() {
        debug!(dir = %dir.display(), "No conditioning image directory");
        return Ok(frames);
    }

    for path in read_dir_sorted(dir)? {
        if !is_image(&path) {
            continue;
        }
        let Some(index) = frame_number(&path) else {
            debug!(path = %path.display(), "Skipping image without a frame number");
            continue;
        };
        let frame = FrameIndex::new(index);
        if !space.contains(frame) {
            debug!(path = %path.display(), duration = space.duration(), "Skipping image past the last frame");
            continue;
        }
        frames.insert(frame, load_image_resized(&path, width, height, device)?);
    }
    Ok(frames)
}

/// Load every signal's images and register them with a new aligner.
///
/// `source_frames` backs signals reading `SignalInput::SourceFrames`.
pub fn load_conditioning(
    specs: &[SignalSpec],
    space: FrameSpace,
    width: usize,
    height: usize,
    device: &Device,
    source_frames: &[Tensor],
) -> Result<ConditioningAligner> {
    let mut aligner = ConditioningAligner::new(space);
    for spec in specs {
        let frames = if !spec.enabled {
            BTreeMap::new()
        } else {
            match &spec.input {
                SignalInput::FrameDir(dir) => load_frame_map(dir, space, width, height, device)?,
                SignalInput::Image(path) if path.is_file() => BTreeMap::from([(
                    FrameIndex::new(0),
                    load_image_resized(path, width, height, device)?,
                )]),
                SignalInput::Image(path) => {
                    warn!(signal = %spec.name, path = %path.display(), "Reference image not found, signal disabled");
                    BTreeMap::new()
                }
                SignalInput::SourceFrames => source_frames
                    .iter()
                    .take(space.duration())
                    .enumerate()
                    .map(|(i, frame)| (FrameIndex::new(i), frame.clone()))
                    .collect(),
            }
        };

        if spec.enabled && frames.is_empty() {
            warn!(signal = %spec.name, "Signal is enabled but has no images");
        }
        debug!(signal = %spec.name, frames = frames.len(), enabled = spec.enabled, "Loaded conditioning");

        let signal = ConditioningSignal::from_frames(spec.name.clone(), spec.kind, frames)
            .with_enabled(spec.enabled)
            .with_params(spec.params.clone());
        aligner.register(signal)?;
    }
    Ok(aligner)
}

// =============================================================================
// Writing
// =============================================================================

pub fn save_png(frame: &Tensor, path: &Path) -> Result<()> {
    let image = tensor_to_image(frame)?;
    Ok(image.save(path).map_err(|source| ConfigError::ImageEncode {
        path: path.to_path_buf(),
        source,
    })?)
}

/// Save frames as `{index:08}.png` into `dir`, creating it.
pub fn save_frames(frames: &[Tensor], dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
        path: dir.to_path_buf(),
        source,
    })?;
    for (i, frame) in frames.iter().enumerate() {
        save_png(frame, &dir.join(format!("{i:08}.png")))?;
    }
    Ok(())
}

/// Write an endlessly looping GIF.
pub fn save_gif(images: &[RgbImage], path: &Path, fps: u16) -> Result<()> {
    use gif::{Encoder, Frame, Repeat};

    let Some(first) = images.first() else {
        return Ok(());
    };
    let (width, height) = first.dimensions();
    let delay = (100 / fps.max(1)).max(1);

    let gif_err = |source| ConfigError::GifEncode {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::create(path).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    let mut encoder = Encoder::new(&mut file, width as u16, height as u16, &[]).map_err(gif_err)?;
    encoder.set_repeat(Repeat::Infinite).map_err(gif_err)?;

    for image in images {
        let mut frame = Frame::from_rgb_speed(width as u16, height as u16, image.as_raw(), 10);
        frame.delay = delay;
        encoder.write_frame(&frame).map_err(gif_err)?;
    }
    Ok(())
}
