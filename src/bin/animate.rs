//! AnimateDiff-style animation generator
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin animate -- generate \
//!     --config-path config/prompts/example.json \
//!     -L 64 -W 512 -H 768 --repeats 2 --mock
//!
//! cargo run --release --bin animate -- tile-upscale output/2024-01-01T00-00-00-example/00-1234 \
//!     -W 1024 --mock
//! ```
//!
//! No diffusion backend is linked into this binary; `--mock` runs the whole
//! scheduling pipeline against deterministic stand-ins.

use anyhow::{Context, Result, bail};
use candle_core::Device;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use candle_animate::{
    config::{GenerateRequest, PromptConfig, RunSettings},
    context::MotionModuleVersion,
    input_image::{InputImage, RuntimeStaging},
    media,
    mock::{MockDenoiser, MockUpscaler},
    output::{CONFIG_FILE, DirectorySink, RunRecord},
    pipeline::{
        GenerationControl, GenerationDriver, GenerationPlan, GenerationProgress, PipelineCache,
    },
    upscale::{self, UpscaleRequest, UpscaleSettings},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Generate animations with context-windowed motion modules")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate an animation from a prompt config
    Generate(GenerateArgs),
    /// Upscale generated frames tile by tile
    TileUpscale(TileUpscaleArgs),
}

#[derive(Args, Debug)]
struct DeviceArgs {
    /// Use CPU instead of CUDA
    #[arg(long)]
    cpu: bool,

    /// Use deterministic mock capabilities instead of a model backend
    #[arg(long)]
    mock: bool,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    /// Path to a prompt config JSON file
    #[arg(short = 'c', long, default_value = "config/prompts/01-ToonYou.json")]
    config_path: PathBuf,

    /// Width of generated frames
    #[arg(short = 'W', long, default_value = "512")]
    width: usize,

    /// Height of generated frames
    #[arg(short = 'H', long, default_value = "512")]
    height: usize,

    /// Number of frames to generate
    #[arg(short = 'L', long, default_value = "16")]
    length: usize,

    /// Frames per context window (default: min(length, 16))
    #[arg(short = 'C', long, value_parser = clap::value_parser!(u16).range(1..=32))]
    context: Option<u16>,

    /// Frames shared by consecutive windows (default: context / 4)
    #[arg(short = 'O', long)]
    overlap: Option<usize>,

    /// Max motion stride as a power of two (default: 0)
    #[arg(short = 'S', long)]
    stride: Option<u32>,

    /// Number of times to repeat the prompt
    #[arg(short = 'r', long, default_value = "1")]
    repeats: usize,

    /// Override motion module version detection
    #[arg(long, value_enum)]
    motion_module: Option<ModuleVersionArg>,

    /// Directory for output folders
    #[arg(short = 'o', long, default_value = "output")]
    out_dir: PathBuf,

    /// Don't save frames, only the animation
    #[arg(short = 'N', long)]
    no_frames: bool,

    /// Also save all repeats as one animation
    #[arg(short = 'm', long)]
    save_merged: bool,

    /// PNG whose embedded prompt, negative prompt and seed are imported
    #[arg(short = 'I', long)]
    input_image: Option<PathBuf>,

    /// Runtime configs only: how many ControlNet frames the input image fills (0-3)
    #[arg(long, default_value = "1", value_parser = clap::value_parser!(u8).range(0..=3))]
    input_image_fix: u8,

    /// Mirror the input image before staging it
    #[arg(long)]
    input_image_flip: bool,

    #[command(flatten)]
    device: DeviceArgs,
}

#[derive(Args, Debug)]
struct TileUpscaleArgs {
    /// Directory of generated frames (`00000000.png`, ...)
    frames_dir: PathBuf,

    /// Prompt config (default: prompt.json next to the frames directory)
    #[arg(short = 'c', long)]
    config_path: Option<PathBuf>,

    /// Target width; height follows the aspect ratio when omitted
    #[arg(short = 'W', long)]
    width: Option<usize>,

    /// Target height; width follows the aspect ratio when omitted
    #[arg(short = 'H', long)]
    height: Option<usize>,

    /// Tile edge in pixels
    #[arg(long, default_value_t = upscale::DEFAULT_TILE_SIZE)]
    tile_size: usize,

    /// Pixels shared by neighbouring tiles
    #[arg(long, default_value_t = upscale::DEFAULT_TILE_OVERLAP)]
    tile_overlap: usize,

    /// Directory for output folders
    #[arg(short = 'o', long, default_value = "output")]
    out_dir: PathBuf,

    /// Don't save frames
    #[arg(short = 'N', long)]
    no_frames: bool,

    #[command(flatten)]
    device: DeviceArgs,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ModuleVersionArg {
    V1,
    V2,
}

impl From<ModuleVersionArg> for MotionModuleVersion {
    fn from(arg: ModuleVersionArg) -> Self {
        match arg {
            ModuleVersionArg::V1 => MotionModuleVersion::V1,
            ModuleVersionArg::V2 => MotionModuleVersion::V2,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_animate=info".parse()?)
                .add_directive("animate=info".parse()?),
        )
        .init();

    match Cli::parse().command {
        Command::Generate(args) => generate(args),
        Command::TileUpscale(args) => tile_upscale(args),
    }
}

fn select_device(args: &DeviceArgs) -> Result<Device> {
    if !args.mock {
        bail!("no diffusion backend is linked into this build; rerun with --mock");
    }
    if args.cpu {
        info!("Using CPU");
        return Ok(Device::Cpu);
    }
    match Device::cuda_if_available(0) {
        Ok(device) => Ok(device),
        Err(e) => {
            warn!("CUDA not available: {}, falling back to CPU", e);
            Ok(Device::Cpu)
        }
    }
}

/// `<out_dir>/<timestamp>-<name>`, created
fn make_save_dir(out_dir: &Path, config: &PromptConfig) -> Result<PathBuf> {
    let time_str = chrono::Local::now().format("%Y-%m-%dT%H-%M-%S");
    let save_dir = out_dir.join(format!("{}-{}", time_str, config.save_name()));
    std::fs::create_dir_all(&save_dir)
        .with_context(|| format!("Failed to create {}", save_dir.display()))?;
    info!("Will save outputs to {}", save_dir.display());
    Ok(save_dir)
}

/// Configs named `prompt_runtime*` take their ControlNet input from the input image
fn is_runtime_config(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("prompt_runtime"))
}

fn generate(args: GenerateArgs) -> Result<()> {
    let config_path = std::path::absolute(&args.config_path)?;
    info!("Using generation config: {}", config_path.display());
    let config = PromptConfig::load(&config_path)?;

    let request = GenerateRequest {
        width: args.width,
        height: args.height,
        length: args.length,
        context: args.context.map(usize::from),
        overlap: args.overlap,
        stride: args.stride,
        repeats: args.repeats,
        motion_module_version: args.motion_module.map(Into::into),
        input_image: args
            .input_image
            .as_deref()
            .map(InputImage::load)
            .transpose()?,
    };
    let settings = RunSettings::validate(&config, &request)?;
    let config = request.effective_config(&config);

    if let Some(image) = &request.input_image
        && is_runtime_config(&config_path)
    {
        let staging = RuntimeStaging {
            fix: args.input_image_fix,
            flip: args.input_image_flip,
        };
        let staged = image.stage_runtime_controlnet(&config, staging)?;
        info!("Staged input image as {} ControlNet frames", staged.len());
    }
    let device = select_device(&args.device)?;

    info!(
        "Video: {}x{} @ {} frames, context {} overlap {} stride {}",
        settings.width,
        settings.height,
        args.length,
        settings.schedule.settings().context,
        settings.schedule.settings().overlap,
        settings.schedule.settings().stride
    );
    for (path, weight) in &settings.lora {
        info!("LoRA {} @ {}", path.display(), weight);
    }

    let save_dir = make_save_dir(&args.out_dir, &config)?;
    RunRecord::write_raw(&config, &save_dir)?;

    let aligner = media::load_conditioning(
        &settings.signals,
        settings.space(),
        settings.width,
        settings.height,
        &device,
        &[],
    )?;
    let plan = GenerationPlan::from_settings(&settings, aligner)?;

    let mut cache = PipelineCache::new();
    let denoiser = cache.get_or_load(&config.path, |_| {
        Ok::<_, anyhow::Error>(MockDenoiser::new(device.clone()))
    })?;

    let mut sink = DirectorySink::new(&save_dir, config.output.fps)
        .with_save_frames(!args.no_frames)
        .with_save_merged(args.save_merged);
    let mut driver = GenerationDriver::new(denoiser)
        .with_control(GenerationControl::new())
        .with_progress(Box::new(|p: GenerationProgress| {
            debug!(
                "repeat {}/{} window {}/{}",
                p.repeat + 1,
                p.repeats,
                p.window,
                p.windows
            );
        }));
    let seeds = driver.run_into(&plan, &mut sink)?;

    let mut record = RunRecord::new(&config, &seeds);
    record.config.lora_map = settings
        .lora
        .iter()
        .map(|(path, &weight)| (path.to_string_lossy().into_owned(), weight))
        .collect();
    record.write(&save_dir)?;

    info!("Done, outputs in {}", save_dir.display());
    Ok(())
}

fn tile_upscale(args: TileUpscaleArgs) -> Result<()> {
    let frames_dir = std::path::absolute(&args.frames_dir)?;
    let config_path = match args.config_path {
        Some(path) => path,
        None => frames_dir
            .parent()
            .map(|dir| dir.join(CONFIG_FILE))
            .filter(|path| path.is_file())
            .context("No --config-path given and no prompt.json next to the frames directory")?,
    };
    info!("Using generation config: {}", config_path.display());
    let mut config = PromptConfig::load(&config_path)?;

    let frame_paths = media::list_numbered_frames(&frames_dir)?;
    let Some(first) = frame_paths.first() else {
        bail!("No numbered frames found in {}", frames_dir.display());
    };
    let (src_w, src_h) = image::image_dimensions(first)
        .with_context(|| format!("Failed to read {}", first.display()))?;

    let request = UpscaleRequest {
        width: args.width,
        height: args.height,
        tile_size: args.tile_size,
        tile_overlap: args.tile_overlap,
    };
    let settings = UpscaleSettings::validate(
        &mut config,
        &request,
        frame_paths.len(),
        (src_w as usize, src_h as usize),
    )?;
    let device = select_device(&args.device)?;
    let save_dir = make_save_dir(&args.out_dir, &config)?;

    let frames = frame_paths
        .iter()
        .map(|path| media::load_image_resized(path, settings.width, settings.height, &device))
        .collect::<candle_animate::Result<Vec<_>>>()?;
    let aligner = media::load_conditioning(
        &settings.signals,
        settings.space(),
        settings.width,
        settings.height,
        &device,
        &frames,
    )?;

    let seed = settings.draw_seed();
    let mut upscaler = MockUpscaler::new();
    let upscaled = upscale::run_upscale(
        &settings,
        &aligner,
        &frames,
        &mut upscaler,
        &GenerationControl::new(),
        seed,
    )?;

    config
        .result
        .insert("original_frames".to_string(), frames_dir.display().to_string());
    RunRecord::new(&config, &[seed]).write(&save_dir)?;

    if !args.no_frames {
        let out = save_dir.join(UpscaleSettings::output_stem(0, seed));
        media::save_frames(&upscaled, &out)?;
        info!("Saved {} upscaled frames to {}", upscaled.len(), out.display());
    }

    info!("Done, outputs in {}", save_dir.display());
    Ok(())
}
