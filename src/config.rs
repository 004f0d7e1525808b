//! Configuration for animation runs
//!
//! `PromptConfig` mirrors the JSON prompt file. It is loosely typed on purpose
//! (string frame keys, raw seeds, free-form signal maps) so existing files load
//! unchanged. `RunSettings::validate` is the single step that turns it into
//! typed, checked settings; every configuration-shape error is raised there,
//! before any denoising work starts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::blend::OverlapBlend;
use crate::conditioning::{
    CONTROLNET_SIGNALS, IP_ADAPTER_SIGNAL, REFERENCE_SIGNAL, SignalKind, SignalParams,
};
use crate::context::{ContextParams, ContextSchedule, MotionModuleVersion};
use crate::error::{GenerationError, Result};
use crate::frame::{FrameIndex, FrameSpace};
use crate::input_image::InputImage;
use crate::lora;
use crate::prompt::PromptTimeline;
use crate::seed::SeedSchedule;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to serialize config")]
    Serialize(#[source] serde_json::Error),
    #[error("Invalid frame key {key:?} in {map}: expected a non-negative integer")]
    InvalidFrameKey { map: &'static str, key: String },
    #[error("Invalid seed {value} at position {index}: only -1 (random) may be negative")]
    NegativeSeed { index: usize, value: i64 },
    #[error("Invalid dimensions: width={width}, height={height}. Must be positive multiples of 8")]
    InvalidDimensions { width: usize, height: usize },
    #[error("Invalid repeat count: {0}. Must be at least 1")]
    InvalidRepeats(usize),
    #[error("Failed to decode image {path}")]
    ImageDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("Failed to encode image {path}")]
    ImageEncode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("Failed to encode animation {path}")]
    GifEncode {
        path: PathBuf,
        #[source]
        source: gif::EncodingError,
    },
    #[error("Failed to read PNG metadata of {path}")]
    PngMetadata {
        path: PathBuf,
        #[source]
        source: png::DecodingError,
    },
    #[error("Frame tensor has shape {shape:?}, expected [3, height, width]")]
    FrameShape { shape: Vec<usize> },
}

// =============================================================================
// Prompt file
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_one() -> f64 {
    1.0
}

fn default_seed() -> Vec<i64> {
    vec![crate::seed::RANDOM_SEED]
}

fn default_steps() -> usize {
    25
}

fn default_guidance_scale() -> f64 {
    7.5
}

fn default_clip_skip() -> usize {
    1
}

fn default_n_prompt() -> Vec<String> {
    vec![String::new()]
}

/// The JSON prompt file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Run name, used in the output directory name
    #[serde(default)]
    pub name: String,
    /// Base model checkpoint
    #[serde(default)]
    pub path: PathBuf,
    /// Motion module checkpoint
    #[serde(default)]
    pub motion_module: PathBuf,
    #[serde(default)]
    pub compile: bool,
    /// Seeds per repeat, `-1` for random
    #[serde(default = "default_seed")]
    pub seed: Vec<i64>,
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    #[serde(default = "default_clip_skip")]
    pub clip_skip: usize,
    #[serde(default)]
    pub head_prompt: String,
    #[serde(default)]
    pub tail_prompt: String,
    /// Keyframe prompts keyed by frame number
    #[serde(default)]
    pub prompt_map: BTreeMap<String, String>,
    /// Legacy prompt list, folded into `prompt_map` at keys "0", "1", ...
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prompt: Vec<String>,
    /// Negative prompts per repeat
    #[serde(default = "default_n_prompt")]
    pub n_prompt: Vec<String>,
    /// LoRA file -> weight
    #[serde(default)]
    pub lora_map: BTreeMap<String, f32>,
    /// Directory searched for `<lora:NAME:WEIGHT>` tags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora_path: Option<PathBuf>,
    #[serde(default)]
    pub controlnet_map: ControlNetMapConfig,
    #[serde(default)]
    pub ip_adapter_map: IpAdapterConfig,
    #[serde(default)]
    pub upscale_config: BTreeMap<String, ControlNetEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlap: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stride: Option<u32>,
    #[serde(default)]
    pub overlap_blend: OverlapBlend,
    #[serde(default)]
    pub output: OutputConfig,
    /// Provenance written by tile upscale runs
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub result: BTreeMap<String, String>,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            path: PathBuf::new(),
            motion_module: PathBuf::new(),
            compile: false,
            seed: default_seed(),
            steps: default_steps(),
            guidance_scale: default_guidance_scale(),
            clip_skip: default_clip_skip(),
            head_prompt: String::new(),
            tail_prompt: String::new(),
            prompt_map: BTreeMap::new(),
            prompt: Vec::new(),
            n_prompt: default_n_prompt(),
            lora_map: BTreeMap::new(),
            lora_path: None,
            controlnet_map: ControlNetMapConfig::default(),
            ip_adapter_map: IpAdapterConfig::default(),
            upscale_config: BTreeMap::new(),
            context: None,
            overlap: None,
            stride: None,
            overlap_blend: OverlapBlend::default(),
            output: OutputConfig::default(),
            result: BTreeMap::new(),
        }
    }
}

impl PromptConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write as pretty JSON (4-space indent)
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut ser).map_err(ConfigError::Serialize)?;
        std::fs::write(path, buf).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Name used for output directories: `name` with spaces replaced, or "animation"
    pub fn save_name(&self) -> String {
        let name = self.name.trim();
        if name.is_empty() {
            return "animation".to_string();
        }
        name.replace(|c: char| c.is_whitespace() || c == '/' || c == '\\', "_")
    }

    /// Prompt map with the legacy `prompt` list folded in
    pub fn merged_prompt_map(&self) -> BTreeMap<String, String> {
        let mut map = self.prompt_map.clone();
        for (idx, text) in self.prompt.iter().enumerate() {
            map.insert(idx.to_string(), text.clone());
        }
        map
    }
}

/// One ControlNet entry of `controlnet_map` / `upscale_config`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlNetEntry {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default = "default_true")]
    pub use_preprocessor: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preprocessor: Option<serde_json::Value>,
    #[serde(default)]
    pub guess_mode: bool,
    #[serde(default = "default_one")]
    pub controlnet_conditioning_scale: f64,
    #[serde(default)]
    pub control_guidance_start: f64,
    #[serde(default = "default_one")]
    pub control_guidance_end: f64,
    /// Scale for frames borrowing a neighbour's map, by distance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub control_scale_list: Vec<f64>,
    /// Unrecognized keys, preserved on save
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for ControlNetEntry {
    fn default() -> Self {
        Self {
            enable: true,
            use_preprocessor: true,
            preprocessor: None,
            guess_mode: false,
            controlnet_conditioning_scale: 1.0,
            control_guidance_start: 0.0,
            control_guidance_end: 1.0,
            control_scale_list: Vec::new(),
            extra: BTreeMap::new(),
        }
    }
}

impl ControlNetEntry {
    pub fn params(&self) -> SignalParams {
        SignalParams {
            scale: self.controlnet_conditioning_scale,
            guidance_start: self.control_guidance_start,
            guidance_end: self.control_guidance_end,
            guess_mode: self.guess_mode,
            scale_list: self.control_scale_list.clone(),
        }
    }
}

fn default_controlnet_dir() -> PathBuf {
    PathBuf::from("controlnet_image/test")
}

fn default_max_samples_on_vram() -> usize {
    200
}

fn default_max_models_on_vram() -> usize {
    3
}

/// `controlnet_map`: global options plus one entry per ControlNet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlNetMapConfig {
    /// Per-signal frames live in `<input_image_dir>/<signal name>/`
    #[serde(default = "default_controlnet_dir")]
    pub input_image_dir: PathBuf,
    #[serde(default = "default_max_samples_on_vram")]
    pub max_samples_on_vram: usize,
    #[serde(default = "default_max_models_on_vram")]
    pub max_models_on_vram: usize,
    #[serde(default = "default_true")]
    pub save_detectmap: bool,
    #[serde(default = "default_true")]
    pub preprocess_on_gpu: bool,
    #[serde(default = "default_true")]
    pub is_loop: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controlnet_ref: Option<ReferenceConfig>,
    #[serde(flatten)]
    pub signals: BTreeMap<String, ControlNetEntry>,
}

impl Default for ControlNetMapConfig {
    fn default() -> Self {
        Self {
            input_image_dir: default_controlnet_dir(),
            max_samples_on_vram: default_max_samples_on_vram(),
            max_models_on_vram: default_max_models_on_vram(),
            save_detectmap: true,
            preprocess_on_gpu: true,
            is_loop: true,
            controlnet_ref: None,
            signals: BTreeMap::new(),
        }
    }
}

fn default_style_fidelity() -> f64 {
    0.5
}

fn default_scale_pattern() -> Vec<f64> {
    vec![1.0]
}

/// Reference-only ControlNet: one image steering every frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub ref_image: PathBuf,
    #[serde(default = "default_one")]
    pub attention_auto_machine_weight: f64,
    #[serde(default = "default_one")]
    pub gn_auto_machine_weight: f64,
    #[serde(default = "default_style_fidelity")]
    pub style_fidelity: f64,
    #[serde(default = "default_true")]
    pub reference_attn: bool,
    #[serde(default)]
    pub reference_adain: bool,
    #[serde(default = "default_scale_pattern")]
    pub scale_pattern: Vec<f64>,
}

fn default_ip_adapter_dir() -> PathBuf {
    PathBuf::from("ip_adapter_image/test")
}

fn default_ip_adapter_scale() -> f64 {
    0.5
}

/// `ip_adapter_map`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpAdapterConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_ip_adapter_dir")]
    pub input_image_dir: PathBuf,
    #[serde(default = "default_true")]
    pub save_input_image: bool,
    #[serde(default)]
    pub resized_to_square: bool,
    #[serde(default = "default_ip_adapter_scale")]
    pub scale: f64,
    #[serde(default)]
    pub is_plus_face: bool,
    #[serde(default = "default_true")]
    pub is_plus: bool,
    #[serde(default)]
    pub is_light: bool,
}

impl Default for IpAdapterConfig {
    fn default() -> Self {
        Self {
            enable: false,
            input_image_dir: default_ip_adapter_dir(),
            save_input_image: true,
            resized_to_square: false,
            scale: default_ip_adapter_scale(),
            is_plus_face: false,
            is_plus: true,
            is_light: false,
        }
    }
}

fn default_format() -> String {
    "gif".to_string()
}

fn default_fps() -> u16 {
    8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Animation container; only "gif" is written
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_fps")]
    pub fps: u16,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_format(),
            fps: default_fps(),
        }
    }
}

// =============================================================================
// Run settings
// =============================================================================

/// Per-invocation values that do not live in the prompt file
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub width: usize,
    pub height: usize,
    /// Number of frames
    pub length: usize,
    pub context: Option<usize>,
    pub overlap: Option<usize>,
    pub stride: Option<u32>,
    pub repeats: usize,
    /// Skips header detection when set
    pub motion_module_version: Option<MotionModuleVersion>,
    /// Prompt, negative prompt and seed imported from a generated image
    pub input_image: Option<InputImage>,
}

impl Default for GenerateRequest {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            length: 16,
            context: None,
            overlap: None,
            stride: None,
            repeats: 1,
            motion_module_version: None,
            input_image: None,
        }
    }
}

/// Where a signal's images come from
#[derive(Debug, Clone, PartialEq)]
pub enum SignalInput {
    /// Directory of frame-numbered images (`0000.png`, `0016.png`, ...)
    FrameDir(PathBuf),
    /// One image broadcast to every frame
    Image(PathBuf),
    /// The frames being processed themselves (tile upscaling)
    SourceFrames,
}

/// A validated conditioning signal, before its images are loaded
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSpec {
    pub name: String,
    pub kind: SignalKind,
    pub enabled: bool,
    pub params: SignalParams,
    pub input: SignalInput,
}

/// Typed, validated settings for one `generate` invocation
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub width: usize,
    pub height: usize,
    pub version: MotionModuleVersion,
    pub schedule: ContextSchedule,
    pub timeline: PromptTimeline,
    pub negative_prompts: Vec<String>,
    pub seeds: SeedSchedule,
    pub steps: usize,
    pub guidance_scale: f64,
    pub clip_skip: usize,
    pub repeats: usize,
    pub blend: OverlapBlend,
    /// Selected LoRA files and weights
    pub lora: BTreeMap<PathBuf, f32>,
    pub signals: Vec<SignalSpec>,
}

/// Parse string frame keys into sorted `FrameIndex` entries.
pub fn parse_frame_map<V: Clone>(
    map_name: &'static str,
    map: &BTreeMap<String, V>,
) -> Result<Vec<(FrameIndex, V)>, ConfigError> {
    map.iter()
        .map(|(key, value)| {
            key.trim()
                .parse::<usize>()
                .map(|idx| (FrameIndex::new(idx), value.clone()))
                .map_err(|_| ConfigError::InvalidFrameKey {
                    map: map_name,
                    key: key.clone(),
                })
        })
        .collect()
}

pub fn check_dimensions(width: usize, height: usize) -> Result<(), ConfigError> {
    if width == 0 || height == 0 || width % 8 != 0 || height % 8 != 0 {
        return Err(ConfigError::InvalidDimensions { width, height });
    }
    Ok(())
}

impl GenerateRequest {
    /// The prompt file as this invocation runs it, with any input image folded in.
    pub fn effective_config(&self, config: &PromptConfig) -> PromptConfig {
        match &self.input_image {
            Some(image) => image.apply(config),
            None => config.clone(),
        }
    }
}

impl RunSettings {
    /// Validate a prompt file against an invocation.
    pub fn validate(config: &PromptConfig, request: &GenerateRequest) -> Result<Self> {
        let config = &request.effective_config(config);
        check_dimensions(request.width, request.height)?;
        if request.repeats == 0 {
            return Err(ConfigError::InvalidRepeats(0).into());
        }

        let space = FrameSpace::new(request.length)?;
        let version = match request.motion_module_version {
            Some(version) => version,
            None if config.motion_module.as_os_str().is_empty() => MotionModuleVersion::default(),
            None => MotionModuleVersion::detect(&config.motion_module),
        };

        // CLI values win over the prompt file
        let params = ContextParams {
            context: request.context.or(config.context),
            overlap: request.overlap.or(config.overlap),
            stride: request.stride.or(config.stride),
        };
        let schedule = ContextSchedule::from_params(space, &params, version)?;

        let (entries, lora) = collect_prompts(config)?;
        let timeline = PromptTimeline::new(space, entries, &config.head_prompt, &config.tail_prompt)?;

        let seeds = SeedSchedule::from_raw(&config.seed)?;
        let negative_prompts = if config.n_prompt.is_empty() {
            default_n_prompt()
        } else {
            config.n_prompt.clone()
        };

        let signals = collect_signals(config)?;

        info!(
            frames = space.duration(),
            windows = schedule.len(),
            keyframes = timeline.keyframes().len(),
            signals = signals.iter().filter(|s| s.enabled).count(),
            loras = lora.len(),
            "Run settings validated"
        );

        Ok(Self {
            width: request.width,
            height: request.height,
            version,
            schedule,
            timeline,
            negative_prompts,
            seeds,
            steps: config.steps,
            guidance_scale: config.guidance_scale,
            clip_skip: config.clip_skip,
            repeats: request.repeats,
            blend: config.overlap_blend,
            lora,
            signals,
        })
    }

    pub fn space(&self) -> FrameSpace {
        self.schedule.space()
    }

    /// Negative prompt of a repeat, reused cyclically
    pub fn negative_prompt(&self, repeat: usize) -> &str {
        &self.negative_prompts[repeat % self.negative_prompts.len()]
    }
}

/// Keyframe texts with LoRA tags stripped, plus the LoRA selection.
#[allow(clippy::type_complexity)]
fn collect_prompts(
    config: &PromptConfig,
) -> Result<(Vec<(FrameIndex, String)>, BTreeMap<PathBuf, f32>)> {
    let raw = parse_frame_map("prompt_map", &config.merged_prompt_map())?;

    let mut requested = BTreeMap::new();
    let mut entries = Vec::with_capacity(raw.len());
    for (frame, text) in raw {
        let (cleaned, tags) = lora::extract_lora_tags(&text);
        for tag in tags {
            requested.insert(tag.name, tag.weight);
        }
        entries.push((frame, cleaned));
    }

    let mut selected: BTreeMap<PathBuf, f32> = config
        .lora_map
        .iter()
        .map(|(path, &weight)| (PathBuf::from(path), weight))
        .collect();

    if let Some(dir) = &config.lora_path
        && !requested.is_empty()
    {
        let available = lora::discover_lora_files(dir).map_err(|source| ConfigError::Read {
            path: dir.clone(),
            source,
        })?;
        let (found, missing) = lora::select_lora_files(&requested, &available);
        for name in missing {
            warn!(lora = %name, dir = %dir.display(), "No LoRA file matches prompt tag");
        }
        selected.extend(found);
    } else if !requested.is_empty() {
        warn!(count = requested.len(), "Prompt has LoRA tags but no lora_path is set");
    }

    Ok((entries, selected))
}

fn collect_signals(config: &PromptConfig) -> Result<Vec<SignalSpec>> {
    let cn = &config.controlnet_map;
    let mut signals = Vec::new();

    for (name, entry) in &cn.signals {
        if !CONTROLNET_SIGNALS.contains(&name.as_str()) {
            return Err(GenerationError::UnknownSignal { name: name.clone() });
        }
        signals.push(SignalSpec {
            name: name.clone(),
            kind: SignalKind::ControlNet,
            enabled: entry.enable,
            params: entry.params(),
            input: SignalInput::FrameDir(cn.input_image_dir.join(name)),
        });
    }

    if let Some(reference) = &cn.controlnet_ref {
        signals.push(SignalSpec {
            name: REFERENCE_SIGNAL.to_string(),
            kind: SignalKind::Reference,
            enabled: reference.enable,
            params: SignalParams {
                scale: reference.style_fidelity,
                ..SignalParams::default()
            },
            input: SignalInput::Image(reference.ref_image.clone()),
        });
    }

    let ip = &config.ip_adapter_map;
    if ip.enable {
        signals.push(SignalSpec {
            name: IP_ADAPTER_SIGNAL.to_string(),
            kind: SignalKind::IpAdapter,
            enabled: true,
            params: SignalParams {
                scale: ip.scale,
                ..SignalParams::default()
            },
            input: SignalInput::FrameDir(ip.input_image_dir.clone()),
        });
    } else {
        debug!("IP-Adapter disabled");
    }

    Ok(signals)
}
