//! Importing settings from a previously generated still image
//!
//! Stable Diffusion front ends store their generation settings in a PNG
//! `parameters` text chunk:
//!
//! ```text
//! a girl, smiling
//! Negative prompt: lowres, bad hands
//! Steps: 20, Sampler: Euler a, Seed: 1234, Model: toonyou
//! ```
//!
//! `InputImage` reads that chunk and folds it into a `PromptConfig`: the
//! prompt and negative prompt are prepended to every configured entry and the
//! seed replaces every configured seed. The image itself can also be staged as
//! the first ControlNet frame of a runtime config.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, PromptConfig};
use crate::seed::RANDOM_SEED;

const PARAMETERS_KEY: &str = "parameters";
const NEGATIVE_PREFIX: &str = "Negative prompt:";
const SETTINGS_PREFIX: &str = "Steps:";

/// Parsed `parameters` text
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageParameters {
    pub prompt: String,
    pub negative_prompt: String,
    /// `Key: value` pairs of the settings line
    pub settings: BTreeMap<String, String>,
}

impl ImageParameters {
    pub fn parse(text: &str) -> Self {
        let mut prompt = String::new();
        let mut negative = String::new();
        let mut settings_line = "";
        let mut in_negative = false;

        for line in text.split('\n') {
            if line.starts_with(SETTINGS_PREFIX) {
                settings_line = line;
                break;
            }
            if in_negative {
                negative.push_str(line);
            } else if let Some(rest) = line.strip_prefix(NEGATIVE_PREFIX) {
                in_negative = true;
                negative.push_str(rest);
            } else {
                prompt.push_str(line);
            }
        }

        let mut settings = BTreeMap::new();
        for item in settings_line.split(',') {
            match item.split_once(':') {
                Some((key, value)) => {
                    settings.insert(key.trim().to_string(), value.trim().to_string());
                }
                None if item.trim().is_empty() => {}
                None => debug!(item, "Ignoring malformed image setting"),
            }
        }

        Self {
            prompt: prompt.trim().to_string(),
            negative_prompt: negative.trim().to_string(),
            settings,
        }
    }

    /// `Seed:` as a raw seed (`-1` keeps its random meaning)
    pub fn seed(&self) -> Option<i64> {
        let value = self.settings.get("Seed")?;
        value.parse::<i64>().ok().or_else(|| value.parse::<f64>().ok().map(|v| v as i64))
    }

    pub fn model(&self) -> Option<&str> {
        self.settings.get("Model").map(String::as_str)
    }
}

/// Read the `parameters` text chunk of a PNG, if it has one.
pub fn read_png_parameters(path: &Path) -> Result<Option<String>, ConfigError> {
    let file = File::open(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let png_error = |source: png::DecodingError| ConfigError::PngMetadata {
        path: path.to_path_buf(),
        source,
    };
    let reader = png::Decoder::new(BufReader::new(file))
        .read_info()
        .map_err(png_error)?;
    let info = reader.info();

    if let Some(chunk) = info
        .uncompressed_latin1_text
        .iter()
        .find(|c| c.keyword == PARAMETERS_KEY)
    {
        return Ok(Some(chunk.text.clone()));
    }
    if let Some(chunk) = info
        .compressed_latin1_text
        .iter()
        .find(|c| c.keyword == PARAMETERS_KEY)
    {
        return chunk.get_text().map(Some).map_err(png_error);
    }
    if let Some(chunk) = info.utf8_text.iter().find(|c| c.keyword == PARAMETERS_KEY) {
        return chunk.get_text().map(Some).map_err(png_error);
    }
    Ok(None)
}

/// How the image is staged as runtime ControlNet input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeStaging {
    /// 0 stages nothing, 1 frame 0, 2 also frame 8 and 3 frame 16 (openpose only)
    pub fix: u8,
    /// Mirror the image horizontally
    pub flip: bool,
}

impl Default for RuntimeStaging {
    fn default() -> Self {
        Self { fix: 1, flip: false }
    }
}

/// A PNG whose embedded settings seed a run
#[derive(Debug, Clone, PartialEq)]
pub struct InputImage {
    pub path: PathBuf,
    /// `None` when the image carries no `parameters` chunk
    pub parameters: Option<ImageParameters>,
}

impl InputImage {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let parameters = read_png_parameters(path)?.map(|text| ImageParameters::parse(&text));
        match &parameters {
            Some(p) => info!(
                path = %path.display(),
                prompt = %p.prompt,
                negative = %p.negative_prompt,
                settings = p.settings.len(),
                "Imported image parameters"
            ),
            None => warn!(path = %path.display(), "Input image has no generation parameters"),
        }
        Ok(Self {
            path: path.to_path_buf(),
            parameters,
        })
    }

    /// Seed from a `<index>-<seed>` file name, used when the embedded seed is random
    fn file_seed(&self) -> Option<i64> {
        let stem = self.path.file_stem()?.to_str()?;
        stem.split('-').nth(1)?.parse().ok()
    }

    /// `config` with the image's prompt, negative prompt and seed folded in.
    pub fn apply(&self, config: &PromptConfig) -> PromptConfig {
        let mut config = config.clone();
        let Some(params) = &self.parameters else {
            return config;
        };

        config.prompt_map = config.merged_prompt_map();
        config.prompt.clear();
        if !params.prompt.is_empty() {
            for text in config.prompt_map.values_mut() {
                *text = format!("{} {}", params.prompt, text);
            }
        }
        if !params.negative_prompt.is_empty() {
            for text in &mut config.n_prompt {
                *text = format!("{} {}", params.negative_prompt, text);
            }
        }

        if let Some(mut seed) = params.seed() {
            if seed == RANDOM_SEED
                && let Some(file_seed) = self.file_seed()
            {
                seed = file_seed;
            }
            for s in &mut config.seed {
                *s = seed;
            }
        }
        config
    }

    /// Replace `<input_image_dir>/<signal>/` of every ControlNet signal with
    /// copies of this image. Disabled signals only get their directory cleared.
    pub fn stage_runtime_controlnet(
        &self,
        config: &PromptConfig,
        staging: RuntimeStaging,
    ) -> Result<Vec<PathBuf>, ConfigError> {
        let root = &config.controlnet_map.input_image_dir;
        let mut written = Vec::new();

        for (name, entry) in &config.controlnet_map.signals {
            let dir = root.join(name);
            if dir.is_dir() {
                std::fs::remove_dir_all(&dir).map_err(|source| ConfigError::Write {
                    path: dir.clone(),
                    source,
                })?;
            }
            if !entry.enable || staging.fix == 0 {
                continue;
            }
            std::fs::create_dir_all(&dir).map_err(|source| ConfigError::Write {
                path: dir.clone(),
                source,
            })?;

            let mut frames = vec![0];
            if name == "controlnet_openpose" {
                match staging.fix {
                    0..=1 => {}
                    2 => frames.push(8),
                    _ => frames.push(16),
                }
            }
            for frame in frames {
                let target = dir.join(format!("{frame:04}.png"));
                self.write_copy(&target, staging.flip)?;
                written.push(target);
            }
        }

        debug!(files = written.len(), "Staged runtime ControlNet input");
        Ok(written)
    }

    fn write_copy(&self, target: &Path, flip: bool) -> Result<(), ConfigError> {
        if !flip {
            std::fs::copy(&self.path, target).map_err(|source| ConfigError::Write {
                path: target.to_path_buf(),
                source,
            })?;
            return Ok(());
        }
        let img = image::open(&self.path).map_err(|source| ConfigError::ImageDecode {
            path: self.path.clone(),
            source,
        })?;
        img.fliph().save(target).map_err(|source| ConfigError::ImageEncode {
            path: target.to_path_buf(),
            source,
        })
    }
}
