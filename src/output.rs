//! Persisting generation results
//!
//! Layout of a run directory:
//!
//! ```text
//! <out>/raw_prompt.json        config as loaded, before seeds are drawn
//! <out>/prompt.json            config with the concrete seeds that were used
//! <out>/00-1234/00000000.png   frames of repeat 0, seed 1234
//! <out>/00-1234.gif            animation of repeat 0
//! <out>/final.gif              all repeats back to back (optional)
//! ```

use image::RgbImage;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::{ConfigError, PromptConfig};
use crate::error::Result;
use crate::media;
use crate::pipeline::GenerationOutput;

/// Receives each repeat's output as soon as it is complete
pub trait OutputSink {
    fn save(&mut self, output: &GenerationOutput) -> Result<()>;

    /// Called once after the last repeat
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Keeps outputs in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    pub outputs: Vec<GenerationOutput>,
    pub finished: bool,
}

impl OutputSink for MemorySink {
    fn save(&mut self, output: &GenerationOutput) -> Result<()> {
        self.outputs.push(output.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}

/// Writes frames and GIFs into a run directory
#[derive(Debug)]
pub struct DirectorySink {
    dir: PathBuf,
    fps: u16,
    save_frames: bool,
    save_merged: bool,
    merged: Vec<RgbImage>,
    written: Vec<PathBuf>,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>, fps: u16) -> Self {
        Self {
            dir: dir.into(),
            fps,
            save_frames: true,
            save_merged: false,
            merged: Vec::new(),
            written: Vec::new(),
        }
    }

    pub fn with_save_frames(mut self, save_frames: bool) -> Self {
        self.save_frames = save_frames;
        self
    }

    pub fn with_save_merged(mut self, save_merged: bool) -> Self {
        self.save_merged = save_merged;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Files and directories written so far
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }
}

/// `{repeat:02}-{seed}`
pub fn repeat_stem(repeat: usize, seed: u64) -> String {
    format!("{repeat:02}-{seed}")
}

impl OutputSink for DirectorySink {
    fn save(&mut self, output: &GenerationOutput) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|source| ConfigError::Write {
            path: self.dir.clone(),
            source,
        })?;
        let stem = repeat_stem(output.repeat, output.seed);

        if self.save_frames {
            let frames_dir = self.dir.join(&stem);
            media::save_frames(&output.frames, &frames_dir)?;
            self.written.push(frames_dir);
        }

        let images = output
            .frames
            .iter()
            .map(media::tensor_to_image)
            .collect::<Result<Vec<_>>>()?;
        let gif_path = self.dir.join(format!("{stem}.gif"));
        media::save_gif(&images, &gif_path, self.fps)?;
        info!(path = %gif_path.display(), frames = images.len(), "Saved animation");
        self.written.push(gif_path);

        if self.save_merged {
            self.merged.extend(images);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.save_merged && !self.merged.is_empty() {
            let path = self.dir.join("final.gif");
            media::save_gif(&self.merged, &path, self.fps)?;
            info!(path = %path.display(), frames = self.merged.len(), "Saved merged animation");
            self.written.push(path);
        }
        Ok(())
    }
}

/// The config as it was actually run
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub config: PromptConfig,
}

impl RunRecord {
    /// Replace the configured seeds with the concrete seed of each repeat.
    pub fn new(config: &PromptConfig, seeds: &[u64]) -> Self {
        let mut config = config.clone();
        if !seeds.is_empty() {
            config.seed = seeds.iter().map(|&s| s as i64).collect();
        }
        Self { config }
    }

    /// Write the config before any seed is drawn as `raw_prompt.json` into `dir`.
    pub fn write_raw(config: &PromptConfig, dir: &Path) -> Result<PathBuf> {
        write_config(config, dir, RAW_CONFIG_FILE)
    }

    /// Write `prompt.json` into `dir`, returning its path.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        write_config(&self.config, dir, CONFIG_FILE)
    }
}

pub const CONFIG_FILE: &str = "prompt.json";
pub const RAW_CONFIG_FILE: &str = "raw_prompt.json";

fn write_config(config: &PromptConfig, dir: &Path, name: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
        path: dir.to_path_buf(),
        source,
    })?;
    let path = dir.join(name);
    config.save(&path)?;
    info!(path = %path.display(), "Saved prompt config");
    Ok(path)
}
