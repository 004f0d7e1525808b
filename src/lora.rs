//! LoRA selection from prompt tags
//!
//! Prompts may carry `<lora:NAME:WEIGHT>` tags. The tags are stripped from the
//! text and the requested names are matched by file stem against the
//! `.safetensors` files of a LoRA directory. Merging the weights into the
//! network is the model backend's job.

use regex::Regex;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq)]
pub struct LoraTag {
    pub name: String,
    pub weight: f32,
}

fn lora_tag_regex() -> &'static Regex {
    static LORA_TAG_RE: OnceLock<Regex> = OnceLock::new();
    LORA_TAG_RE.get_or_init(|| {
        Regex::new(r"<lora:([^:>]+):([0-9.]+)>").expect("lora tag regex should compile")
    })
}

/// Remove LoRA tags from `prompt`, returning the cleaned text and the tags.
///
/// Tags whose weight does not parse as a number are left in the text.
pub fn extract_lora_tags(prompt: &str) -> (String, Vec<LoraTag>) {
    let re = lora_tag_regex();
    let mut tags = Vec::new();
    let cleaned = re.replace_all(prompt, |caps: &regex::Captures<'_>| {
        match caps[2].parse::<f32>() {
            Ok(weight) => {
                tags.push(LoraTag {
                    name: caps[1].to_string(),
                    weight,
                });
                String::new()
            }
            Err(_) => caps[0].to_string(),
        }
    });
    (cleaned.into_owned(), tags)
}

/// All `.safetensors` files under `dir`, recursively, sorted.
///
/// Symlinked directories are not followed.
pub fn discover_lora_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().is_some_and(|ext| ext == "safetensors") {
            files.push(path.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

/// Match requested LoRA names against file stems.
///
/// Names without a matching file are skipped; they are reported back so the
/// caller can log them.
pub fn select_lora_files(
    requested: &BTreeMap<String, f32>,
    available: &[PathBuf],
) -> (BTreeMap<PathBuf, f32>, Vec<String>) {
    let mut selected = BTreeMap::new();
    for path in available {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some(&weight) = requested.get(stem) {
            selected.insert(path.clone(), weight);
        }
    }

    let missing = requested
        .keys()
        .filter(|name| {
            !selected
                .keys()
                .any(|p| p.file_stem().and_then(|s| s.to_str()) == Some(name.as_str()))
        })
        .cloned()
        .collect();

    (selected, missing)
}
