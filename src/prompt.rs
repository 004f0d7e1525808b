//! Prompt timeline ("prompt travel")
//!
//! Prompts are given at sparse keyframes. Every other frame holds the text of
//! the closest keyframe at or before it; frames before the first keyframe use
//! the first keyframe. Text is never averaged; embedding interpolation, if
//! any, is left to the denoiser.

use candle_core::Tensor;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::context::ContextWindow;
use crate::error::{GenerationError, Result};
use crate::frame::{FrameIndex, FrameSpace};

/// Turns prompt text into conditioning embeddings (a text encoder).
pub trait PromptEncoder {
    /// Returns hidden states for one prompt, typically `[L, D]`
    fn encode(&mut self, text: &str) -> candle_core::Result<Tensor>;
}

/// Join head, body and tail with `,`, skipping empty parts.
pub fn decorate(head: &str, text: &str, tail: &str) -> String {
    [head, text, tail]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone)]
pub struct PromptKeyframe {
    frame: FrameIndex,
    /// Text as configured
    raw: String,
    /// Text with head/tail decoration applied
    text: Arc<str>,
    embedding: Option<Tensor>,
}

impl PromptKeyframe {
    pub fn frame(&self) -> FrameIndex {
        self.frame
    }

    pub fn raw_text(&self) -> &str {
        &self.raw
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn embedding(&self) -> Option<&Tensor> {
        self.embedding.as_ref()
    }
}

/// The effective prompt of one frame
#[derive(Debug, Clone)]
pub struct ResolvedPrompt {
    pub frame: FrameIndex,
    /// Keyframe the text was taken from
    pub keyframe: FrameIndex,
    pub text: Arc<str>,
    pub embedding: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub struct PromptTimeline {
    space: FrameSpace,
    /// Sorted by frame, unique
    keyframes: Vec<PromptKeyframe>,
    head: String,
    tail: String,
}

impl PromptTimeline {
    /// Build a timeline from `(frame, text)` entries.
    ///
    /// Entries at or past the end of `space` are dropped. A later entry for the
    /// same frame replaces an earlier one. Fails when nothing is left.
    pub fn new<I, S>(space: FrameSpace, entries: I, head: &str, tail: &str) -> Result<Self>
    where
        I: IntoIterator<Item = (FrameIndex, S)>,
        S: Into<String>,
    {
        let mut sorted = BTreeMap::new();
        for (frame, text) in entries {
            if !space.contains(frame) {
                debug!(
                    frame = frame.get(),
                    duration = space.duration(),
                    "Dropping prompt keyframe past the end of the animation"
                );
                continue;
            }
            sorted.insert(frame, text.into());
        }

        if sorted.is_empty() {
            return Err(GenerationError::EmptyPromptTimeline {
                duration: space.duration(),
            });
        }

        let keyframes = sorted
            .into_iter()
            .map(|(frame, raw): (FrameIndex, String)| PromptKeyframe {
                frame,
                text: Arc::from(decorate(head, &raw, tail)),
                raw,
                embedding: None,
            })
            .collect();

        Ok(Self {
            space,
            keyframes,
            head: head.to_string(),
            tail: tail.to_string(),
        })
    }

    pub fn space(&self) -> FrameSpace {
        self.space
    }

    pub fn keyframes(&self) -> &[PromptKeyframe] {
        &self.keyframes
    }

    pub fn head(&self) -> &str {
        &self.head
    }

    pub fn tail(&self) -> &str {
        &self.tail
    }

    /// Keyframe governing `frame`: greatest keyframe `<= frame`, else the first.
    fn governing(&self, frame: FrameIndex) -> &PromptKeyframe {
        let after = self.keyframes.partition_point(|k| k.frame <= frame);
        &self.keyframes[after.saturating_sub(1)]
    }

    pub fn resolve(&self, frame: FrameIndex) -> Result<ResolvedPrompt> {
        let frame = self.space.check(frame)?;
        let keyframe = self.governing(frame);
        Ok(ResolvedPrompt {
            frame,
            keyframe: keyframe.frame,
            text: Arc::clone(&keyframe.text),
            embedding: keyframe.embedding.clone(),
        })
    }

    pub fn resolve_frames(&self, frames: &[FrameIndex]) -> Result<Vec<ResolvedPrompt>> {
        frames.iter().map(|&frame| self.resolve(frame)).collect()
    }

    pub fn resolve_window(&self, window: &ContextWindow) -> Result<Vec<ResolvedPrompt>> {
        self.resolve_frames(window.frames())
    }

    /// Encode every keyframe that has no embedding yet, once.
    pub fn encode_with(&mut self, encoder: &mut dyn PromptEncoder) -> Result<()> {
        for keyframe in self.keyframes.iter_mut().filter(|k| k.embedding.is_none()) {
            keyframe.embedding = Some(encoder.encode(&keyframe.text)?);
        }
        Ok(())
    }

    /// Decorated text per keyframe, as handed to the denoiser.
    pub fn decorated_map(&self) -> BTreeMap<FrameIndex, String> {
        self.keyframes
            .iter()
            .map(|k| (k.frame, k.text.to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decorate_skips_empty_parts() {
        assert_eq!(decorate("best quality", "a cat", ""), "best quality,a cat");
        assert_eq!(decorate("", "a cat", "night"), "a cat,night");
        assert_eq!(decorate("", "a cat", ""), "a cat");
    }

    #[test]
    fn test_duplicate_frames_keep_last() {
        let space = FrameSpace::new(8).unwrap();
        let timeline = PromptTimeline::new(
            space,
            [(FrameIndex::new(2), "first"), (FrameIndex::new(2), "second")],
            "",
            "",
        )
        .unwrap();
        assert_eq!(timeline.keyframes().len(), 1);
        assert_eq!(timeline.keyframes()[0].text(), "second");
    }
}
