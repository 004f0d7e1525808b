//! Tests for the prompt timeline
//!
//! Covers hold-last-value resolution, head/tail decoration, window
//! resolution, rejected inputs and embedding caching.

use candle_animate::context::{ContextSchedule, ContextSettings};
use candle_animate::prompt::PromptEncoder;
use candle_animate::{FrameIndex, FrameSpace, GenerationError, PromptTimeline};
use candle_core::{Device, Tensor};

// =============================================================================
// Helper functions
// =============================================================================

fn timeline(duration: usize, entries: &[(usize, &str)]) -> PromptTimeline {
    let space = FrameSpace::new(duration).unwrap();
    PromptTimeline::new(
        space,
        entries.iter().map(|&(f, t)| (FrameIndex::new(f), t)),
        "",
        "",
    )
    .unwrap()
}

fn text_at(timeline: &PromptTimeline, frame: usize) -> String {
    timeline
        .resolve(FrameIndex::new(frame))
        .unwrap()
        .text
        .to_string()
}

/// Counts calls; returns a 1-element tensor holding the text length
struct CountingEncoder {
    calls: usize,
}

impl PromptEncoder for CountingEncoder {
    fn encode(&mut self, text: &str) -> candle_core::Result<Tensor> {
        self.calls += 1;
        Tensor::new(&[text.len() as f32], &Device::Cpu)
    }
}

// =============================================================================
// Resolution
// =============================================================================

#[test]
fn test_hold_last_value() {
    let timeline = timeline(12, &[(0, "a"), (5, "b"), (10, "c")]);
    let expected = ["a", "a", "a", "a", "a", "b", "b", "b", "b", "b", "c", "c"];
    for (frame, want) in expected.iter().enumerate() {
        assert_eq!(text_at(&timeline, frame), *want, "frame {frame}");
    }
}

#[test]
fn test_frames_before_first_keyframe_use_first() {
    let timeline = timeline(8, &[(3, "late start"), (6, "end")]);
    assert_eq!(text_at(&timeline, 0), "late start");
    assert_eq!(text_at(&timeline, 2), "late start");
    assert_eq!(text_at(&timeline, 7), "end");
}

#[test]
fn test_resolved_prompt_names_keyframe() {
    let timeline = timeline(12, &[(0, "a"), (5, "b")]);
    let resolved = timeline.resolve(FrameIndex::new(7)).unwrap();
    assert_eq!(resolved.frame, FrameIndex::new(7));
    assert_eq!(resolved.keyframe, FrameIndex::new(5));
}

#[test]
fn test_keyframes_past_the_end_are_dropped() {
    let timeline = timeline(8, &[(0, "a"), (16, "never")]);
    assert_eq!(timeline.keyframes().len(), 1);
    assert_eq!(text_at(&timeline, 7), "a");
}

#[test]
fn test_head_and_tail_are_joined() {
    let space = FrameSpace::new(4).unwrap();
    let timeline = PromptTimeline::new(
        space,
        [(FrameIndex::new(0), "a cat")],
        "masterpiece, best quality",
        "night",
    )
    .unwrap();
    assert_eq!(text_at(&timeline, 3), "masterpiece, best quality,a cat,night");
    assert_eq!(timeline.keyframes()[0].raw_text(), "a cat");
}

#[test]
fn test_resolve_window_follows_window_frames() {
    let timeline = timeline(32, &[(0, "a"), (20, "b")]);
    let schedule = ContextSchedule::new(
        timeline.space(),
        ContextSettings {
            context: 16,
            overlap: 4,
            stride: 0,
        },
    )
    .unwrap();
    let second = &schedule.windows()[1];
    let prompts = timeline.resolve_window(second).unwrap();
    assert_eq!(prompts.len(), second.len());
    assert_eq!(prompts[0].frame, second.first());
    assert_eq!(&*prompts[0].text, "a");
    assert_eq!(&*prompts.last().unwrap().text, "b");
}

// =============================================================================
// Errors
// =============================================================================

#[test]
fn test_empty_timeline_fails() {
    let space = FrameSpace::new(8).unwrap();
    let err = PromptTimeline::new(space, Vec::<(FrameIndex, String)>::new(), "", "").unwrap_err();
    assert!(matches!(err, GenerationError::EmptyPromptTimeline { duration: 8 }));
}

#[test]
fn test_only_out_of_range_keyframes_fails() {
    let space = FrameSpace::new(8).unwrap();
    let err = PromptTimeline::new(space, [(FrameIndex::new(9), "x")], "", "").unwrap_err();
    assert!(matches!(err, GenerationError::EmptyPromptTimeline { .. }));
}

#[test]
fn test_resolve_out_of_range_fails() {
    let timeline = timeline(8, &[(0, "a")]);
    let err = timeline.resolve(FrameIndex::new(8)).unwrap_err();
    assert!(matches!(
        err,
        GenerationError::IndexOutOfRange {
            index: 8,
            duration: 8
        }
    ));
}

// =============================================================================
// Embeddings
// =============================================================================

#[test]
fn test_each_keyframe_is_encoded_once() -> candle_core::Result<()> {
    let mut timeline = timeline(12, &[(0, "a"), (5, "bb"), (10, "ccc")]);
    let mut encoder = CountingEncoder { calls: 0 };
    timeline.encode_with(&mut encoder).unwrap();
    timeline.encode_with(&mut encoder).unwrap();
    assert_eq!(encoder.calls, 3);

    let resolved = timeline.resolve(FrameIndex::new(7)).unwrap();
    let embedding = resolved.embedding.expect("embedding should be set");
    assert_eq!(embedding.to_vec1::<f32>()?, vec![2.0]);
    Ok(())
}
