//! Tests for image I/O and run output
//!
//! Covers frame-numbered conditioning directories, PNG/GIF writing and the
//! directory layout produced by `DirectorySink`.

use candle_animate::conditioning::SignalParams;
use candle_animate::config::{SignalInput, SignalSpec};
use candle_animate::media;
use candle_animate::output::{DirectorySink, OutputSink, repeat_stem};
use candle_animate::pipeline::GenerationOutput;
use candle_animate::{FrameIndex, FrameSpace, SignalKind};
use candle_core::{DType, Device, Tensor};
use image::{Rgb, RgbImage};
use std::fs;
use std::path::Path;

// =============================================================================
// Helper functions
// =============================================================================

fn write_png(path: &Path, width: u32, height: u32, value: u8) {
    RgbImage::from_pixel(width, height, Rgb([value, value, value]))
        .save(path)
        .unwrap();
}

fn create_test_output(repeat: usize, seed: u64, frames: usize) -> GenerationOutput {
    GenerationOutput {
        repeat,
        seed,
        negative_prompt: String::new(),
        frames: (0..frames)
            .map(|i| Tensor::full(i as f32 / frames as f32, (3, 8, 8), &Device::Cpu).unwrap())
            .collect(),
    }
}

fn spec(name: &str, kind: SignalKind, input: SignalInput) -> SignalSpec {
    SignalSpec {
        name: name.to_string(),
        kind,
        enabled: true,
        params: SignalParams::default(),
        input,
    }
}

// =============================================================================
// Reading
// =============================================================================

#[test]
fn test_load_frame_map_keys_by_frame_number() {
    let dir = tempfile::tempdir().unwrap();
    write_png(&dir.path().join("0000.png"), 16, 16, 0);
    write_png(&dir.path().join("0004.png"), 16, 16, 255);
    write_png(&dir.path().join("0099.png"), 16, 16, 0);
    write_png(&dir.path().join("ref.png"), 16, 16, 0);
    fs::write(dir.path().join("0002.txt"), b"not an image").unwrap();

    let space = FrameSpace::new(8).unwrap();
    let frames = media::load_frame_map(dir.path(), space, 8, 8, &Device::Cpu).unwrap();

    let keys: Vec<usize> = frames.keys().map(|f| f.get()).collect();
    assert_eq!(keys, vec![0, 4]);
    let white = &frames[&FrameIndex::new(4)];
    assert_eq!(white.dims(), &[3, 8, 8]);
    let mean = white.mean_all().unwrap().to_scalar::<f32>().unwrap();
    assert!((mean - 1.0).abs() < 1e-3);
}

#[test]
fn test_missing_directory_is_empty() {
    let space = FrameSpace::new(8).unwrap();
    let frames = media::load_frame_map(Path::new("/nonexistent/cn"), space, 8, 8, &Device::Cpu).unwrap();
    assert!(frames.is_empty());
}

#[test]
fn test_load_conditioning_registers_every_signal() {
    let dir = tempfile::tempdir().unwrap();
    let pose_dir = dir.path().join("controlnet_openpose");
    fs::create_dir_all(&pose_dir).unwrap();
    write_png(&pose_dir.join("0000.png"), 8, 8, 10);
    write_png(&pose_dir.join("0008.png"), 8, 8, 10);
    let ref_image = dir.path().join("ref.png");
    write_png(&ref_image, 12, 12, 200);

    let specs = vec![
        spec("controlnet_openpose", SignalKind::ControlNet, SignalInput::FrameDir(pose_dir)),
        spec("controlnet_ref", SignalKind::Reference, SignalInput::Image(ref_image)),
        spec(
            "ip_adapter",
            SignalKind::IpAdapter,
            SignalInput::FrameDir(dir.path().join("missing")),
        ),
    ];
    let space = FrameSpace::new(16).unwrap();
    let aligner = media::load_conditioning(&specs, space, 8, 8, &Device::Cpu, &[]).unwrap();

    assert_eq!(aligner.names().count(), 3);
    let active: Vec<&str> = aligner.active_names().collect();
    assert_eq!(active, vec!["controlnet_openpose", "controlnet_ref"]);

    let reference = aligner
        .align_frames(&[FrameIndex::new(5)], "controlnet_ref")
        .unwrap()
        .unwrap();
    assert!(reference.broadcast);
    assert_eq!(reference.entries[0].tensor().unwrap().dims(), &[3, 8, 8]);
}

#[test]
fn test_list_numbered_frames_is_sorted() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["00000002.png", "00000000.png", "00000001.png", "cover.png"] {
        write_png(&dir.path().join(name), 4, 4, 0);
    }
    let frames = media::list_numbered_frames(dir.path()).unwrap();
    let names: Vec<_> = frames
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["00000000.png", "00000001.png", "00000002.png"]);
}

// =============================================================================
// Writing
// =============================================================================

#[test]
fn test_save_gif_writes_gif() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("anim.gif");
    let images = vec![RgbImage::new(8, 8), RgbImage::from_pixel(8, 8, Rgb([255, 0, 0]))];
    media::save_gif(&images, &path, 8).unwrap();

    let bytes = fs::read(&path).unwrap();
    assert!(bytes.starts_with(b"GIF89a"));
}

#[test]
fn test_directory_sink_layout() {
    let dir = tempfile::tempdir().unwrap();
    let mut sink = DirectorySink::new(dir.path(), 8).with_save_merged(true);
    sink.save(&create_test_output(0, 1234, 4)).unwrap();
    sink.save(&create_test_output(1, 99, 4)).unwrap();
    sink.finish().unwrap();

    assert_eq!(repeat_stem(0, 1234), "00-1234");
    assert!(dir.path().join("00-1234/00000000.png").is_file());
    assert!(dir.path().join("00-1234/00000003.png").is_file());
    assert!(dir.path().join("00-1234.gif").is_file());
    assert!(dir.path().join("01-99.gif").is_file());
    assert!(dir.path().join("final.gif").is_file());
    assert_eq!(sink.written().len(), 5);
}

#[test]
fn test_directory_sink_without_frames() {
    let dir = tempfile::tempdir().unwrap();
    let mut sink = DirectorySink::new(dir.path(), 8).with_save_frames(false);
    sink.save(&create_test_output(0, 7, 2)).unwrap();
    sink.finish().unwrap();

    assert!(!dir.path().join("00-7").exists());
    assert!(dir.path().join("00-7.gif").is_file());
    assert!(!dir.path().join("final.gif").exists());
}

#[test]
fn test_saved_frames_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let frame = Tensor::ones((3, 8, 8), DType::F32, &Device::Cpu).unwrap();
    media::save_frames(std::slice::from_ref(&frame), dir.path()).unwrap();

    let loaded = media::load_image(&dir.path().join("00000000.png"), &Device::Cpu).unwrap();
    assert_eq!(loaded.dims(), &[3, 8, 8]);
    let mean = loaded.mean_all().unwrap().to_scalar::<f32>().unwrap();
    assert!((mean - 1.0).abs() < 1e-6);
}
