//! Tests for prompt file loading and run validation
//!
//! Covers:
//! - Loading and saving the JSON prompt file
//! - `RunSettings::validate` defaults and overrides
//! - LoRA tag stripping and file selection
//! - Conditioning signal collection
//! - Rejected configurations

use candle_animate::config::{ConfigError, ControlNetEntry, SignalInput};
use candle_animate::context::MotionModuleVersion;
use candle_animate::input_image::{InputImage, RuntimeStaging};
use candle_animate::output::RunRecord;
use candle_animate::{
    FrameIndex, GenerateRequest, GenerationError, OverlapBlend, PromptConfig, RunSettings,
    SeedSpec, SignalKind,
};
use std::fs;
use std::path::Path;

// =============================================================================
// Helper functions
// =============================================================================

const EXAMPLE_CONFIG: &str = r#"{
    "name": "night walk",
    "path": "models/sd/toonyou.safetensors",
    "seed": [341774366206100, -1],
    "steps": 20,
    "guidance_scale": 8,
    "head_prompt": "masterpiece, best quality",
    "tail_prompt": "",
    "prompt_map": {
        "0": "a girl walking <lora:add_detail:0.6>",
        "16": "a girl running",
        "32": "a girl resting"
    },
    "n_prompt": ["worst quality"],
    "controlnet_map": {
        "input_image_dir": "controlnet_image/walk",
        "max_samples_on_vram": 100,
        "controlnet_openpose": {
            "enable": true,
            "controlnet_conditioning_scale": 0.8,
            "control_scale_list": [0.5, 0.25]
        },
        "controlnet_canny": {
            "enable": false
        }
    },
    "output": {"format": "gif", "fps": 12}
}"#;

fn write_config(dir: &Path, json: &str) -> std::path::PathBuf {
    let path = dir.join("prompt.json");
    fs::write(&path, json).unwrap();
    path
}

/// 4x4 RGB PNG with an optional `parameters` text chunk
fn write_generated_png(path: &Path, parameters: Option<&str>) {
    let file = fs::File::create(path).unwrap();
    let mut encoder = png::Encoder::new(std::io::BufWriter::new(file), 4, 4);
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    if let Some(text) = parameters {
        encoder
            .add_text_chunk("parameters".to_string(), text.to_string())
            .unwrap();
    }
    let mut writer = encoder.write_header().unwrap();
    writer.write_image_data(&[128u8; 4 * 4 * 3]).unwrap();
}

fn request(length: usize) -> GenerateRequest {
    GenerateRequest {
        length,
        ..GenerateRequest::default()
    }
}

// =============================================================================
// Loading
// =============================================================================

#[test]
fn test_load_example_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = PromptConfig::load(&write_config(dir.path(), EXAMPLE_CONFIG)).unwrap();

    assert_eq!(config.save_name(), "night_walk");
    assert_eq!(config.seed, vec![341774366206100, -1]);
    assert_eq!(config.guidance_scale, 8.0);
    assert_eq!(config.output.fps, 12);
    assert_eq!(config.controlnet_map.max_samples_on_vram, 100);
    assert_eq!(config.controlnet_map.signals.len(), 2);
    assert!(!config.controlnet_map.signals["controlnet_canny"].enable);
    assert!(!config.ip_adapter_map.enable);
}

#[test]
fn test_save_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let config = PromptConfig::load(&write_config(dir.path(), EXAMPLE_CONFIG)).unwrap();
    let saved = dir.path().join("saved.json");
    config.save(&saved).unwrap();

    let text = fs::read_to_string(&saved).unwrap();
    assert!(text.contains("\n    \"name\""), "expected 4-space indent");
    let reloaded = PromptConfig::load(&saved).unwrap();
    assert_eq!(reloaded.prompt_map, config.prompt_map);
    assert_eq!(reloaded.controlnet_map, config.controlnet_map);
}

#[test]
fn test_missing_file_is_read_error() {
    let err = PromptConfig::load(Path::new("/nonexistent/prompt.json")).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
}

#[test]
fn test_malformed_json_is_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = PromptConfig::load(&write_config(dir.path(), "{ not json")).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
}

#[test]
fn test_run_record_has_concrete_seeds() {
    let dir = tempfile::tempdir().unwrap();
    let config = PromptConfig::load(&write_config(dir.path(), EXAMPLE_CONFIG)).unwrap();
    let out = dir.path().join("run");
    let path = RunRecord::new(&config, &[341774366206100, 99]).write(&out).unwrap();

    let saved = PromptConfig::load(&path).unwrap();
    assert_eq!(saved.seed, vec![341774366206100, 99]);
    assert!(!saved.seed.contains(&-1));
}

#[test]
fn test_raw_config_keeps_random_seeds() {
    let dir = tempfile::tempdir().unwrap();
    let config = PromptConfig::load(&write_config(dir.path(), EXAMPLE_CONFIG)).unwrap();
    let out = dir.path().join("run");
    let raw = RunRecord::write_raw(&config, &out).unwrap();
    RunRecord::new(&config, &[341774366206100, 99]).write(&out).unwrap();

    assert_eq!(raw, out.join("raw_prompt.json"));
    let raw = PromptConfig::load(&raw).unwrap();
    assert_eq!(raw.seed, vec![341774366206100, -1]);
    let run = PromptConfig::load(&out.join("prompt.json")).unwrap();
    assert_eq!(run.seed, vec![341774366206100, 99]);
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_validate_example_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = PromptConfig::load(&write_config(dir.path(), EXAMPLE_CONFIG)).unwrap();
    let settings = RunSettings::validate(&config, &request(48)).unwrap();

    assert_eq!(settings.version, MotionModuleVersion::V2);
    assert_eq!(settings.schedule.settings().context, 16);
    assert_eq!(settings.schedule.settings().overlap, 4);
    assert_eq!(settings.steps, 20);
    assert_eq!(settings.negative_prompt(3), "worst quality");
    assert_eq!(settings.seeds.spec_for(0), SeedSpec::Fixed(341774366206100));
    assert_eq!(settings.seeds.spec_for(1), SeedSpec::Random);
    assert_eq!(settings.blend, OverlapBlend::Ramp);

    let text = settings.timeline.resolve(FrameIndex::new(3)).unwrap().text;
    assert_eq!(&*text, "masterpiece, best quality,a girl walking ");
    assert!(!text.contains("<lora"));
}

#[test]
fn test_cli_overrides_win() {
    let config = PromptConfig {
        prompt_map: [("0".to_string(), "a".to_string())].into(),
        context: Some(12),
        overlap: Some(2),
        ..PromptConfig::default()
    };
    let settings = RunSettings::validate(
        &config,
        &GenerateRequest {
            length: 64,
            context: Some(8),
            motion_module_version: Some(MotionModuleVersion::V1),
            ..GenerateRequest::default()
        },
    )
    .unwrap();
    assert_eq!(settings.schedule.settings().context, 8);
    assert_eq!(settings.schedule.settings().overlap, 2);
    assert_eq!(settings.version, MotionModuleVersion::V1);
}

#[test]
fn test_controlnet_signals_are_collected() {
    let dir = tempfile::tempdir().unwrap();
    let config = PromptConfig::load(&write_config(dir.path(), EXAMPLE_CONFIG)).unwrap();
    let settings = RunSettings::validate(&config, &request(48)).unwrap();

    assert_eq!(settings.signals.len(), 2);
    let pose = settings
        .signals
        .iter()
        .find(|s| s.name == "controlnet_openpose")
        .unwrap();
    assert!(pose.enabled);
    assert_eq!(pose.kind, SignalKind::ControlNet);
    assert_eq!(pose.params.scale, 0.8);
    assert_eq!(pose.params.scale_list, vec![0.5, 0.25]);
    assert_eq!(
        pose.input,
        SignalInput::FrameDir("controlnet_image/walk/controlnet_openpose".into())
    );

    let canny = settings.signals.iter().find(|s| s.name == "controlnet_canny").unwrap();
    assert!(!canny.enabled);
}

#[test]
fn test_reference_and_ip_adapter_signals() {
    let config: PromptConfig = serde_json::from_str(
        r#"{
            "prompt_map": {"0": "a"},
            "controlnet_map": {
                "controlnet_ref": {"enable": true, "ref_image": "ref/face.png", "style_fidelity": 0.7}
            },
            "ip_adapter_map": {"enable": true, "input_image_dir": "ip/test", "scale": 0.6}
        }"#,
    )
    .unwrap();
    let settings = RunSettings::validate(&config, &request(16)).unwrap();

    let reference = settings.signals.iter().find(|s| s.name == "controlnet_ref").unwrap();
    assert_eq!(reference.kind, SignalKind::Reference);
    assert_eq!(reference.params.scale, 0.7);
    assert_eq!(reference.input, SignalInput::Image("ref/face.png".into()));

    let ip = settings.signals.iter().find(|s| s.name == "ip_adapter").unwrap();
    assert_eq!(ip.kind, SignalKind::IpAdapter);
    assert_eq!(ip.params.scale, 0.6);
}

#[test]
fn test_unknown_controlnet_fails() {
    let config: PromptConfig = serde_json::from_str(
        r#"{"prompt_map": {"0": "a"}, "controlnet_map": {"controlnet_xray": {"enable": true}}}"#,
    )
    .unwrap();
    let err = RunSettings::validate(&config, &request(16)).unwrap_err();
    assert!(matches!(err, GenerationError::UnknownSignal { ref name } if name == "controlnet_xray"));
}

#[test]
fn test_negative_seed_fails() {
    let config = PromptConfig {
        prompt_map: [("0".to_string(), "a".to_string())].into(),
        seed: vec![1, -5],
        ..PromptConfig::default()
    };
    let err = RunSettings::validate(&config, &request(16)).unwrap_err();
    assert!(matches!(
        err,
        GenerationError::Config(ConfigError::NegativeSeed { index: 1, value: -5 })
    ));
}

#[test]
fn test_bad_dimensions_and_repeats_fail() {
    let config = PromptConfig {
        prompt_map: [("0".to_string(), "a".to_string())].into(),
        ..PromptConfig::default()
    };
    let err = RunSettings::validate(
        &config,
        &GenerateRequest {
            width: 500,
            ..GenerateRequest::default()
        },
    )
    .unwrap_err();
    assert!(matches!(
        err,
        GenerationError::Config(ConfigError::InvalidDimensions { width: 500, .. })
    ));

    let err = RunSettings::validate(
        &config,
        &GenerateRequest {
            repeats: 0,
            ..GenerateRequest::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, GenerationError::Config(ConfigError::InvalidRepeats(0))));
}

#[test]
fn test_empty_prompt_map_fails() {
    let err = RunSettings::validate(&PromptConfig::default(), &request(16)).unwrap_err();
    assert!(matches!(err, GenerationError::EmptyPromptTimeline { duration: 16 }));
}

#[test]
fn test_non_numeric_frame_key_fails() {
    let config = PromptConfig {
        prompt_map: [("start".to_string(), "a".to_string())].into(),
        ..PromptConfig::default()
    };
    let err = RunSettings::validate(&config, &request(16)).unwrap_err();
    assert!(matches!(
        err,
        GenerationError::Config(ConfigError::InvalidFrameKey { .. })
    ));
}

// =============================================================================
// LoRA
// =============================================================================

#[test]
fn test_lora_tags_select_files() {
    let dir = tempfile::tempdir().unwrap();
    let lora_dir = dir.path().join("lora");
    fs::create_dir_all(lora_dir.join("style")).unwrap();
    fs::write(lora_dir.join("add_detail.safetensors"), b"").unwrap();
    fs::write(lora_dir.join("style/watercolor.safetensors"), b"").unwrap();
    fs::write(lora_dir.join("notes.txt"), b"").unwrap();

    let config = PromptConfig {
        prompt_map: [
            ("0".to_string(), "a <lora:add_detail:0.6>".to_string()),
            ("8".to_string(), "b <lora:watercolor:1.0> <lora:missing:0.3>".to_string()),
        ]
        .into(),
        lora_map: [("models/lora/fixed.safetensors".to_string(), 0.4)].into(),
        lora_path: Some(lora_dir.clone()),
        ..PromptConfig::default()
    };
    let settings = RunSettings::validate(&config, &request(16)).unwrap();

    assert_eq!(settings.lora.len(), 3);
    assert_eq!(settings.lora[&lora_dir.join("add_detail.safetensors")], 0.6);
    assert_eq!(settings.lora[&lora_dir.join("style/watercolor.safetensors")], 1.0);
    assert_eq!(settings.lora[Path::new("models/lora/fixed.safetensors")], 0.4);

    let text = settings.timeline.resolve(FrameIndex::new(9)).unwrap().text;
    assert!(!text.contains("lora"));
}

// =============================================================================
// Input image
// =============================================================================

const IMAGE_PARAMETERS: &str =
    "blue sky\nNegative prompt: blurry\nSteps: 20, Sampler: Euler a, Seed: 777, Model: toonyou";

#[test]
fn test_input_image_is_merged_during_validation() {
    let dir = tempfile::tempdir().unwrap();
    let image_path = dir.path().join("00-555.png");
    write_generated_png(&image_path, Some(IMAGE_PARAMETERS));

    let config = PromptConfig {
        prompt_map: [
            ("0".to_string(), "a cat".to_string()),
            ("8".to_string(), "a dog".to_string()),
        ]
        .into(),
        n_prompt: vec!["worst quality".to_string()],
        seed: vec![-1, 3],
        ..PromptConfig::default()
    };
    let request = GenerateRequest {
        input_image: Some(InputImage::load(&image_path).unwrap()),
        ..request(16)
    };
    let settings = RunSettings::validate(&config, &request).unwrap();

    let text = settings.timeline.resolve(FrameIndex::new(9)).unwrap().text;
    assert_eq!(&*text, "blue sky a dog");
    assert_eq!(settings.negative_prompt(0), "blurry worst quality");
    assert_eq!(settings.seeds.spec_for(0), SeedSpec::Fixed(777));
    assert_eq!(settings.seeds.spec_for(1), SeedSpec::Fixed(777));

    let effective = request.effective_config(&config);
    assert_eq!(effective.seed, vec![777, 777]);
    assert_eq!(config.seed, vec![-1, 3]);
}

#[test]
fn test_input_image_without_parameters_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let image_path = dir.path().join("plain.png");
    write_generated_png(&image_path, None);

    let image = InputImage::load(&image_path).unwrap();
    assert!(image.parameters.is_none());

    let config = PromptConfig {
        prompt_map: [("0".to_string(), "a cat".to_string())].into(),
        seed: vec![4],
        ..PromptConfig::default()
    };
    let settings = RunSettings::validate(
        &config,
        &GenerateRequest {
            input_image: Some(image),
            ..request(16)
        },
    )
    .unwrap();
    let text = settings.timeline.resolve(FrameIndex::new(0)).unwrap().text;
    assert_eq!(&*text, "a cat");
    assert_eq!(settings.seeds.spec_for(0), SeedSpec::Fixed(4));
}

#[test]
fn test_missing_input_image_is_read_error() {
    let err = InputImage::load(Path::new("/nonexistent/in.png")).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
}

#[test]
fn test_input_image_staged_for_runtime_controlnet() {
    let dir = tempfile::tempdir().unwrap();
    let image_path = dir.path().join("in.png");
    write_generated_png(&image_path, Some(IMAGE_PARAMETERS));
    let runtime = dir.path().join("controlnet_image/runtime");
    fs::create_dir_all(runtime.join("controlnet_canny")).unwrap();
    fs::write(runtime.join("controlnet_canny/0004.png"), b"stale").unwrap();

    let mut config = PromptConfig::default();
    config.controlnet_map.input_image_dir = runtime.clone();
    config.controlnet_map.signals.insert(
        "controlnet_openpose".to_string(),
        ControlNetEntry {
            enable: true,
            ..ControlNetEntry::default()
        },
    );
    config.controlnet_map.signals.insert(
        "controlnet_canny".to_string(),
        ControlNetEntry {
            enable: false,
            ..ControlNetEntry::default()
        },
    );

    let image = InputImage::load(&image_path).unwrap();
    let staged = image
        .stage_runtime_controlnet(&config, RuntimeStaging { fix: 2, flip: true })
        .unwrap();

    assert_eq!(
        staged,
        vec![
            runtime.join("controlnet_openpose/0000.png"),
            runtime.join("controlnet_openpose/0008.png"),
        ]
    );
    assert!(staged.iter().all(|p| p.is_file()));
    assert!(!runtime.join("controlnet_canny").exists());
    assert_eq!(image::image_dimensions(&staged[0]).unwrap(), (4, 4));
}
