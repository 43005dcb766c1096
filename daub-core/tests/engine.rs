mod common;

use common::{sketch, small_canvas, FakeBackend, GpuProbe, RTX};
use daub_core::{
    DaubError, DeviceMap, Engine, EngineConfig, GenerationRequest, ImageSource, LoadStage,
    PreimageGenerator, Precision, DEFAULT_PREIMAGE_MODEL, PREIMAGE_STEPS,
};
use image::DynamicImage;
use rstest::rstest;

fn engine(backend: &FakeBackend) -> Engine<FakeBackend> {
    Engine::new(backend.clone(), small_canvas(), &RTX).unwrap()
}

fn png_bytes(image: &DynamicImage) -> Vec<u8> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

#[test]
fn builds_in_order_and_returns_canvas_sized_images() {
    let backend = FakeBackend::default();
    let mut engine = engine(&backend);

    let session = engine.select_model("Dreamshaper7").unwrap();
    assert_eq!(session.backend_id(), "Lykon/dreamshaper-7");
    assert!(!session.uses_image_prompt());
    assert_eq!(session.canvas_size(), (64, 48));
    let result = session
        .infer(&GenerationRequest::new("a house", sketch(), 1337))
        .unwrap();
    assert_eq!((result.image.width(), result.image.height()), (64, 48));

    let state = backend.state();
    assert_eq!(
        state.events,
        vec![
            "from_pretrained Lykon/dreamshaper-7 Sd15 ImageToImage fp16",
            "use_lcm_scheduler",
            "load_lora_weights latent-consistency/lcm-lora-sdv1-5",
            "fuse_lora",
            "to Accelerator fp16",
        ]
    );
    let run = &state.runs[0];
    assert_eq!(run.prompt, "a house");
    assert_eq!(run.with_image, Some((64, 48)));
    assert_eq!((run.steps, run.guidance_scale, run.strength), (4, 1.0, 0.9));
    assert_eq!(run.seed, Some(1337));
    assert!(!run.with_reference);
}

#[test]
fn xl_model_gets_xl_adapters() {
    let backend = FakeBackend::default();
    let mut engine = engine(&backend);
    let session = engine.select_model("SDXL").unwrap();
    assert_eq!(session.adapters().lora_id, "latent-consistency/lcm-lora-sdxl");
    assert!(backend
        .state()
        .events
        .contains(&"load_lora_weights latent-consistency/lcm-lora-sdxl".to_string()));
}

#[test]
fn same_request_is_deterministic() {
    let backend = FakeBackend::default();
    let mut engine = engine(&backend);
    let session = engine.select_model("Dreamshaper7").unwrap();

    let request = GenerationRequest::new("a house", sketch(), 42);
    let first = session.infer(&request).unwrap();
    let second = session.infer(&request).unwrap();
    assert_eq!(png_bytes(&first.image), png_bytes(&second.image));

    let other = session
        .infer(&GenerationRequest {
            seed: 43,
            ..request.clone()
        })
        .unwrap();
    assert_ne!(png_bytes(&first.image), png_bytes(&other.image));
}

fn tweaked(change: impl FnOnce(&mut GenerationRequest)) -> GenerationRequest {
    let mut request = GenerationRequest::new("a", sketch(), 1);
    change(&mut request);
    request
}

#[rstest]
#[case::zero_steps(tweaked(|r| r.steps = 0))]
#[case::zero_strength(tweaked(|r| r.strength = 0.0))]
#[case::negative_guidance(tweaked(|r| r.guidance_scale = -2.0))]
#[case::infinite_ip_scale(tweaked(|r| r.ip_scale = f64::INFINITY))]
fn invalid_requests_never_reach_the_backend(#[case] request: GenerationRequest) {
    let backend = FakeBackend::default();
    let mut engine = engine(&backend);
    let session = engine.select_model("Dreamshaper7").unwrap();
    assert!(matches!(
        session.infer(&request),
        Err(DaubError::InvalidParameters(_))
    ));
    assert!(backend.state().runs.is_empty());
}

#[test]
fn undecodable_input_is_an_inference_error() {
    let backend = FakeBackend::default();
    let mut engine = engine(&backend);
    let session = engine.select_model("Dreamshaper7").unwrap();
    let request = GenerationRequest::new("a", ImageSource::Bytes(vec![0, 1, 2]), 1);
    assert!(matches!(session.infer(&request), Err(DaubError::Inference(_))));
    assert!(backend.state().runs.is_empty());
}

#[test]
fn backend_failure_surfaces_as_inference_error() {
    let backend = FakeBackend::default();
    let mut engine = engine(&backend);
    let session = engine.select_model("Dreamshaper7").unwrap();
    backend.state().fail_run = true;

    let err = session
        .infer(&GenerationRequest::new("a", sketch(), 1))
        .unwrap_err();
    assert!(matches!(err, DaubError::Inference(_)));
}

#[test]
fn switching_models_keeps_one_pipeline_resident() {
    let backend = FakeBackend::default();
    let mut engine = engine(&backend);
    for name in ["Dreamshaper7", "Dreamshaper8", "AbsoluteReality", "SDXL", "Dreamshaper7"] {
        engine.select_model(name).unwrap();
        assert_eq!(backend.state().live, 1);
    }
    {
        let state = backend.state();
        assert_eq!(state.built, 5);
        assert_eq!(state.peak, 1);
    }
    engine.unload();
    assert_eq!(backend.state().live, 0);
    assert!(engine.session().is_none());
}

#[test]
fn unknown_model_keeps_the_current_session() {
    let backend = FakeBackend::default();
    let mut engine = engine(&backend);
    engine.select_model("RevAnimated").unwrap();

    match engine.select_model("Nonexistent") {
        Err(DaubError::UnknownModel(name)) => assert_eq!(name, "Nonexistent"),
        other => panic!("unexpected result: {:?}", other.map(|s| s.backend_id().to_string())),
    }
    let state = backend.state();
    assert_eq!(state.built, 1);
    assert_eq!(state.live, 1);
    drop(state);
    assert_eq!(
        engine.session().map(|s| s.backend_id().to_string()),
        Some("danbrown/RevAnimated-v1-2-2".to_string())
    );
}

#[test]
fn missing_reference_fails_before_loading() {
    let backend = FakeBackend::default();
    let config = EngineConfig {
        use_image_prompt: true,
        ..small_canvas()
    };
    let mut engine = Engine::new(backend.clone(), config, &RTX).unwrap();
    assert!(matches!(
        engine.select_model("Dreamshaper7"),
        Err(DaubError::MissingReferenceImage)
    ));
    let state = backend.state();
    assert_eq!(state.built, 0);
    assert!(state.events.is_empty());
}

#[test]
fn unreadable_reference_is_a_load_error() {
    let backend = FakeBackend::default();
    let config = EngineConfig {
        use_image_prompt: true,
        reference_image: Some("does/not/exist.png".into()),
        ..small_canvas()
    };
    let mut engine = Engine::new(backend.clone(), config, &RTX).unwrap();
    match engine.select_model("Dreamshaper7") {
        Err(DaubError::ModelLoad { stage, .. }) => assert_eq!(stage, LoadStage::ReferenceImage),
        _ => panic!("expected a reference image load error"),
    }
    assert_eq!(backend.state().built, 0);
}

#[test]
fn reference_image_enables_image_prompt_conditioning() {
    let dir = std::env::temp_dir().join(format!("daub-reference-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let reference = dir.join("style.png");
    sketch().save(&reference).unwrap();

    let backend = FakeBackend::default();
    let config = EngineConfig {
        use_image_prompt: true,
        reference_image: Some(reference),
        ..small_canvas()
    };
    let mut engine = Engine::new(backend.clone(), config, &RTX).unwrap();
    let session = engine.select_model("Dreamshaper7").unwrap();
    assert!(session.uses_image_prompt());

    let request = GenerationRequest {
        ip_scale: 0.3,
        ..GenerationRequest::new("a house", sketch(), 7)
    };
    session.infer(&request).unwrap();

    let state = backend.state();
    assert_eq!(state.events[1], "load_ip_adapter models/ip-adapter_sd15.safetensors");
    assert_eq!(state.events[2], "use_lcm_scheduler");
    assert!(state.runs[0].with_reference);
    assert_eq!(state.runs[0].ip_scale, 0.3);
    drop(state);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn ip_scale_is_ignored_without_reference() {
    let backend = FakeBackend::default();
    let mut engine = engine(&backend);
    let session = engine.select_model("Dreamshaper7").unwrap();
    let request = GenerationRequest {
        ip_scale: 0.3,
        ..GenerationRequest::new("a house", sketch(), 7)
    };
    session.infer(&request).unwrap();
    assert_eq!(backend.state().runs[0].ip_scale, 1.0);
}

#[rstest]
#[case("from_pretrained", LoadStage::BaseWeights)]
#[case("use_lcm_scheduler", LoadStage::Scheduler)]
#[case("load_lora_weights", LoadStage::ConsistencyLora)]
#[case("fuse_lora", LoadStage::ConsistencyLora)]
#[case("to", LoadStage::DeviceTransfer)]
fn load_failures_name_their_stage(#[case] step: &'static str, #[case] expected: LoadStage) {
    let backend = FakeBackend::failing_at(step);
    let mut engine = engine(&backend);
    match engine.select_model("Dreamshaper8") {
        Err(DaubError::ModelLoad { model, stage, .. }) => {
            assert_eq!(model, "Lykon/dreamshaper-8");
            assert_eq!(stage, expected);
        }
        _ => panic!("expected a load error"),
    }
    assert_eq!(backend.state().live, 0);
    assert!(engine.session().is_none());
}

#[test]
fn cpu_fallback_uses_full_precision() {
    let backend = FakeBackend::default();
    let config = EngineConfig {
        device_map: DeviceMap::ForceCpu,
        ..small_canvas()
    };
    let mut engine = Engine::new(backend.clone(), config, &RTX).unwrap();
    let session = engine.select_model("Dreamshaper7").unwrap();
    assert!(!session.profile().is_reproducible());
    assert_eq!(backend.state().events.last().unwrap(), "to Cpu fp32");
}

#[test]
fn old_gpus_run_in_full_precision() {
    let backend = FakeBackend::default();
    let probe = GpuProbe("NVIDIA GeForce GTX 1660 SUPER");
    let engine = Engine::new(backend.clone(), small_canvas(), &probe).unwrap();
    assert!(engine.profile().is_accelerated());
    assert_eq!(engine.profile().precision.to_string(), "fp32");
}

#[test]
fn rejects_unaligned_canvas() {
    let config = EngineConfig {
        canvas_width: 300,
        ..EngineConfig::default()
    };
    assert!(matches!(
        Engine::new(FakeBackend::default(), config, &RTX),
        Err(DaubError::Config(_))
    ));
}

#[test]
fn preimage_is_text_to_image_and_released() {
    let backend = FakeBackend::default();
    let mut engine = engine(&backend);
    engine.select_model("Dreamshaper8").unwrap();

    let image = engine.generate_preimage("a castle", "Dreamshaper7").unwrap();
    assert_eq!((image.width(), image.height()), (64, 48));

    let state = backend.state();
    assert_eq!(state.live, 1, "only the session stays resident");
    assert!(state
        .events
        .contains(&"from_pretrained Lykon/dreamshaper-7 Sd15 TextToImage fp16".to_string()));
    let run = state.runs.last().unwrap();
    assert_eq!(run.steps, PREIMAGE_STEPS);
    assert_eq!(run.guidance_scale, 1.0);
    assert_eq!(run.with_image, None);
}

#[test]
fn preimage_rejects_unknown_models() {
    let backend = FakeBackend::default();
    let engine = engine(&backend);
    assert!(matches!(
        engine.generate_preimage("a castle", "Nope"),
        Err(DaubError::UnknownModel(_))
    ));
    assert_eq!(backend.state().built, 0);
}

#[test]
fn default_preimage_model_is_dreamshaper_7() {
    let backend = FakeBackend::default();
    let config = small_canvas();
    let image = PreimageGenerator::new(&backend, &config)
        .generate_default("a castle")
        .unwrap();
    assert_eq!((image.width(), image.height()), (64, 48));
    assert_eq!(DEFAULT_PREIMAGE_MODEL, "Lykon/dreamshaper-7");

    let state = backend.state();
    assert_eq!(
        state.events[0],
        "from_pretrained Lykon/dreamshaper-7 Sd15 TextToImage fp16"
    );
    assert_eq!(state.built, 1);
    assert_eq!(state.live, 0);
}

#[test]
fn preimage_runs_in_fp16_even_on_full_precision_hosts() {
    let backend = FakeBackend::default();
    let probe = GpuProbe("NVIDIA GeForce GTX 1660 SUPER");
    let mut engine = Engine::new(backend.clone(), small_canvas(), &probe).unwrap();
    assert_eq!(engine.profile().precision, Precision::Full);

    engine.select_model("Dreamshaper7").unwrap();
    assert_eq!(backend.state().events.last().unwrap(), "to Accelerator fp32");

    engine.generate_preimage("a castle", "Dreamshaper7").unwrap();
    let state = backend.state();
    let preimage_events = &state.events[5..];
    assert_eq!(
        preimage_events.first().unwrap(),
        "from_pretrained Lykon/dreamshaper-7 Sd15 TextToImage fp16"
    );
    assert_eq!(preimage_events.last().unwrap(), "to Accelerator fp16");
    assert_eq!(state.live, 1);
}
