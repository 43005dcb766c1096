#![allow(dead_code)]

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Result};
use daub_core::{
    AcceleratorInfo, Backend, DeviceProfile, DiffusionPipeline, EngineConfig, Generator,
    HardwareProbe, ModelFamily, PipelineCall, PipelineKind, Precision,
};
use image::{DynamicImage, RgbImage};

pub struct GpuProbe(pub &'static str);

impl HardwareProbe for GpuProbe {
    fn is_apple_silicon(&self) -> bool {
        false
    }

    fn accelerator(&self, _ordinal: usize) -> Option<AcceleratorInfo> {
        Some(AcceleratorInfo {
            name: self.0.to_string(),
            compute_capability: Some((8, 9)),
        })
    }
}

pub const RTX: GpuProbe = GpuProbe("NVIDIA GeForce RTX 4090");

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRun {
    pub prompt: String,
    pub negative_prompt: String,
    pub with_image: Option<(u32, u32)>,
    pub with_reference: bool,
    pub steps: usize,
    pub guidance_scale: f64,
    pub strength: f64,
    pub ip_scale: f64,
    pub seed: Option<u64>,
}

#[derive(Debug, Default)]
pub struct State {
    pub live: usize,
    pub peak: usize,
    pub built: usize,
    pub events: Vec<String>,
    pub runs: Vec<RecordedRun>,
    pub fail_at: Option<&'static str>,
    pub fail_run: bool,
}

/// Records every pipeline call and tracks how many pipelines are alive.
#[derive(Debug, Default, Clone)]
pub struct FakeBackend {
    state: Arc<Mutex<State>>,
}

impl FakeBackend {
    pub fn failing_at(step: &'static str) -> Self {
        let backend = Self::default();
        backend.state().fail_at = Some(step);
        backend
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

fn check(state: &Arc<Mutex<State>>, event: String, step: &str) -> Result<()> {
    let mut state = state.lock().unwrap();
    state.events.push(event);
    if state.fail_at == Some(step) {
        bail!("injected failure at {step}");
    }
    Ok(())
}

impl Backend for FakeBackend {
    type Pipeline = FakePipeline;

    fn from_pretrained(
        &self,
        backend_id: &str,
        family: ModelFamily,
        kind: PipelineKind,
        precision: Precision,
    ) -> Result<FakePipeline> {
        check(
            &self.state,
            format!("from_pretrained {backend_id} {family:?} {kind:?} {precision}"),
            "from_pretrained",
        )?;
        let mut state = self.state();
        state.built += 1;
        state.live += 1;
        state.peak = state.peak.max(state.live);
        Ok(FakePipeline {
            state: self.state.clone(),
            kind,
            ip_scale: 1.0,
        })
    }
}

pub struct FakePipeline {
    state: Arc<Mutex<State>>,
    kind: PipelineKind,
    ip_scale: f64,
}

impl Drop for FakePipeline {
    fn drop(&mut self) {
        self.state.lock().unwrap().live -= 1;
    }
}

impl DiffusionPipeline for FakePipeline {
    fn load_ip_adapter(&mut self, adapter_name: &str) -> Result<()> {
        check(&self.state, format!("load_ip_adapter {adapter_name}"), "load_ip_adapter")
    }

    fn set_ip_adapter_scale(&mut self, scale: f64) {
        self.ip_scale = scale;
    }

    fn use_lcm_scheduler(&mut self) -> Result<()> {
        check(&self.state, "use_lcm_scheduler".to_string(), "use_lcm_scheduler")
    }

    fn load_lora_weights(&mut self, lora_id: &str) -> Result<()> {
        check(&self.state, format!("load_lora_weights {lora_id}"), "load_lora_weights")
    }

    fn fuse_lora(&mut self) -> Result<()> {
        check(&self.state, "fuse_lora".to_string(), "fuse_lora")
    }

    fn to(&mut self, profile: DeviceProfile) -> Result<()> {
        check(
            &self.state,
            format!("to {:?} {}", profile.device, profile.precision),
            "to",
        )
    }

    fn run(&mut self, call: PipelineCall<'_>, generator: &mut Generator) -> Result<DynamicImage> {
        self.kind.check(&call)?;
        let mut state = self.state.lock().unwrap();
        state.runs.push(RecordedRun {
            prompt: call.prompt.to_string(),
            negative_prompt: call.negative_prompt.to_string(),
            with_image: call.image.map(|image| (image.width(), image.height())),
            with_reference: call.ip_adapter_image.is_some(),
            steps: call.num_inference_steps,
            guidance_scale: call.guidance_scale,
            strength: call.strength,
            ip_scale: self.ip_scale,
            seed: generator.seed(),
        });
        if state.fail_run {
            bail!("out of memory");
        }
        // pixels are pure functions of the generator stream and the input
        let noise = generator.sample((call.width * call.height * 3) as usize);
        let offset = call
            .image
            .map(|image| image.to_rgb8().as_raw().iter().map(|&p| p as u32).sum::<u32>())
            .unwrap_or(0);
        let pixels = noise
            .iter()
            .map(|v| ((v.clamp(-3.0, 3.0) + 3.0) / 6.0 * 255.0) as u8)
            .map(|p| p.wrapping_add(offset as u8))
            .collect();
        let buffer = RgbImage::from_raw(call.width, call.height, pixels)
            .ok_or_else(|| anyhow::anyhow!("bad buffer size"))?;
        Ok(DynamicImage::ImageRgb8(buffer))
    }
}

pub fn small_canvas() -> EngineConfig {
    EngineConfig {
        canvas_width: 64,
        canvas_height: 48,
        ..EngineConfig::default()
    }
}

pub fn sketch() -> DynamicImage {
    let mut image = RgbImage::from_pixel(300, 300, image::Rgb([255, 255, 255]));
    for x in 50..250 {
        image.put_pixel(x, 150, image::Rgb([0, 0, 0]));
    }
    DynamicImage::ImageRgb8(image)
}
