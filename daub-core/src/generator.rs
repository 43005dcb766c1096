//! Seedable normal sampler for diffusion noise.
//!
//! Noise is drawn on the CPU with MT19937 and Box-Muller in the same order
//! `torch.randn` uses on a CPU generator, then moved to the target device, so a
//! seed yields the same starting noise regardless of the compute device.

use candle_core::{DType, Device, Result, Shape, Tensor};
use rand_mt::Mt;

/// MT19937's reference default seed.
const DEFAULT_SEED: u32 = 5489;

#[derive(Debug, Clone)]
pub struct Generator {
    mt: Mt,
    spare: Option<f32>,
    seed: Option<u64>,
}

impl Default for Generator {
    fn default() -> Self {
        Self::new()
    }
}

impl Generator {
    /// An unseeded generator. Call [`Generator::manual_seed`] before sampling
    /// when reproducibility matters.
    pub fn new() -> Self {
        Self {
            mt: Mt::new(DEFAULT_SEED),
            spare: None,
            seed: None,
        }
    }

    /// Resets the stream. Only the low 32 bits are used, as MT19937 takes a
    /// 32-bit seed.
    pub fn manual_seed(&mut self, seed: u64) -> &mut Self {
        self.mt = Mt::new(seed as u32);
        self.spare = None;
        self.seed = Some(seed);
        self
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    fn unit_f64(&mut self) -> f64 {
        let hi = self.mt.next_u32() as u64;
        let lo = self.mt.next_u32() as u64;
        ((hi << 32 | lo) & ((1 << 53) - 1)) as f64 / (1u64 << 53) as f64
    }

    fn unit_f32(&mut self) -> f32 {
        (self.mt.next_u32() & 0x00FF_FFFF) as f32 / 16_777_216.0
    }

    fn scalar(&mut self) -> f32 {
        if let Some(spare) = self.spare.take() {
            return spare;
        }
        let u1 = self.unit_f64();
        let u2 = self.unit_f64();
        let radius = (-2.0 * (1.0 - u2).ln()).sqrt();
        let theta = std::f64::consts::TAU * u1;
        self.spare = Some((radius * theta.sin()) as f32);
        (radius * theta.cos()) as f32
    }

    /// Below 16 values torch samples one at a time. From 16 on it draws every
    /// uniform first, transforms them in blocks of 16, then redraws and
    /// transforms the last 16 when the count is not a multiple of 16.
    pub fn sample(&mut self, count: usize) -> Vec<f32> {
        if count < 16 {
            return (0..count).map(|_| self.scalar()).collect();
        }
        let mut out: Vec<f32> = (0..count).map(|_| self.unit_f32()).collect();
        out.chunks_exact_mut(16).for_each(box_muller_16);
        if count % 16 != 0 {
            let tail = &mut out[count - 16..];
            tail.iter_mut().for_each(|u| *u = self.unit_f32());
            box_muller_16(tail);
        }
        out
    }

    /// Standard normal tensor of `shape`, placed on `device` as `dtype`.
    pub fn randn<S: Into<Shape>>(
        &mut self,
        shape: S,
        device: &Device,
        dtype: DType,
    ) -> Result<Tensor> {
        let shape = shape.into();
        let values = self.sample(shape.elem_count());
        Tensor::from_vec(values, shape, &Device::Cpu)?
            .to_device(device)?
            .to_dtype(dtype)
    }
}

/// Uniforms `[u1.., u2..]` become 8 cosine then 8 sine samples.
fn box_muller_16(block: &mut [f32]) {
    for j in 0..8 {
        let radius = (-2.0 * (1.0 - block[j]).ln()).sqrt();
        let theta = std::f32::consts::TAU * block[j + 8];
        block[j] = radius * theta.cos();
        block[j + 8] = radius * theta.sin();
    }
}
