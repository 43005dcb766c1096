//! Latent consistency (LCM) scheduler.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::Tensor;
use serde::Deserialize;

use crate::Generator;

const SIGMA_DATA: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    ScaledLinear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    Epsilon,
    VPrediction,
    Sample,
}

/// Values inherited from the base model's `scheduler_config.json`; keys the
/// LCM scheduler has no use for are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LcmSchedulerConfig {
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    pub num_train_timesteps: usize,
    pub prediction_type: PredictionType,
    pub original_inference_steps: usize,
    pub timestep_scaling: f64,
    pub set_alpha_to_one: bool,
}

impl Default for LcmSchedulerConfig {
    fn default() -> Self {
        Self {
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            num_train_timesteps: 1000,
            prediction_type: PredictionType::Epsilon,
            original_inference_steps: 50,
            timestep_scaling: 10.0,
            set_alpha_to_one: false,
        }
    }
}

impl LcmSchedulerConfig {
    pub fn from_base_config(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw).context("failed to parse scheduler config")?;
        if config.num_train_timesteps < config.original_inference_steps {
            anyhow::bail!(
                "num_train_timesteps ({}) is smaller than the LCM origin steps ({})",
                config.num_train_timesteps,
                config.original_inference_steps
            );
        }
        Ok(config)
    }

    fn alphas_cumprod(&self) -> Vec<f64> {
        let n = self.num_train_timesteps;
        let interpolate = |start: f64, end: f64, i: usize| {
            if n == 1 {
                start
            } else {
                start + (end - start) * i as f64 / (n - 1) as f64
            }
        };
        let mut product = 1.0;
        (0..n)
            .map(|i| {
                let beta = match self.beta_schedule {
                    BetaSchedule::Linear => interpolate(self.beta_start, self.beta_end, i),
                    BetaSchedule::ScaledLinear => {
                        interpolate(self.beta_start.sqrt(), self.beta_end.sqrt(), i).powi(2)
                    }
                };
                product *= 1.0 - beta;
                product
            })
            .collect()
    }

    pub fn build(&self, inference_steps: usize) -> Result<LcmScheduler> {
        let origin_steps = self.original_inference_steps;
        if inference_steps == 0 || inference_steps > origin_steps {
            anyhow::bail!("LCM supports 1..={origin_steps} steps, got {inference_steps}");
        }
        let c = self.num_train_timesteps / origin_steps;
        // Origin timesteps run high to low; pick `inference_steps` of them at
        // evenly spaced positions.
        let origin: Vec<usize> = (1..=origin_steps).rev().map(|i| i * c - 1).collect();
        let timesteps = (0..inference_steps)
            .map(|i| origin[i * origin.len() / inference_steps])
            .collect();

        let alphas_cumprod = self.alphas_cumprod();
        let final_alpha_cumprod = if self.set_alpha_to_one {
            1.0
        } else {
            alphas_cumprod[0]
        };

        Ok(LcmScheduler {
            timesteps,
            alphas_cumprod,
            final_alpha_cumprod,
            prediction_type: self.prediction_type,
            timestep_scaling: self.timestep_scaling,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LcmScheduler {
    timesteps: Vec<usize>,
    alphas_cumprod: Vec<f64>,
    final_alpha_cumprod: f64,
    prediction_type: PredictionType,
    timestep_scaling: f64,
}

impl LcmScheduler {
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    /// Index of the first timestep an image-to-image run executes. At least one
    /// step always runs.
    pub fn start_index(&self, strength: f64) -> usize {
        let steps = self.timesteps.len();
        let init = ((steps as f64 * strength) as usize).clamp(1, steps);
        steps - init
    }

    pub fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: usize) -> Result<Tensor> {
        let alpha = self.alphas_cumprod[timestep];
        Ok(((original * alpha.sqrt())? + (noise * (1.0 - alpha).sqrt())?)?)
    }

    fn boundary_condition(&self, timestep: usize) -> (f64, f64) {
        let scaled = timestep as f64 * self.timestep_scaling;
        let denom = scaled.powi(2) + SIGMA_DATA.powi(2);
        let c_skip = SIGMA_DATA.powi(2) / denom;
        let c_out = scaled / denom.sqrt();
        (c_skip, c_out)
    }

    /// Denoises `sample` at `self.timesteps()[index]`. Every step but the last
    /// re-noises the consistency estimate to the next timestep with noise drawn
    /// from `generator`.
    pub fn step(
        &self,
        model_output: &Tensor,
        index: usize,
        sample: &Tensor,
        generator: &mut Generator,
    ) -> Result<Tensor> {
        let timestep = self.timesteps[index];
        let alpha_t = self.alphas_cumprod[timestep];
        let beta_t = 1.0 - alpha_t;

        let predicted_original = match self.prediction_type {
            PredictionType::Epsilon => {
                ((sample - (model_output * beta_t.sqrt())?)? / alpha_t.sqrt())?
            }
            PredictionType::VPrediction => {
                ((sample * alpha_t.sqrt())? - (model_output * beta_t.sqrt())?)?
            }
            PredictionType::Sample => model_output.clone(),
        };

        let (c_skip, c_out) = self.boundary_condition(timestep);
        let denoised = ((predicted_original * c_out)? + (sample * c_skip)?)?;

        let Some(&next) = self.timesteps.get(index + 1) else {
            return Ok(denoised);
        };
        let alpha_next = self.alphas_cumprod.get(next).copied().unwrap_or(self.final_alpha_cumprod);
        let noise = generator.randn(sample.dims(), sample.device(), sample.dtype())?;
        Ok(((denoised * alpha_next.sqrt())? + (noise * (1.0 - alpha_next).sqrt())?)?)
    }
}
