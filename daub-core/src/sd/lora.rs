//! Merging LoRA deltas into UNet weights.
//!
//! Kohya files name modules `lora_unet_<path with underscores>` and store
//! `.lora_down.weight`, `.lora_up.weight` and `.alpha`. Diffusers/PEFT files
//! use the dotted module path under `unet.` with `.lora.down/.lora.up` or
//! `.lora_A/.lora_B`.

use std::collections::HashMap;

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Down,
    Up,
    Alpha,
}

const SUFFIXES: [(&str, Part); 7] = [
    (".lora_down.weight", Part::Down),
    (".lora_up.weight", Part::Up),
    (".lora.down.weight", Part::Down),
    (".lora.up.weight", Part::Up),
    (".lora_A.weight", Part::Down),
    (".lora_B.weight", Part::Up),
    (".alpha", Part::Alpha),
];

fn split_key(key: &str) -> Option<(&str, Part)> {
    SUFFIXES
        .iter()
        .find_map(|(suffix, part)| key.strip_suffix(suffix).map(|module| (module, *part)))
}

fn kohya_name(module: &str) -> String {
    format!("lora_unet_{}", module.replace('.', "_"))
}

#[derive(Default)]
struct Pending {
    down: Option<Tensor>,
    up: Option<Tensor>,
    alpha: Option<f64>,
}

/// Adds every UNet LoRA pair in `lora` to the matching `<module>.weight` in
/// `weights`, scaled by `alpha / rank`. Returns how many weights changed.
pub fn fuse(weights: &mut HashMap<String, Tensor>, lora: HashMap<String, Tensor>) -> Result<usize> {
    let kohya: HashMap<String, String> = weights
        .keys()
        .filter_map(|key| key.strip_suffix(".weight"))
        .map(|module| (kohya_name(module), module.to_string()))
        .collect();

    let mut pending: HashMap<String, Pending> = HashMap::new();
    let mut ignored = 0usize;
    for (key, tensor) in lora {
        let Some((module, part)) = split_key(&key) else {
            ignored += 1;
            continue;
        };
        let target = if module.starts_with("lora_unet_") {
            kohya.get(module).cloned()
        } else {
            module
                .strip_prefix("unet.")
                .filter(|m| weights.contains_key(&format!("{m}.weight")))
                .map(str::to_string)
        };
        // text encoder entries and unknown modules
        let Some(target) = target else {
            ignored += 1;
            continue;
        };
        let entry = pending.entry(target).or_default();
        match part {
            Part::Down => entry.down = Some(tensor),
            Part::Up => entry.up = Some(tensor),
            Part::Alpha => {
                let alpha = tensor.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
                let alpha = alpha
                    .first()
                    .copied()
                    .with_context(|| format!("empty LoRA alpha for {key}"))?;
                entry.alpha = Some(alpha);
            }
        }
    }
    if ignored > 0 {
        tracing::debug!(ignored, "LoRA tensors without a matching UNet weight");
    }

    let mut fused = 0;
    for (module, Pending { down, up, alpha }) in pending {
        let (Some(down), Some(up)) = (down, up) else {
            anyhow::bail!("LoRA for {module} is missing its up or down projection");
        };
        let name = format!("{module}.weight");
        let weight = weights
            .get(&name)
            .with_context(|| format!("no base weight {name}"))?;
        let merged = merge(weight, &down, &up, alpha)
            .with_context(|| format!("failed to fuse LoRA into {name}"))?;
        weights.insert(name, merged);
        fused += 1;
    }
    if fused == 0 {
        anyhow::bail!("LoRA file has no tensors matching the UNet");
    }
    Ok(fused)
}

fn merge(weight: &Tensor, down: &Tensor, up: &Tensor, alpha: Option<f64>) -> Result<Tensor> {
    let rank = down.dim(0)?;
    let scale = alpha.unwrap_or(rank as f64) / rank as f64;
    let down = down.to_dtype(DType::F32)?.flatten_from(1)?;
    let up = up.to_dtype(DType::F32)?.flatten_from(1)?;
    let delta = (up.matmul(&down)? * scale)?.reshape(weight.shape())?;
    Ok((weight.to_dtype(DType::F32)? + delta)?.to_dtype(weight.dtype())?)
}
