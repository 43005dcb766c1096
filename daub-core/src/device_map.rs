use std::process::Command;

use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::{DaubError, Result};

/// GeForce 16-series parts report fp16 support but produce NaNs with it.
const FP16_DENYLIST: [&str; 3] = ["1660", "1650", "1630"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDevice {
    Accelerator,
    Cpu,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precision {
    #[serde(rename = "fp16")]
    Reduced,
    #[serde(rename = "fp32")]
    Full,
}

serde_plain::derive_display_from_serialize!(Precision);
serde_plain::derive_fromstr_from_deserialize!(Precision);

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Self::Reduced => DType::F16,
            Self::Full => DType::F32,
        }
    }
}

/// Where and at which precision pipelines run. Chosen once per engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub device: ComputeDevice,
    pub precision: Precision,
}

impl DeviceProfile {
    pub const ACCELERATED_FP16: Self = Self {
        device: ComputeDevice::Accelerator,
        precision: Precision::Reduced,
    };

    pub fn is_accelerated(&self) -> bool {
        self.device == ComputeDevice::Accelerator
    }

    /// Whether the backend's own sampling (VAE posterior) can be seeded. The
    /// CPU random source cannot, so image-to-image results on CPU differ
    /// between identical requests.
    pub fn is_reproducible(&self) -> bool {
        self.is_accelerated()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceleratorInfo {
    pub name: String,
    /// `None` when the driver could not be queried.
    pub compute_capability: Option<(u32, u32)>,
}

/// Host hardware introspection.
pub trait HardwareProbe {
    fn is_apple_silicon(&self) -> bool;

    fn accelerator(&self, ordinal: usize) -> Option<AcceleratorInfo>;
}

/// Probe backed by candle's runtime checks and `nvidia-smi`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl HardwareProbe for SystemProbe {
    fn is_apple_silicon(&self) -> bool {
        cfg!(all(target_os = "macos", target_arch = "aarch64")) && metal_is_available()
    }

    fn accelerator(&self, ordinal: usize) -> Option<AcceleratorInfo> {
        if !cuda_is_available() {
            return None;
        }
        let queried = Command::new("nvidia-smi")
            .args([
                "--query-gpu=name,compute_cap",
                "--format=csv,noheader",
                &format!("--id={ordinal}"),
            ])
            .output()
            .ok()
            .filter(|out| out.status.success())
            .and_then(|out| parse_nvidia_smi(&String::from_utf8_lossy(&out.stdout)));
        Some(queried.unwrap_or_else(|| AcceleratorInfo {
            name: format!("cuda:{ordinal}"),
            compute_capability: None,
        }))
    }
}

fn parse_nvidia_smi(line: &str) -> Option<AcceleratorInfo> {
    let (name, cap) = line.lines().next()?.rsplit_once(',')?;
    let (major, minor) = cap.trim().split_once('.')?;
    Some(AcceleratorInfo {
        name: name.trim().to_string(),
        compute_capability: Some((major.parse().ok()?, minor.parse().ok()?)),
    })
}

/// Picks the compute device and precision for this host.
pub fn select_profile(probe: &dyn HardwareProbe, device_map: DeviceMap) -> Result<DeviceProfile> {
    let ordinal = match device_map {
        DeviceMap::ForceCpu => {
            return Ok(DeviceProfile {
                device: ComputeDevice::Cpu,
                precision: Precision::Full,
            })
        }
        DeviceMap::Ordinal(ordinal) => ordinal,
    };

    if probe.is_apple_silicon() {
        return Ok(DeviceProfile::ACCELERATED_FP16);
    }

    let info = probe.accelerator(ordinal).ok_or_else(|| {
        DaubError::HardwareUnsupported(if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
            "no Metal device found, build with `--features metal`".to_string()
        } else {
            format!("no CUDA device at ordinal {ordinal}, build with `--features cuda`")
        })
    })?;

    let precision = match info.compute_capability {
        None => {
            tracing::warn!(device = %info.name, "compute capability unknown, using fp32");
            Precision::Full
        }
        Some((major, _)) if major < 6 => Precision::Full,
        Some(_) if FP16_DENYLIST.iter().any(|series| info.name.contains(series)) => {
            Precision::Full
        }
        Some(_) => Precision::Reduced,
    };
    tracing::info!(device = %info.name, %precision, "selected device profile");

    Ok(DeviceProfile {
        device: ComputeDevice::Accelerator,
        precision,
    })
}
