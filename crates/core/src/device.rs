use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("unknown device '{0}'. Supported: cpu, cuda, cuda:N, metal, metal:N")]
    UnknownDevice(String),
    #[error("unknown dtype '{0}'. Supported: auto, bf16, fp16, fp32")]
    UnknownDType(String),
}

/// A device named on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl FromStr for DeviceSpec {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        let (kind, ordinal) = match lower.split_once(':') {
            Some((kind, n)) => {
                let n = n
                    .parse::<usize>()
                    .map_err(|_| DeviceError::UnknownDevice(s.to_string()))?;
                (kind, n)
            }
            None => (lower.as_str(), 0),
        };
        match kind {
            "cpu" if ordinal == 0 => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda(ordinal)),
            "metal" | "mps" => Ok(Self::Metal(ordinal)),
            _ => Err(DeviceError::UnknownDevice(s.to_string())),
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(n) => write!(f, "cuda:{n}"),
            Self::Metal(n) => write!(f, "metal:{n}"),
        }
    }
}

impl DeviceSpec {
    /// Open the device. Fails when candle was built without the backend.
    pub fn open(self) -> candle_core::Result<Device> {
        match self {
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda(n) => Device::new_cuda(n),
            Self::Metal(n) => Device::new_metal(n),
        }
    }
}

/// `auto` is half precision on accelerators and f32 on the CPU.
pub fn parse_dtype(name: &str, device: &Device) -> Result<DType, DeviceError> {
    match name {
        "auto" if device.is_cpu() => Ok(DType::F32),
        "auto" | "fp16" | "float16" | "half" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        "fp32" | "float32" | "float" => Ok(DType::F32),
        other => Err(DeviceError::UnknownDType(other.to_string())),
    }
}
