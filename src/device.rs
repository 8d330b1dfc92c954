//! Compute device selection
//!
//! Hardware is probed once, at the configuration boundary. Everything below
//! that point receives an explicit [`Device`] value and never asks the
//! runtime which hardware exists.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Logical compute device a model is assigned to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Host CPU
    Cpu,
    /// GPU with the given ordinal
    Gpu(usize),
}

impl Device {
    /// Resolve the default device: the first GPU when one is usable, else CPU.
    pub fn auto() -> Self {
        if candle_core::utils::cuda_is_available() || candle_core::utils::metal_is_available() {
            Device::Gpu(0)
        } else {
            Device::Cpu
        }
    }

    /// Whether this is a GPU device (required for finetuning)
    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::Gpu(_))
    }

    /// Build the candle device backing this logical device
    pub fn to_candle(&self) -> Result<candle_core::Device> {
        match *self {
            Device::Cpu => Ok(candle_core::Device::Cpu),
            Device::Gpu(ordinal) => {
                if candle_core::utils::cuda_is_available() {
                    Ok(candle_core::Device::new_cuda(ordinal)?)
                } else if candle_core::utils::metal_is_available() {
                    Ok(candle_core::Device::new_metal(ordinal)?)
                } else {
                    Err(Error::device_unavailable(format!(
                        "gpu:{} requested but this build has no usable GPU backend",
                        ordinal
                    )))
                }
            }
        }
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::Cpu
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu(ordinal) => write!(f, "gpu:{}", ordinal),
        }
    }
}

/// Flush pending work on a candle device so freed buffers are returned to
/// the allocator before the next phase allocates.
pub fn reclaim_memory(device: &candle_core::Device) -> Result<()> {
    device.synchronize()?;
    Ok(())
}
