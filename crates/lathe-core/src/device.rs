use std::fmt;

use serde::{Deserialize, Serialize};

/// Memory space a value lives in, and where an instruction executes.
///
/// Ordered host-first so program device lists list `cpu` before accelerators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
}

impl Device {
    pub fn is_cpu(&self) -> bool {
        *self == Device::Cpu
    }

    pub fn is_cuda(&self) -> bool {
        self.cuda_index().is_some()
    }

    /// Ordinal of a CUDA device; `None` for the host.
    pub fn cuda_index(&self) -> Option<usize> {
        if let Device::Cuda(ordinal) = *self {
            Some(ordinal)
        } else {
            None
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_properties() {
        assert!(Device::Cpu.is_cpu());
        assert!(!Device::Cpu.is_cuda());
        assert!(Device::Cuda(0).is_cuda());
        assert_eq!(Device::Cuda(1).cuda_index(), Some(1));
        assert_eq!(Device::Cpu.cuda_index(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Device::Cpu.to_string(), "cpu");
        assert_eq!(Device::Cuda(2).to_string(), "cuda:2");
    }

    #[test]
    fn test_host_sorts_first() {
        let mut devices = vec![Device::Cuda(1), Device::Cpu, Device::Cuda(0)];
        devices.sort();
        assert_eq!(devices, vec![Device::Cpu, Device::Cuda(0), Device::Cuda(1)]);
    }
}
