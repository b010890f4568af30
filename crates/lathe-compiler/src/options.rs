use lathe_core::Device;
use serde::{Deserialize, Serialize};

/// Compiler knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Device that eligible operations are placed on. `None` keeps
    /// everything on the host.
    pub accelerator: Option<Device>,
    /// Let in-place capable instructions overwrite a dying operand's register.
    pub in_place: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            accelerator: None,
            in_place: true,
        }
    }
}

impl CompileOptions {
    pub fn with_accelerator(device: Device) -> Self {
        Self {
            accelerator: Some(device),
            ..Self::default()
        }
    }
}
