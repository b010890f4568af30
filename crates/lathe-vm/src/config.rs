//! Aggregate configuration for the differentiate, compile and run pipeline.

use std::path::Path;

use lathe_autograd::DiffOptions;
use lathe_compiler::CompileOptions;
use serde::{Deserialize, Serialize};

use crate::{Result, VmOptions};

/// ```json
/// {
///   "diff": { "stabilization": true },
///   "compile": { "accelerator": { "cuda": 0 }, "in_place": true },
///   "vm": { "trace": false, "watch": [], "devices": [] }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub diff: DiffOptions,
    pub compile: CompileOptions,
    pub vm: VmOptions,
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&text)?;
        tracing::debug!(path = %path.display(), ?config, "loaded engine config");
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
