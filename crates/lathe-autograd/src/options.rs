use serde::{Deserialize, Serialize};

/// Options threaded through a differentiation request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffOptions {
    /// Prefer an operation's stabilized derivative form when it has one.
    pub stabilization: bool,
}

impl DiffOptions {
    pub fn stabilized() -> Self {
        Self { stabilization: true }
    }
}
