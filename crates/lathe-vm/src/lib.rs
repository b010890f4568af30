//! # lathe-vm
//!
//! Executes compiled lathe programs.
//!
//! - `TapeMachine`: register file, strategy dispatch (accelerator, preallocated,
//!   in-place, value-producing), gradient routing and device transfers
//! - `DeviceContext`: scoped accelerator handles held for a machine's lifetime
//! - `evaluate`: uncompiled reference evaluation of the same graph
//! - `Engine` / `EngineConfig`: differentiate, compile and run from one config

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod eval;
pub mod machine;
pub mod options;

pub use config::EngineConfig;
pub use device::DeviceContext;
pub use engine::Engine;
pub use error::{BoxError, VmError};
pub use eval::evaluate;
pub use machine::{Hook, TapeMachine};
pub use options::VmOptions;

pub type Result<T> = std::result::Result<T, VmError>;
