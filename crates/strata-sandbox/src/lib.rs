//! strata-sandbox: the untrusted-code path of the control plane.
//!
//! Submitted strategy source is first scored by the static
//! [`CodeValidator`]; only code below the risk ceiling reaches the
//! [`SandboxRunner`], which executes it in an isolated environment (no
//! network, read-only root, dropped capabilities, CPU/memory caps) through
//! the [`SandboxBackend`] trait and tears the environment down on every
//! path.

pub mod backend;
#[cfg(feature = "docker")]
pub mod docker;
pub mod runner;
pub mod validator;

pub use backend::{
    MountSpec, SandboxBackend, SandboxError, SandboxLimits, SandboxSpec, SandboxUsage,
    ScriptedBackend, ScriptedRun,
};
#[cfg(feature = "docker")]
pub use docker::DockerBackend;
pub use runner::{SandboxConfig, SandboxExecutionResult, SandboxRunner};
pub use validator::{CodeValidator, RiskLevel, ValidationResult, Violation};
