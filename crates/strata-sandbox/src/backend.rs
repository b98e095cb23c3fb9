//! The isolated-environment interface the runner executes against.
//!
//! A backend creates an environment from a [`SandboxSpec`] (image, command,
//! mounts, limits), runs it, surfaces logs and sampled usage, and destroys
//! it. [`ScriptedBackend`] is the in-memory double used by tests; the real
//! Docker-backed implementation lives behind the `docker` feature.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    /// The configured execution image does not exist. A setup error, not a
    /// per-call failure.
    #[error("sandbox image not available: {0}")]
    ImageMissing(String),
    #[error("sandbox backend error: {0}")]
    Backend(String),
    #[error("environment exceeded its {secs}s deadline")]
    Timeout { secs: u64 },
    #[error("unknown environment handle: {0}")]
    UnknownHandle(String),
}

/// Hard limits applied to every isolated environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub memory_bytes: u64,
    /// Equal to `memory_bytes`: swap is disabled.
    pub memory_swap_bytes: u64,
    pub cpu_period_micros: u64,
    pub cpu_quota_micros: u64,
    pub drop_all_caps: bool,
    pub no_new_privileges: bool,
    pub read_only_root: bool,
    pub network_disabled: bool,
    /// Non-root user the workload runs as.
    pub user: String,
}

impl SandboxLimits {
    /// Limits for `memory_bytes` of RAM and `cpu_cores` of CPU over the
    /// standard 100ms scheduling window.
    pub fn new(memory_bytes: u64, cpu_cores: f64) -> Self {
        Self {
            memory_bytes,
            memory_swap_bytes: memory_bytes,
            cpu_period_micros: 100_000,
            cpu_quota_micros: (cpu_cores * 100_000.0) as u64,
            drop_all_caps: true,
            no_new_privileges: true,
            read_only_root: true,
            network_disabled: true,
            user: "sandboxuser".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MountSpec {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub image: String,
    pub command: Vec<String>,
    pub mounts: Vec<MountSpec>,
    pub env: Vec<(String, String)>,
    pub working_dir: String,
    pub limits: SandboxLimits,
}

/// Sampled resource usage of a finished (or killed) environment.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SandboxUsage {
    pub peak_memory_bytes: u64,
    pub cpu_percent: f64,
}

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Verify the configured image exists. Called once at setup.
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError>;

    async fn create(&self, spec: &SandboxSpec) -> Result<String, SandboxError>;

    async fn start(&self, handle: &str) -> Result<(), SandboxError>;

    /// Wait for exit up to `timeout_secs`. Returns the exit code, or
    /// [`SandboxError::Timeout`] if the deadline passes first.
    async fn wait(&self, handle: &str, timeout_secs: u64) -> Result<i64, SandboxError>;

    /// Forcibly terminate a running environment.
    async fn kill(&self, handle: &str) -> Result<(), SandboxError>;

    async fn logs(&self, handle: &str) -> Result<(String, String), SandboxError>;

    async fn stats(&self, handle: &str) -> Result<SandboxUsage, SandboxError>;

    /// Destroy the environment. Must succeed for already-stopped
    /// environments; `force` also removes running ones.
    async fn remove(&self, handle: &str, force: bool) -> Result<(), SandboxError>;
}

/// One scripted execution outcome for [`ScriptedBackend`].
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub usage: SandboxUsage,
    /// Simulate a workload that never exits: `wait` returns `Timeout`.
    pub hangs: bool,
    /// Fail the `start` call itself.
    pub fail_start: bool,
}

impl ScriptedRun {
    pub fn ok(stdout: &str) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
            usage: SandboxUsage {
                peak_memory_bytes: 32 * 1024 * 1024,
                cpu_percent: 12.5,
            },
            hangs: false,
            fail_start: false,
        }
    }

    pub fn exits(exit_code: i64, stderr: &str) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
            usage: SandboxUsage::default(),
            hangs: false,
            fail_start: false,
        }
    }

    pub fn hanging() -> Self {
        Self {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            usage: SandboxUsage::default(),
            hangs: true,
            fail_start: false,
        }
    }
}

#[derive(Default)]
struct ScriptedState {
    runs: Vec<ScriptedRun>,
    /// handle -> scripted run index, for live environments.
    active: HashMap<String, usize>,
    specs: Vec<SandboxSpec>,
    removed: u64,
}

/// In-memory backend that replays scripted outcomes. Tracks created and
/// removed environments so tests can assert nothing leaks.
#[derive(Default)]
pub struct ScriptedBackend {
    state: Mutex<ScriptedState>,
    next_handle: AtomicU64,
    image_available: bool,
}

impl ScriptedBackend {
    pub fn new(runs: Vec<ScriptedRun>) -> Self {
        Self {
            state: Mutex::new(ScriptedState {
                runs,
                ..ScriptedState::default()
            }),
            next_handle: AtomicU64::new(0),
            image_available: true,
        }
    }

    pub fn without_image() -> Self {
        Self {
            state: Mutex::new(ScriptedState::default()),
            next_handle: AtomicU64::new(0),
            image_available: false,
        }
    }

    /// Environments created but not yet removed.
    pub fn active_environments(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    pub fn removed_count(&self) -> u64 {
        self.state.lock().unwrap().removed
    }

    /// Specs of every environment created, in order.
    pub fn created_specs(&self) -> Vec<SandboxSpec> {
        self.state.lock().unwrap().specs.clone()
    }

    fn run_for(&self, handle: &str) -> Result<ScriptedRun, SandboxError> {
        let state = self.state.lock().unwrap();
        let index = *state
            .active
            .get(handle)
            .ok_or_else(|| SandboxError::UnknownHandle(handle.to_string()))?;
        Ok(state.runs[index].clone())
    }
}

#[async_trait]
impl SandboxBackend for ScriptedBackend {
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.image_available {
            Ok(())
        } else {
            Err(SandboxError::ImageMissing(image.to_string()))
        }
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<String, SandboxError> {
        let mut state = self.state.lock().unwrap();
        let index = state.specs.len();
        if index >= state.runs.len() {
            return Err(SandboxError::Backend("no scripted run left".to_string()));
        }
        let handle = format!("env-{}", self.next_handle.fetch_add(1, Ordering::SeqCst));
        state.specs.push(spec.clone());
        state.active.insert(handle.clone(), index);
        Ok(handle)
    }

    async fn start(&self, handle: &str) -> Result<(), SandboxError> {
        let run = self.run_for(handle)?;
        if run.fail_start {
            return Err(SandboxError::Backend("start refused".to_string()));
        }
        Ok(())
    }

    async fn wait(&self, handle: &str, timeout_secs: u64) -> Result<i64, SandboxError> {
        let run = self.run_for(handle)?;
        if run.hangs {
            return Err(SandboxError::Timeout { secs: timeout_secs });
        }
        Ok(run.exit_code)
    }

    async fn kill(&self, handle: &str) -> Result<(), SandboxError> {
        self.run_for(handle).map(|_| ())
    }

    async fn logs(&self, handle: &str) -> Result<(String, String), SandboxError> {
        let run = self.run_for(handle)?;
        Ok((run.stdout, run.stderr))
    }

    async fn stats(&self, handle: &str) -> Result<SandboxUsage, SandboxError> {
        Ok(self.run_for(handle)?.usage)
    }

    async fn remove(&self, handle: &str, _force: bool) -> Result<(), SandboxError> {
        let mut state = self.state.lock().unwrap();
        if state.active.remove(handle).is_some() {
            state.removed += 1;
            Ok(())
        } else {
            Err(SandboxError::UnknownHandle(handle.to_string()))
        }
    }
}
