//! Sandboxed executor for validated strategy code.
//!
//! Pipeline: static validation, scratch-dir materialization, container
//! dispatch with hard limits, bounded wait, log/stat collection, teardown.
//! The environment is destroyed on every path once created; a validation
//! failure never reaches execution.

use crate::backend::{MountSpec, SandboxBackend, SandboxError, SandboxLimits, SandboxSpec, SandboxUsage};
use crate::validator::{CodeValidator, ValidationResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use strata_core::config::{env_bool, env_f64, env_string, env_u32, env_u64};

const SOURCE_FILE: &str = "strategy.py";
const WORKSPACE_DIR: &str = "/workspace";
const OUTPUT_DIR: &str = "/output";

/// Runner configuration.
///
/// | Env | Default | Description |
/// |-----|---------|-------------|
/// | STRATA_SANDBOX_IMAGE | strata-sandbox:latest | Execution image. |
/// | STRATA_SANDBOX_TIMEOUT_SECS | 300 | Default execution deadline. |
/// | STRATA_SANDBOX_MEMORY_LIMIT_BYTES | 4294967296 | Memory cap (swap disabled). |
/// | STRATA_SANDBOX_CPU_LIMIT | 2.0 | CPU cores over a 100ms window. |
/// | STRATA_SANDBOX_VALIDATE_CODE | true | Run the static validator first. |
/// | STRATA_SANDBOX_MAX_RISK_SCORE | 30 | Highest risk score allowed to execute. |
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub image: String,
    pub timeout_secs: u64,
    pub memory_limit_bytes: u64,
    pub cpu_limit: f64,
    pub validate_code: bool,
    pub max_risk_score: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "strata-sandbox:latest".to_string(),
            timeout_secs: 300,
            memory_limit_bytes: 4 * 1024 * 1024 * 1024,
            cpu_limit: 2.0,
            validate_code: true,
            max_risk_score: 30,
        }
    }
}

impl SandboxConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            image: env_string("STRATA_SANDBOX_IMAGE", &d.image),
            timeout_secs: env_u64("STRATA_SANDBOX_TIMEOUT_SECS", d.timeout_secs),
            memory_limit_bytes: env_u64(
                "STRATA_SANDBOX_MEMORY_LIMIT_BYTES",
                d.memory_limit_bytes,
            ),
            cpu_limit: env_f64("STRATA_SANDBOX_CPU_LIMIT", d.cpu_limit),
            validate_code: env_bool("STRATA_SANDBOX_VALIDATE_CODE", d.validate_code),
            max_risk_score: env_u32("STRATA_SANDBOX_MAX_RISK_SCORE", d.max_risk_score),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxExecutionResult {
    pub success: bool,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub resource_usage: Option<SandboxUsage>,
    pub validation: Option<ValidationResult>,
    pub error: Option<String>,
}

impl SandboxExecutionResult {
    fn refused(validation: Option<ValidationResult>, duration_ms: u64, error: String) -> Self {
        Self {
            success: false,
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms,
            resource_usage: None,
            validation,
            error: Some(error),
        }
    }
}

pub struct SandboxRunner {
    config: SandboxConfig,
    backend: Arc<dyn SandboxBackend>,
    validator: CodeValidator,
}

impl SandboxRunner {
    pub fn new(config: SandboxConfig, backend: Arc<dyn SandboxBackend>) -> Self {
        Self {
            config,
            backend,
            validator: CodeValidator::new(),
        }
    }

    /// Verify the configured image is available. A missing image is a setup
    /// error; call this once at startup rather than per execution.
    pub async fn preflight(&self) -> Result<(), SandboxError> {
        self.backend.ensure_image(&self.config.image).await
    }

    /// Validate and execute `source` in an isolated environment. Always
    /// returns a result struct; refusals and infrastructure failures are
    /// reported through `success`/`error`.
    pub async fn execute(
        &self,
        source: &str,
        timeout_secs: Option<u64>,
        env_vars: &[(String, String)],
    ) -> SandboxExecutionResult {
        let started = Instant::now();
        let timeout = timeout_secs.unwrap_or(self.config.timeout_secs);

        let validation = if self.config.validate_code {
            let validation = self.validator.validate(source);
            if !validation.is_valid {
                let first = validation
                    .violations
                    .iter()
                    .find(|v| v.critical)
                    .or_else(|| validation.violations.first())
                    .map(|v| v.message.clone())
                    .unwrap_or_else(|| "unspecified violation".to_string());
                tracing::warn!(target: "strata::sandbox", reason = %first, "validation refused code");
                return SandboxExecutionResult::refused(
                    Some(validation),
                    elapsed_ms(started),
                    format!("Security validation failed: {}", first),
                );
            }
            if validation.risk_score > self.config.max_risk_score {
                tracing::warn!(
                    target: "strata::sandbox",
                    score = validation.risk_score,
                    max = self.config.max_risk_score,
                    "risk score over ceiling"
                );
                let error = format!(
                    "Risk score {} exceeds maximum {}",
                    validation.risk_score, self.config.max_risk_score
                );
                return SandboxExecutionResult::refused(
                    Some(validation),
                    elapsed_ms(started),
                    error,
                );
            }
            tracing::debug!(
                target: "strata::sandbox",
                score = validation.risk_score,
                level = ?validation.risk_level,
                "validation passed"
            );
            Some(validation)
        } else {
            None
        };

        // Scratch directory: source mounted read-only, output/ writable.
        let scratch = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                return SandboxExecutionResult::refused(
                    validation,
                    elapsed_ms(started),
                    format!("scratch dir creation failed: {}", e),
                )
            }
        };
        let source_path = scratch.path().join(SOURCE_FILE);
        let output_path = scratch.path().join("output");
        if let Err(e) = std::fs::write(&source_path, source)
            .and_then(|_| std::fs::create_dir_all(&output_path))
        {
            return SandboxExecutionResult::refused(
                validation,
                elapsed_ms(started),
                format!("scratch dir setup failed: {}", e),
            );
        }

        let spec = SandboxSpec {
            image: self.config.image.clone(),
            command: vec![
                "python".to_string(),
                format!("{}/{}", WORKSPACE_DIR, SOURCE_FILE),
            ],
            mounts: vec![
                MountSpec {
                    host_path: scratch.path().to_path_buf(),
                    container_path: WORKSPACE_DIR.to_string(),
                    read_only: true,
                },
                MountSpec {
                    host_path: output_path,
                    container_path: OUTPUT_DIR.to_string(),
                    read_only: false,
                },
            ],
            env: env_vars.to_vec(),
            working_dir: WORKSPACE_DIR.to_string(),
            limits: SandboxLimits::new(self.config.memory_limit_bytes, self.config.cpu_limit),
        };

        let handle = match self.backend.create(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(target: "strata::sandbox", error = %e, "environment creation failed");
                return SandboxExecutionResult::refused(
                    validation,
                    elapsed_ms(started),
                    format!("Execution error: {}", e),
                );
            }
        };

        // From here on the environment exists: collect the outcome, then
        // tear down unconditionally before returning.
        let mut result = self.run_in_environment(&handle, timeout, started).await;
        if let Err(e) = self.backend.remove(&handle, true).await {
            tracing::error!(target: "strata::sandbox", handle = %handle, error = %e, "environment teardown failed");
        }
        result.validation = validation;
        result
    }

    async fn run_in_environment(
        &self,
        handle: &str,
        timeout_secs: u64,
        started: Instant,
    ) -> SandboxExecutionResult {
        if let Err(e) = self.backend.start(handle).await {
            return SandboxExecutionResult::refused(
                None,
                elapsed_ms(started),
                format!("Execution error: {}", e),
            );
        }

        let (exit_code, timed_out) = match self.backend.wait(handle, timeout_secs).await {
            Ok(code) => (code, false),
            Err(SandboxError::Timeout { .. }) => {
                tracing::warn!(target: "strata::sandbox", handle, timeout_secs, "deadline hit, killing environment");
                if let Err(e) = self.backend.kill(handle).await {
                    tracing::warn!(target: "strata::sandbox", handle, error = %e, "kill failed");
                }
                (-1, true)
            }
            Err(e) => {
                return SandboxExecutionResult::refused(
                    None,
                    elapsed_ms(started),
                    format!("Execution error: {}", e),
                )
            }
        };

        let (stdout, stderr) = self.backend.logs(handle).await.unwrap_or_else(|e| {
            tracing::warn!(target: "strata::sandbox", handle, error = %e, "log collection failed");
            (String::new(), String::new())
        });
        let resource_usage = self.backend.stats(handle).await.ok();

        let success = exit_code == 0 && !timed_out;
        let error = if success {
            None
        } else if timed_out {
            Some(format!("Execution timed out after {}s", timeout_secs))
        } else {
            Some(format!("Non-zero exit code: {}", exit_code))
        };

        let duration_ms = elapsed_ms(started);
        tracing::info!(
            target: "strata::sandbox",
            handle,
            exit_code,
            duration_ms,
            "environment finished"
        );
        SandboxExecutionResult {
            success,
            exit_code,
            stdout,
            stderr,
            duration_ms,
            resource_usage,
            validation: None,
            error,
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
