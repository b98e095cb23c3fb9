//! Docker-backed `SandboxBackend` (feature `docker`).
//!
//! Maps the limit set onto the Docker host config: memory with swap pinned
//! to the same value, CPU quota over a 100ms period, all capabilities
//! dropped, no-new-privileges, read-only rootfs, no network, non-root user.

use crate::backend::{SandboxBackend, SandboxError, SandboxSpec, SandboxUsage};
use async_trait::async_trait;
use bollard::container::{
    Config, KillContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StatsOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use std::time::Duration;

pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    /// Connect with the local daemon defaults (socket or named pipe).
    pub fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Backend(format!("docker connect: {}", e)))?;
        Ok(Self { docker })
    }

    fn binds(spec: &SandboxSpec) -> Vec<String> {
        spec.mounts
            .iter()
            .map(|m| {
                format!(
                    "{}:{}:{}",
                    m.host_path.display(),
                    m.container_path,
                    if m.read_only { "ro" } else { "rw" }
                )
            })
            .collect()
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        self.docker
            .inspect_image(image)
            .await
            .map(|_| ())
            .map_err(|_| SandboxError::ImageMissing(image.to_string()))
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<String, SandboxError> {
        let limits = &spec.limits;
        let host_config = HostConfig {
            binds: Some(Self::binds(spec)),
            memory: Some(limits.memory_bytes as i64),
            memory_swap: Some(limits.memory_swap_bytes as i64),
            cpu_period: Some(limits.cpu_period_micros as i64),
            cpu_quota: Some(limits.cpu_quota_micros as i64),
            cap_drop: limits.drop_all_caps.then(|| vec!["ALL".to_string()]),
            security_opt: limits
                .no_new_privileges
                .then(|| vec!["no-new-privileges".to_string()]),
            network_mode: limits.network_disabled.then(|| "none".to_string()),
            readonly_rootfs: Some(limits.read_only_root),
            ..Default::default()
        };
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(env),
            user: Some(limits.user.clone()),
            working_dir: Some(spec.working_dir.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container::<String, String>(None, config)
            .await
            .map_err(|e| SandboxError::Backend(format!("create: {}", e)))?;
        Ok(created.id)
    }

    async fn start(&self, handle: &str) -> Result<(), SandboxError> {
        self.docker
            .start_container(handle, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Backend(format!("start: {}", e)))
    }

    async fn wait(&self, handle: &str, timeout_secs: u64) -> Result<i64, SandboxError> {
        let mut wait_stream = self
            .docker
            .wait_container(handle, None::<WaitContainerOptions<String>>);
        let next = tokio::time::timeout(Duration::from_secs(timeout_secs), wait_stream.next())
            .await
            .map_err(|_| SandboxError::Timeout { secs: timeout_secs })?;
        match next {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(e)) => Err(SandboxError::Backend(format!("wait: {}", e))),
            None => Err(SandboxError::Backend("wait stream ended".to_string())),
        }
    }

    async fn kill(&self, handle: &str) -> Result<(), SandboxError> {
        self.docker
            .kill_container(handle, None::<KillContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Backend(format!("kill: {}", e)))
    }

    async fn logs(&self, handle: &str) -> Result<(String, String), SandboxError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(handle, Some(options));
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk.map_err(|e| SandboxError::Backend(format!("logs: {}", e)))? {
                bollard::container::LogOutput::StdOut { message } => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                bollard::container::LogOutput::StdErr { message } => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                _ => {}
            }
        }
        Ok((stdout, stderr))
    }

    async fn stats(&self, handle: &str) -> Result<SandboxUsage, SandboxError> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = self.docker.stats(handle, Some(options));
        let stats = match stream.next().await {
            Some(Ok(stats)) => stats,
            Some(Err(e)) => return Err(SandboxError::Backend(format!("stats: {}", e))),
            None => return Ok(SandboxUsage::default()),
        };

        let peak_memory_bytes = stats
            .memory_stats
            .max_usage
            .or(stats.memory_stats.usage)
            .unwrap_or(0);

        let cpu_delta = stats
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
        let system_delta = stats
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));
        let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1).max(1);
        let cpu_percent = if system_delta > 0 {
            cpu_delta as f64 / system_delta as f64 * online_cpus as f64 * 100.0
        } else {
            0.0
        };

        Ok(SandboxUsage {
            peak_memory_bytes,
            cpu_percent,
        })
    }

    async fn remove(&self, handle: &str, force: bool) -> Result<(), SandboxError> {
        self.docker
            .remove_container(
                handle,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| SandboxError::Backend(format!("remove: {}", e)))
    }
}
