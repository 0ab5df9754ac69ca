//! Docker binding for [`ContainerRuntime`].
//!
//! Shells out to the `docker` CLI. Containers are created with `-i` so the
//! stdio bridge can attach to PID 1's stdin later. A container that fails
//! to start is removed before the error is returned, so no half-created
//! containers leak.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{ContainerIo, ContainerRuntime, ContainerSpec, RuntimeError};

/// Runs agent containers through the `docker` CLI.
#[derive(Debug, Default)]
pub struct DockerRuntime {
    /// Extra flags appended to every `docker create` (e.g. resource caps).
    pub extra_flags: Vec<String>,
}

impl DockerRuntime {
    pub fn new(extra_flags: Vec<String>) -> Self {
        Self { extra_flags }
    }

    fn create_args(&self, spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "-i".to_string(),
            "--name".to_string(),
            spec.name.clone(),
        ];
        // Stable iteration so container invocations are reproducible.
        let mut env: Vec<(&String, &String)> = spec.env.iter().collect();
        env.sort();
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for mount in &spec.mounts {
            let mut binding = format!(
                "{}:{}",
                mount.host_path.display(),
                mount.container_path.display()
            );
            if mount.read_only {
                binding.push_str(":ro");
            }
            args.push("-v".to_string());
            args.push(binding);
        }
        for mapping in &spec.ports {
            args.push("-p".to_string());
            args.push(format!("{}:{}", mapping.host, mapping.container));
        }
        args.extend(self.extra_flags.iter().cloned());
        args.push(spec.image.clone());
        args.extend(spec.cmd.iter().cloned());
        args
    }
}

/// Run a docker subcommand and fail on a non-zero exit.
async fn docker(args: &[String]) -> Result<String, RuntimeError> {
    let command = format!("docker {}", args.first().map(String::as_str).unwrap_or(""));
    let output = Command::new("docker")
        .args(args)
        .output()
        .await
        .map_err(|e| RuntimeError::Exec {
            command: command.clone(),
            source: e,
        })?;

    if !output.status.success() {
        return Err(RuntimeError::CommandFailed {
            command,
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let container_id = docker(&self.create_args(spec)).await?;

        if let Err(e) = docker(&["start".to_string(), container_id.clone()]).await {
            // Remove the created-but-unstarted container.
            let _ = docker(&["rm".to_string(), "-f".to_string(), container_id.clone()]).await;
            return Err(e);
        }

        tracing::info!(container_id = %container_id, name = %spec.name, "container started");
        Ok(container_id)
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), RuntimeError> {
        docker(&[
            "stop".to_string(),
            "-t".to_string(),
            grace.as_secs().max(1).to_string(),
            container_id.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn destroy(&self, container_id: &str) -> Result<(), RuntimeError> {
        match docker(&[
            "rm".to_string(),
            "-f".to_string(),
            container_id.to_string(),
        ])
        .await
        {
            Ok(_) => Ok(()),
            // Already gone counts as destroyed.
            Err(RuntimeError::CommandFailed { stderr, .. })
                if stderr.contains("No such container") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn stdio(&self, container_id: &str) -> Result<ContainerIo, RuntimeError> {
        let mut child = Command::new("docker")
            .args(["attach", container_id])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| RuntimeError::Exec {
                command: "docker attach".to_string(),
                source: e,
            })?;

        let writer = child.stdin.take().ok_or_else(|| RuntimeError::Exec {
            command: "docker attach".to_string(),
            source: std::io::Error::other("attach child has no stdin"),
        })?;
        let reader = child.stdout.take().ok_or_else(|| RuntimeError::Exec {
            command: "docker attach".to_string(),
            source: std::io::Error::other("attach child has no stdout"),
        })?;

        Ok(ContainerIo {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }
}
