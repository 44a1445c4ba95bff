//! Session processes as Docker containers.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{OrchestratorError, ProcessExit, ProcessHandle, ProcessSupervisor, SpawnSpec, Spawned};

/// Container settings applied to every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerConfig {
    pub image: String,
    /// Memory limit in Docker syntax (`2g`, `512m`).
    pub memory: String,
    pub cpus: String,
    pub pids_limit: u32,
    /// Docker network to attach to; the default bridge when `None`.
    pub network: Option<String>,
    /// The docker CLI to invoke.
    pub docker_binary: String,
    /// Seconds `docker stop` waits before it kills.
    pub stop_timeout_secs: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: "slotkeeper-session:latest".to_string(),
            memory: "2g".to_string(),
            cpus: "2".to_string(),
            pids_limit: 256,
            network: None,
            docker_binary: "docker".to_string(),
            stop_timeout_secs: 10,
        }
    }
}

impl ContainerConfig {
    /// The full `docker run` argument list for `spec` (binary excluded).
    pub fn run_args(&self, spec: &SpawnSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "-i".into(),
            "--name".into(),
            spec.name.clone(),
            "--env-file".into(),
            spec.secrets_ref.clone(),
            "--memory".into(),
            self.memory.clone(),
            "--cpus".into(),
            self.cpus.clone(),
            "--pids-limit".into(),
            self.pids_limit.to_string(),
        ];
        if let Some(network) = &self.network {
            args.push("--network".into());
            args.push(network.clone());
        }
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(self.image.clone());
        args
    }
}

/// Runs each session as `docker run --rm -i ...`.
///
/// The local `docker` client process is the child we supervise: it exits
/// when the container does, and its stdout/stderr are the container's.
#[derive(Debug, Clone, Default)]
pub struct DockerSupervisor {
    config: ContainerConfig,
}

impl DockerSupervisor {
    pub fn new(config: ContainerConfig) -> Self {
        Self { config }
    }
}

impl ProcessSupervisor for DockerSupervisor {
    type Handle = DockerHandle;

    async fn spawn(&self, spec: &SpawnSpec) -> Result<Spawned<DockerHandle>, OrchestratorError> {
        let args = self.config.run_args(spec);
        tracing::info!(
            session_id = %spec.session_id,
            container = %spec.name,
            image = %self.config.image,
            "starting session container"
        );

        let mut child = Command::new(&self.config.docker_binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OrchestratorError::Spawn(format!("{}: {e}", self.config.docker_binary)))?;

        if let Some(out) = child.stdout.take() {
            tokio::spawn(forward_lines(spec.name.clone(), "stdout", out));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(forward_lines(spec.name.clone(), "stderr", err));
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        let kill = CancellationToken::new();
        let kill_signal = kill.clone();
        let name = spec.name.clone();
        tokio::spawn(async move {
            let exit = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => ProcessExit { code: status.code() },
                    Err(e) => {
                        tracing::warn!(container = %name, error = %e, "wait on container failed");
                        ProcessExit { code: None }
                    }
                },
                () = kill_signal.cancelled() => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(container = %name, error = %e, "kill of docker client failed");
                    }
                    ProcessExit { code: None }
                }
            };
            tracing::info!(container = %name, code = ?exit.code, "session container exited");
            let _ = exit_tx.send(exit);
        });

        Ok(Spawned {
            handle: DockerHandle {
                name: spec.name.clone(),
                docker_binary: self.config.docker_binary.clone(),
                stop_timeout: Duration::from_secs(self.config.stop_timeout_secs),
                kill,
            },
            exited: exit_rx,
        })
    }
}

async fn forward_lines(container: String, stream: &'static str, pipe: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::debug!(%container, stream, "{line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(%container, stream, error = %e, "stopped reading container output");
                break;
            }
        }
    }
}

/// Controls one running container by name.
#[derive(Debug)]
pub struct DockerHandle {
    name: String,
    docker_binary: String,
    stop_timeout: Duration,
    kill: CancellationToken,
}

impl DockerHandle {
    async fn docker(&self, args: &[&str]) -> Result<(), OrchestratorError> {
        let output = Command::new(&self.docker_binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(OrchestratorError::Control(format!(
                "docker {} {}: {}",
                args.first().copied().unwrap_or_default(),
                self.name,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

impl ProcessHandle for DockerHandle {
    async fn terminate(&self) -> Result<(), OrchestratorError> {
        let secs = self.stop_timeout.as_secs().to_string();
        self.docker(&["stop", "-t", &secs, &self.name]).await
    }

    async fn kill(&self) -> Result<(), OrchestratorError> {
        let result = self.docker(&["kill", &self.name]).await;
        self.kill.cancel();
        result
    }
}
