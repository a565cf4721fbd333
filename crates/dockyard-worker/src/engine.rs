//! Container engine driver.
//!
//! The agent talks to the engine through [`ContainerEngine`]. The
//! production implementation, [`DockerEngine`], shells out to the `docker`
//! CLI (or any binary with the same command surface) and inspects every
//! exit status: a non-zero exit is an [`EngineError::CommandFailed`]
//! carrying stderr, never a success.
//!
//! Child processes are spawned with `kill_on_drop`, so dropping an
//! in-flight operation (e.g. on shutdown) terminates the subprocess.

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// Raw image archive as streamed from the registry.
pub type ArtifactStream = BoxStream<'static, io::Result<Bytes>>;

/// What the engine knows about a named container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Missing,
    Running,
    /// Exists but is not running (exited, created, dead).
    Stopped,
}

/// Everything needed to run one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    /// `application:version`.
    pub image: String,
    /// Container name; the instance id.
    pub name: String,
    pub env: Vec<(String, String)>,
    pub internal_port: u16,
    pub external_port: u16,
}

impl RunSpec {
    /// Arguments for a detached `run` of this spec.
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string()];
        for (key, value) in &self.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        args.extend([
            "--expose".to_string(),
            self.internal_port.to_string(),
            "-p".to_string(),
            format!("{}:{}", self.external_port, self.internal_port),
            "--name".to_string(),
            self.name.clone(),
            "-d".to_string(),
            self.image.clone(),
        ]);
        args
    }
}

#[async_trait]
pub trait ContainerEngine: Send + Sync + 'static {
    /// Whether `image` (`repository:tag`) is present locally.
    async fn has_image(&self, image: &str) -> EngineResult<bool>;

    /// Load an image archive.
    async fn load_image(&self, artifact: ArtifactStream) -> EngineResult<()>;

    async fn container_state(&self, name: &str) -> EngineResult<ContainerState>;

    /// Start a detached container.
    async fn run(&self, spec: &RunSpec) -> EngineResult<()>;

    async fn remove(&self, name: &str, force: bool) -> EngineResult<()>;
}

// ── Docker CLI ─────────────────────────────────────────────────────

/// [`ContainerEngine`] backed by the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    binary: String,
}

impl DockerEngine {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command_line(&self, args: &[String]) -> String {
        format!("{} {}", self.binary, args.join(" "))
    }

    /// Run to completion, returning stdout on a zero exit.
    async fn output(&self, args: Vec<String>) -> EngineResult<String> {
        let command = self.command_line(&args);
        debug!(%command, "engine command");

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| EngineError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(EngineError::CommandFailed {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for DockerEngine {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn has_image(&self, image: &str) -> EngineResult<bool> {
        let out = self
            .output(vec![
                "images".to_string(),
                "--format={{.Repository}}:{{.Tag}}".to_string(),
            ])
            .await?;
        Ok(out.lines().any(|line| line.trim() == image))
    }

    async fn load_image(&self, mut artifact: ArtifactStream) -> EngineResult<()> {
        let args = vec!["load".to_string()];
        let command = self.command_line(&args);
        debug!(%command, "engine command");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                command: command.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            while let Some(chunk) = artifact.next().await {
                let chunk = chunk.map_err(EngineError::Stream)?;
                match stdin.write_all(&chunk).await {
                    Ok(()) => {}
                    // The engine stopped reading; its exit status says why.
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => break,
                    Err(e) => return Err(e.into()),
                }
            }
            match stdin.shutdown().await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(e.into()),
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(EngineError::CommandFailed {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn container_state(&self, name: &str) -> EngineResult<ContainerState> {
        let out = self
            .output(vec![
                "ps".to_string(),
                "-a".to_string(),
                "--format={{.Names}}\t{{.State}}".to_string(),
            ])
            .await?;
        Ok(parse_container_state(&out, name))
    }

    async fn run(&self, spec: &RunSpec) -> EngineResult<()> {
        self.output(spec.run_args()).await.map(|_| ())
    }

    async fn remove(&self, name: &str, force: bool) -> EngineResult<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("--force".to_string());
        }
        args.push(name.to_string());
        self.output(args).await.map(|_| ())
    }
}

/// Find `name` in `ps -a` output of `name<TAB>state` lines.
fn parse_container_state(output: &str, name: &str) -> ContainerState {
    output
        .lines()
        .filter_map(|line| line.split_once('\t'))
        .find(|(candidate, _)| candidate.trim() == name)
        .map_or(ContainerState::Missing, |(_, state)| {
            if state.trim().eq_ignore_ascii_case("running") {
                ContainerState::Running
            } else {
                ContainerState::Stopped
            }
        })
}
