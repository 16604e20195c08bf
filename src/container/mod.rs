//! Build containers
//!
//! The engine creates, runs and commits containers only through
//! [`ContainerBackend`]. [`Containers`] wraps a backend with the build's
//! output stream and remembers every container it created so they can be
//! removed when the build ends.

pub mod host;
pub mod podman;

pub use host::{host_config_from_options, HostConfig};
pub use podman::PodmanBackend;

use crate::config::Config;
use crate::error::{StrataError, StrataResult};
use crate::image::ImageId;
use crate::output::Progress;
use crate::runconfig::RunConfig;
use crate::store::ImageStore;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

/// A container created for one build step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedContainer {
    pub id: String,
    /// Non-fatal anomalies reported by the runtime
    pub warnings: Vec<String>,
}

/// Everything needed to turn a finished container into an image
#[derive(Debug, Clone)]
pub struct CommitConfig {
    pub author: String,
    /// Configuration containers started from the new image use
    pub config: RunConfig,
    /// Candidate configuration the container was probed with
    pub container_config: RunConfig,
    pub container_id: String,
}

/// Container runtime used for build steps
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Create (but do not start) a container from `image`
    async fn create(
        &self,
        image: &ImageId,
        config: &RunConfig,
        host: &HostConfig,
    ) -> StrataResult<CreatedContainer>;

    /// Run the container to completion, streaming its output by line.
    ///
    /// A non-zero exit status is an error.
    async fn start(&self, id: &str, on_output: &(dyn Fn(String) + Send + Sync)) -> StrataResult<()>;

    /// Make sure `path` exists as a directory inside the container
    async fn create_workdir(&self, id: &str, path: &str) -> StrataResult<()>;

    /// Commit the container's filesystem as a child of its image
    async fn commit_build_step(&self, commit: CommitConfig) -> StrataResult<ImageId>;

    /// Remove the container and everything it holds
    async fn remove(&self, id: &str) -> StrataResult<()>;

    /// Human-readable backend name for display
    fn backend_name(&self) -> &'static str;
}

/// Create the container backend for this host
pub fn create_backend(
    config: &Config,
    store: Arc<dyn ImageStore>,
) -> StrataResult<Arc<dyn ContainerBackend>> {
    match std::env::consts::OS {
        "linux" => Ok(Arc::new(PodmanBackend::new(config.runtime.clone(), store))),
        other => Err(StrataError::UnsupportedPlatform(other.to_string())),
    }
}

/// Lifecycle of the containers of one build
pub struct Containers {
    backend: Arc<dyn ContainerBackend>,
    progress: Progress,
    live: Vec<String>,
    created: usize,
}

impl Containers {
    pub fn new(backend: Arc<dyn ContainerBackend>, progress: Progress) -> Self {
        Self {
            backend,
            progress,
            live: Vec::new(),
            created: 0,
        }
    }

    /// Create a container, reporting its warnings and id on the build output
    pub async fn create(
        &mut self,
        image: &ImageId,
        config: &RunConfig,
        host: &HostConfig,
    ) -> StrataResult<String> {
        debug!("[BUILDER] Command to be executed: {:?}", config.cmd);

        let container = self
            .backend
            .create(image, config, host)
            .await
            .map_err(|e| match e {
                StrataError::ContainerCreate(_) => e,
                other if other.is_invalid_parameter() => other,
                other => StrataError::ContainerCreate(other.to_string()),
            })?;

        for warning in &container.warnings {
            warn!("Container {}: {}", container.id, warning);
            self.progress.warning(warning);
        }
        self.progress.running_in(&container.id);

        self.live.push(container.id.clone());
        self.created += 1;
        Ok(container.id)
    }

    /// Run a created container, forwarding its output to the build output
    pub async fn run(&self, id: &str) -> StrataResult<()> {
        let progress = self.progress.clone();
        let on_output = move |line: String| progress.line(&line);
        self.backend.start(id, &on_output).await
    }

    pub async fn create_workdir(&self, id: &str, path: &str) -> StrataResult<()> {
        self.backend.create_workdir(id, path).await
    }

    pub async fn commit(&self, commit: CommitConfig) -> StrataResult<ImageId> {
        self.backend.commit_build_step(commit).await
    }

    /// Remove every container created so far.
    ///
    /// All removals are attempted; the first error is returned.
    pub async fn remove_all(&mut self) -> StrataResult<()> {
        let mut first_err = None;
        for id in self.live.drain(..) {
            match self.backend.remove(&id).await {
                Ok(()) => self.progress.removed(&id),
                Err(e) => {
                    warn!("Failed to remove container {}: {}", id, e);
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Containers created over the lifetime of this adapter
    pub fn created_count(&self) -> usize {
        self.created
    }
}

/// Stream stdout+stderr from a child process, calling `on_output` for each line.
///
/// Returns all collected output lines for error reporting. Streams that were
/// not piped are treated as already closed.
pub(crate) async fn stream_child_output(
    child: &mut tokio::process::Child,
    on_output: &(dyn Fn(String) + Send + Sync),
) -> Vec<String> {
    let mut stderr_reader = child.stderr.take().map(|s| BufReader::new(s).lines());
    let mut stdout_reader = child.stdout.take().map(|s| BufReader::new(s).lines());

    let mut all_output = Vec::new();
    let mut stderr_done = stderr_reader.is_none();
    let mut stdout_done = stdout_reader.is_none();

    while !stderr_done || !stdout_done {
        tokio::select! {
            line = async { stderr_reader.as_mut()?.next_line().await.ok().flatten() }, if !stderr_done => {
                match line {
                    Some(line) => {
                        on_output(line.clone());
                        all_output.push(line);
                    }
                    None => stderr_done = true,
                }
            }
            line = async { stdout_reader.as_mut()?.next_line().await.ok().flatten() }, if !stdout_done => {
                match line {
                    Some(line) => {
                        on_output(line.clone());
                        all_output.push(line);
                    }
                    None => stdout_done = true,
                }
            }
        }
    }

    all_output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::SharedBuffer;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        removed: Mutex<Vec<String>>,
        fail_remove: bool,
    }

    #[async_trait]
    impl ContainerBackend for Recorder {
        async fn create(
            &self,
            image: &ImageId,
            _config: &RunConfig,
            _host: &HostConfig,
        ) -> StrataResult<CreatedContainer> {
            Ok(CreatedContainer {
                id: format!("0123456789abcdef-{}", image.hex()),
                warnings: vec!["memory limit ignored".into()],
            })
        }

        async fn start(
            &self,
            _id: &str,
            on_output: &(dyn Fn(String) + Send + Sync),
        ) -> StrataResult<()> {
            on_output("hello from the container".into());
            Ok(())
        }

        async fn create_workdir(&self, _id: &str, _path: &str) -> StrataResult<()> {
            Ok(())
        }

        async fn commit_build_step(&self, _commit: CommitConfig) -> StrataResult<ImageId> {
            Ok(ImageId::new("sha256:feed"))
        }

        async fn remove(&self, id: &str) -> StrataResult<()> {
            if self.fail_remove {
                return Err(StrataError::command_exec("podman rm", "device busy"));
            }
            self.removed.lock().unwrap().push(id.to_string());
            Ok(())
        }

        fn backend_name(&self) -> &'static str {
            "Recorder"
        }
    }

    #[tokio::test]
    async fn create_reports_warnings_before_running_in() {
        let buffer = SharedBuffer::new();
        let backend = Arc::new(Recorder::default());
        let mut containers = Containers::new(backend.clone(), Progress::new(buffer.clone()));

        let id = containers
            .create(
                &ImageId::new("sha256:abc"),
                &RunConfig::default(),
                &host_config_from_options(&Default::default(), "linux"),
            )
            .await
            .unwrap();
        containers.run(&id).await.unwrap();
        containers.remove_all().await.unwrap();

        let out = buffer.contents();
        let warning = out.find("[Warning] memory limit ignored").unwrap();
        let running = out.find("Running in 0123456789ab").unwrap();
        assert!(warning < running);
        assert!(out.contains("hello from the container"));
        assert!(out.contains("Removed intermediate container"));
        assert_eq!(containers.created_count(), 1);
        assert_eq!(backend.removed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_all_reports_first_failure() {
        let backend = Arc::new(Recorder {
            fail_remove: true,
            ..Recorder::default()
        });
        let mut containers = Containers::new(backend, Progress::quiet());
        for _ in 0..2 {
            containers
                .create(
                    &ImageId::new("sha256:abc"),
                    &RunConfig::default(),
                    &host_config_from_options(&Default::default(), "linux"),
                )
                .await
                .unwrap();
        }
        assert!(containers.remove_all().await.is_err());
        // Nothing is retried on the next call
        assert!(containers.remove_all().await.is_ok());
    }

    #[tokio::test]
    async fn stream_collects_both_pipes() {
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "echo out; echo err >&2"])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let seen = Mutex::new(Vec::new());
        let lines = stream_child_output(&mut child, &|line: String| seen.lock().unwrap().push(line)).await;
        child.wait().await.unwrap();

        let mut lines = lines;
        lines.sort();
        assert_eq!(lines, vec!["err", "out"]);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
