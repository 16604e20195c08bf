//! Podman container backend
//!
//! Build containers run directly on a writable layer from the store via
//! `podman create --rootfs`. Committing a container commits that layer,
//! so podman never needs to know about images.

use super::{stream_child_output, CommitConfig, ContainerBackend, CreatedContainer, HostConfig};
use crate::config::schema::RuntimeConfig;
use crate::error::{StrataError, StrataResult};
use crate::fsutil::resolve_in_root;
use crate::image::{ChildConfig, ImageConfig, ImageId};
use crate::runconfig::RunConfig;
use crate::runtime_spec::{NetworkInfoSource, RuntimeSpec, SpecContext};
use crate::store::{ImageStore, RwLayer};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Max number of output lines logged when a build step fails
const FAILED_STEP_TAIL_LINES: usize = 50;

/// State podman does not track for us
struct BuildContainer {
    image: ImageId,
    layer: RwLayer,
    command: String,
}

/// Container backend driving the podman CLI
pub struct PodmanBackend {
    runtime: RuntimeConfig,
    store: Arc<dyn ImageStore>,
    containers: Mutex<HashMap<String, BuildContainer>>,
}

impl PodmanBackend {
    pub fn new(runtime: RuntimeConfig, store: Arc<dyn ImageStore>) -> Self {
        Self {
            runtime,
            store,
            containers: Mutex::new(HashMap::new()),
        }
    }

    /// Execute a Podman command and return the output
    async fn exec(&self, args: &[&str]) -> StrataResult<std::process::Output> {
        podman_exec(&self.runtime.podman, args).await
    }
}

async fn podman_exec(podman: &str, args: &[&str]) -> StrataResult<std::process::Output> {
    debug!("Executing: {} {:?}", podman, args);

    Command::new(podman)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| StrataError::command_failed(format!("{} {:?}", podman, args), e))
}

/// Network driver data from `podman network inspect`
pub struct PodmanNetworks {
    podman: String,
}

impl PodmanNetworks {
    pub fn new(podman: impl Into<String>) -> Self {
        Self {
            podman: podman.into(),
        }
    }
}

#[async_trait]
impl NetworkInfoSource for PodmanNetworks {
    async fn driver_info(&self, network: &str) -> StrataResult<Map<String, Value>> {
        // The bridge network mode uses podman's default network
        let name = if network == "bridge" { "podman" } else { network };
        let output = podman_exec(&self.podman, &["network", "inspect", name]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StrataError::command_exec("podman network inspect", stderr));
        }

        let parsed: Value = serde_json::from_slice(&output.stdout)?;
        match parsed {
            Value::Array(mut networks) if !networks.is_empty() => match networks.swap_remove(0) {
                Value::Object(info) => Ok(info),
                _ => Ok(Map::new()),
            },
            Value::Object(info) => Ok(info),
            _ => Ok(Map::new()),
        }
    }
}

fn flag(args: &mut Vec<String>, name: &str, value: impl ToString) {
    args.push(name.to_string());
    args.push(value.to_string());
}

/// Arguments for `podman create` running `spec` on `rootfs`
fn create_args(spec: &RuntimeSpec, host: &HostConfig, rootfs: &Path) -> Vec<String> {
    let mut args = vec!["create".to_string()];
    let r = &host.resources;

    flag(&mut args, "--workdir", &spec.process.cwd);
    if !spec.process.user.is_empty() {
        flag(&mut args, "--user", &spec.process.user);
    }
    for env in &spec.process.env {
        flag(&mut args, "--env", env);
    }
    flag(&mut args, "--network", &host.network_mode);
    flag(&mut args, "--log-driver", &host.log_config.kind);
    for opt in &host.security_opt {
        flag(&mut args, "--security-opt", opt);
    }
    for extra in &host.extra_hosts {
        flag(&mut args, "--add-host", extra);
    }
    if !r.cgroup_parent.is_empty() {
        flag(&mut args, "--cgroup-parent", &r.cgroup_parent);
    }
    if r.cpu_shares > 0 {
        flag(&mut args, "--cpu-shares", r.cpu_shares);
    }
    if r.cpu_period > 0 {
        flag(&mut args, "--cpu-period", r.cpu_period);
    }
    if r.cpu_quota > 0 {
        flag(&mut args, "--cpu-quota", r.cpu_quota);
    }
    if r.nano_cpus > 0 {
        flag(&mut args, "--cpus", r.nano_cpus as f64 / 1e9);
    }
    if !r.cpuset_cpus.is_empty() {
        flag(&mut args, "--cpuset-cpus", &r.cpuset_cpus);
    }
    if !r.cpuset_mems.is_empty() {
        flag(&mut args, "--cpuset-mems", &r.cpuset_mems);
    }
    if r.memory > 0 {
        flag(&mut args, "--memory", r.memory);
        if r.memory_swap != 0 {
            flag(&mut args, "--memory-swap", r.memory_swap);
        }
    }
    if host.shm_size > 0 {
        flag(&mut args, "--shm-size", host.shm_size);
    }
    for ulimit in &r.ulimits {
        flag(
            &mut args,
            "--ulimit",
            format!("{}={}:{}", ulimit.name, ulimit.soft, ulimit.hard),
        );
    }
    for device in &r.devices {
        let mut value = device.path_on_host.clone();
        if !device.path_in_container.is_empty() {
            value.push(':');
            value.push_str(&device.path_in_container);
            if !device.cgroup_permissions.is_empty() {
                value.push(':');
                value.push_str(&device.cgroup_permissions);
            }
        }
        flag(&mut args, "--device", value);
    }

    args.push("--rootfs".to_string());
    args.push(rootfs.display().to_string());
    args.extend(spec.process.args.iter().cloned());
    args
}

/// Host-side path of `path` inside a container rooted at `root`
fn path_in_root(root: &Path, path: &str) -> StrataResult<PathBuf> {
    resolve_in_root(root, Path::new(path))
}

#[async_trait]
impl ContainerBackend for PodmanBackend {
    async fn create(
        &self,
        image: &ImageId,
        config: &RunConfig,
        host: &HostConfig,
    ) -> StrataResult<CreatedContainer> {
        let record = self.store.get_image(image).await?;
        let os = record.config.os.clone();
        if os.eq_ignore_ascii_case("windows") {
            return Err(StrataError::ContainerCreate(
                "podman cannot run windows containers".into(),
            ));
        }

        let layer = self.store.new_rw_layer(image).await?;
        let networks = PodmanNetworks::new(self.runtime.podman.clone());
        let num_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let ctx = SpecContext {
            container_id: layer.id(),
            os: &os,
            credential_spec_root: &self.runtime.credential_spec_root,
            num_cpus,
            networks: &networks,
            network_policy: self.runtime.network_info_policy,
            config_store: None,
        };
        let spec = RuntimeSpec::synthesize(config, host, &ctx).await?;

        let mut warnings = Vec::new();
        if spec.network.skipped > 0 {
            warnings.push(format!(
                "driver info unavailable for {} network(s); their endpoints were skipped",
                spec.network.skipped
            ));
        }
        if host.resources.memory_swap != 0 && host.resources.memory <= 0 {
            warnings.push("memory_swap is ignored without a memory limit".to_string());
        }

        let args = create_args(&spec, host, layer.root());
        let args_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.exec(&args_refs).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StrataError::ContainerCreate(stderr.trim().to_string()));
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("Container created: {}", &id[..12.min(id.len())]);

        self.containers.lock().await.insert(
            id.clone(),
            BuildContainer {
                image: image.clone(),
                layer,
                command: spec.process.args.join(" "),
            },
        );

        Ok(CreatedContainer { id, warnings })
    }

    async fn start(&self, id: &str, on_output: &(dyn Fn(String) + Send + Sync)) -> StrataResult<()> {
        let command = self
            .containers
            .lock()
            .await
            .get(id)
            .map(|c| c.command.clone())
            .ok_or_else(|| StrataError::ContainerNotFound(id.to_string()))?;

        debug!("Starting container: {}", id);
        let mut child = Command::new(&self.runtime.podman)
            .args(["start", "--attach", id])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StrataError::command_failed("podman start", e))?;

        let output = stream_child_output(&mut child, on_output).await;
        let status = child
            .wait()
            .await
            .map_err(|e| StrataError::command_failed("podman start", e))?;

        if status.success() {
            return Ok(());
        }

        let tail = &output[output.len().saturating_sub(FAILED_STEP_TAIL_LINES)..];
        debug!("Output of failed container {}:\n{}", id, tail.join("\n"));
        Err(StrataError::ContainerCommand {
            command,
            code: status.code().unwrap_or(-1),
        })
    }

    async fn create_workdir(&self, id: &str, path: &str) -> StrataResult<()> {
        let dir = {
            let containers = self.containers.lock().await;
            let container = containers
                .get(id)
                .ok_or_else(|| StrataError::ContainerNotFound(id.to_string()))?;
            path_in_root(container.layer.root(), path)?
        };
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StrataError::io(format!("creating {}", dir.display()), e))
    }

    async fn commit_build_step(&self, commit: CommitConfig) -> StrataResult<ImageId> {
        let containers = self.containers.lock().await;
        let container = containers
            .get(&commit.container_id)
            .ok_or_else(|| StrataError::ContainerNotFound(commit.container_id.clone()))?;

        let committed = self.store.commit_rw_layer(&container.layer).await?;
        let parent = self.store.get_image(&container.image).await?;
        let config = ImageConfig::child(
            &parent.config,
            ChildConfig {
                author: commit.author,
                container_config: commit.container_config,
                diff_id: committed.diff_id.clone(),
                empty_layer: committed.empty,
                config: commit.config,
            },
            &parent.config.os,
        );

        let registered = match config.to_bytes() {
            Ok(bytes) => {
                self.store
                    .create_image(&bytes, Some(&container.image), &committed.digest)
                    .await
            }
            Err(e) => Err(e),
        };

        match registered {
            Ok(record) => {
                info!(
                    "Committed container {} as {}",
                    &commit.container_id[..12.min(commit.container_id.len())],
                    record.id.short()
                );
                Ok(record.id)
            }
            Err(e) => {
                if let Err(release) = self.store.release_layer(&committed).await {
                    warn!("Failed to release layer {}: {}", committed.diff_id, release);
                }
                Err(StrataError::Commit {
                    container: commit.container_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn remove(&self, id: &str) -> StrataResult<()> {
        debug!("Removing container: {}", id);

        let output = self.exec(&["rm", "-f", id]).await;
        // The writable layer goes with the container either way
        self.containers.lock().await.remove(id);
        let output = output?;

        if output.status.success() {
            Ok(())
        } else {
            // Ignore error if container doesn't exist
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("no such container") {
                Ok(())
            } else {
                Err(StrataError::command_exec("podman rm", stderr))
            }
        }
    }

    fn backend_name(&self) -> &'static str {
        "Podman"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{BuildConfig, DeviceMapping, Ulimit};
    use crate::container::host::host_config_from_options;
    use crate::runtime_spec::{NetworkSpec, ProcessSpec};
    use crate::store::LocalStore;
    use tempfile::TempDir;

    fn spec(args: &[&str]) -> RuntimeSpec {
        RuntimeSpec {
            os: "linux".into(),
            process: ProcessSpec {
                args: args.iter().map(|s| s.to_string()).collect(),
                cwd: "/src".into(),
                env: vec!["PATH=/bin".into()],
                user: "1000".into(),
            },
            resources: None,
            devices: Vec::new(),
            credential_spec: None,
            network: NetworkSpec::default(),
        }
    }

    #[test]
    fn create_args_put_command_after_rootfs() {
        let host = host_config_from_options(&BuildConfig::default(), "linux");
        let args = create_args(&spec(&["/bin/sh", "-c", "make"]), &host, Path::new("/scratch/x"));

        let rootfs = args.iter().position(|a| a == "--rootfs").unwrap();
        assert_eq!(args[rootfs + 1], "/scratch/x");
        assert_eq!(&args[rootfs + 2..], ["/bin/sh", "-c", "make"]);
        assert!(args.windows(2).any(|w| w == ["--workdir", "/src"]));
        assert!(args.windows(2).any(|w| w == ["--user", "1000"]));
        assert!(args.windows(2).any(|w| w == ["--network", "bridge"]));
        assert!(args.windows(2).any(|w| w == ["--log-driver", "none"]));
        assert!(!args.iter().any(|a| a == "--memory"));
    }

    #[test]
    fn create_args_carry_limits() {
        let options = BuildConfig {
            memory: 1 << 30,
            memory_swap: -1,
            cpu_shares: 512,
            nano_cpus: 1_500_000_000,
            ulimits: vec![Ulimit {
                name: "nofile".into(),
                soft: 1024,
                hard: 2048,
            }],
            devices: vec![DeviceMapping {
                path_on_host: "/dev/fuse".into(),
                path_in_container: "/dev/fuse".into(),
                cgroup_permissions: "rwm".into(),
            }],
            ..BuildConfig::default()
        };
        let host = host_config_from_options(&options, "linux");
        let args = create_args(&spec(&["true"]), &host, Path::new("/r"));

        assert!(args.windows(2).any(|w| w == ["--memory", "1073741824"]));
        assert!(args.windows(2).any(|w| w == ["--memory-swap", "-1"]));
        assert!(args.windows(2).any(|w| w == ["--cpu-shares", "512"]));
        assert!(args.windows(2).any(|w| w == ["--cpus", "1.5"]));
        assert!(args.windows(2).any(|w| w == ["--ulimit", "nofile=1024:2048"]));
        assert!(args.windows(2).any(|w| w == ["--device", "/dev/fuse:/dev/fuse:rwm"]));
    }

    #[test]
    fn workdir_paths_stay_in_root() {
        let root = Path::new("/scratch/abc");
        assert_eq!(path_in_root(root, "/app/src").unwrap(), root.join("app/src"));
        assert_eq!(path_in_root(root, "../../etc").unwrap(), root.join("etc"));
    }

    #[test]
    fn workdir_symlinks_stay_in_root() {
        let root = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("srv")).unwrap();

        let dir = path_in_root(root.path(), "/srv/www").unwrap();
        assert!(dir.starts_with(root.path()));
        assert_eq!(
            dir,
            root.path()
                .join(outside.path().strip_prefix("/").unwrap())
                .join("www")
        );
    }

    #[tokio::test]
    async fn unknown_containers_are_reported() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::open(dir.path()).unwrap());
        let backend = PodmanBackend::new(RuntimeConfig::default(), store);
        assert_eq!(backend.backend_name(), "Podman");

        let err = backend.create_workdir("missing", "/app").await.unwrap_err();
        assert!(matches!(err, StrataError::ContainerNotFound(_)));
        let err = backend
            .commit_build_step(CommitConfig {
                author: String::new(),
                config: RunConfig::default(),
                container_config: RunConfig::default(),
                container_id: "missing".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::ContainerNotFound(_)));
    }
}
