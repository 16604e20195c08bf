//! In-process collaborators for builder tests

use super::Builder;
use crate::config::schema::BuildConfig;
use crate::container::{CommitConfig, ContainerBackend, CreatedContainer, HostConfig};
use crate::context::BuildContext;
use crate::error::{StrataError, StrataResult};
use crate::image::{ChildConfig, ImageConfig, ImageId, ImageRecord, Platform};
use crate::output::Progress;
use crate::runconfig::RunConfig;
use crate::store::{CommittedLayer, ImageStore, LocalStore, RwLayer};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Store whose reads and writes can be made to fail
pub struct FailingStore {
    inner: LocalStore,
    fail_children: AtomicBool,
    fail_create: AtomicBool,
}

impl FailingStore {
    pub fn fail_children(&self, fail: bool) {
        self.fail_children.store(fail, Ordering::SeqCst);
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ImageStore for FailingStore {
    async fn get_image(&self, id: &ImageId) -> StrataResult<ImageRecord> {
        self.inner.get_image(id).await
    }

    async fn lookup(&self, reference: &str) -> StrataResult<ImageRecord> {
        self.inner.lookup(reference).await
    }

    async fn create_image(
        &self,
        config: &[u8],
        parent: Option<&ImageId>,
        layer_digest: &str,
    ) -> StrataResult<ImageRecord> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(StrataError::Internal("image index is read-only".into()));
        }
        self.inner.create_image(config, parent, layer_digest).await
    }

    async fn children(&self, parent: &ImageId) -> StrataResult<Vec<ImageRecord>> {
        if self.fail_children.load(Ordering::SeqCst) {
            return Err(StrataError::Internal("image index unavailable".into()));
        }
        self.inner.children(parent).await
    }

    async fn new_rw_layer(&self, image: &ImageId) -> StrataResult<RwLayer> {
        self.inner.new_rw_layer(image).await
    }

    async fn commit_rw_layer(&self, layer: &RwLayer) -> StrataResult<CommittedLayer> {
        self.inner.commit_rw_layer(layer).await
    }

    async fn release_layer(&self, layer: &CommittedLayer) -> StrataResult<()> {
        self.inner.release_layer(layer).await
    }
}

struct FakeContainer {
    image: ImageId,
    layer: RwLayer,
    config: RunConfig,
}

/// Backend that "runs" containers by doing nothing.
///
/// Commands containing `exit <n>` with a non-zero `n` fail.
pub struct FakeBackend {
    store: Arc<dyn ImageStore>,
    containers: tokio::sync::Mutex<HashMap<String, FakeContainer>>,
    started: Mutex<Vec<RunConfig>>,
    created: AtomicUsize,
    removed: AtomicUsize,
}

impl FakeBackend {
    pub fn new(store: Arc<dyn ImageStore>) -> Self {
        Self {
            store,
            containers: tokio::sync::Mutex::new(HashMap::new()),
            started: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
        }
    }

    /// Configurations of started containers, in order
    pub fn started(&self) -> Vec<RunConfig> {
        self.started.lock().unwrap().clone()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }
}

fn exit_code(cmd: &[String]) -> i32 {
    let words: Vec<&str> = cmd.iter().flat_map(|arg| arg.split_whitespace()).collect();
    words
        .windows(2)
        .find(|pair| pair[0] == "exit")
        .and_then(|pair| pair[1].parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl ContainerBackend for FakeBackend {
    async fn create(
        &self,
        image: &ImageId,
        config: &RunConfig,
        _host: &HostConfig,
    ) -> StrataResult<CreatedContainer> {
        let layer = self.store.new_rw_layer(image).await?;
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        let id = format!("{:064x}", n + 1);
        self.containers.lock().await.insert(
            id.clone(),
            FakeContainer {
                image: image.clone(),
                layer,
                config: config.clone(),
            },
        );
        Ok(CreatedContainer {
            id,
            warnings: Vec::new(),
        })
    }

    async fn start(&self, id: &str, on_output: &(dyn Fn(String) + Send + Sync)) -> StrataResult<()> {
        let config = self
            .containers
            .lock()
            .await
            .get(id)
            .map(|c| c.config.clone())
            .ok_or_else(|| StrataError::ContainerNotFound(id.to_string()))?;
        self.started.lock().unwrap().push(config.clone());

        on_output(format!("running {}", config.cmd.join(" ")));
        match exit_code(&config.cmd) {
            0 => Ok(()),
            code => Err(StrataError::ContainerCommand {
                command: config.cmd.join(" "),
                code,
            }),
        }
    }

    async fn create_workdir(&self, id: &str, path: &str) -> StrataResult<()> {
        let containers = self.containers.lock().await;
        let container = containers
            .get(id)
            .ok_or_else(|| StrataError::ContainerNotFound(id.to_string()))?;
        let dir = container.layer.root().join(path.trim_start_matches('/'));
        fs::create_dir_all(&dir).map_err(|e| StrataError::io(format!("creating {}", dir.display()), e))
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
        let record = self
            .store
            .create_image(&config.to_bytes()?, Some(&container.image), &committed.digest)
            .await?;
        Ok(record.id)
    }

    async fn remove(&self, id: &str) -> StrataResult<()> {
        if self.containers.lock().await.remove(id).is_some() {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "Fake"
    }
}

/// A store holding a tagged base image, a build context and a fake backend
pub struct TestEnv {
    _root: TempDir,
    pub context: TempDir,
    pub local: LocalStore,
    pub store: Arc<FailingStore>,
    pub backend: Arc<FakeBackend>,
    pub base: ImageRecord,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_platform(Platform::new("linux", "amd64")).await
    }

    pub async fn with_platform(platform: Platform) -> Self {
        let root = TempDir::new().unwrap();
        let rootfs = root.path().join("rootfs");
        fs::create_dir_all(rootfs.join("etc")).unwrap();
        fs::write(
            rootfs.join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\napp:x:1000:1000::/home/app:/bin/sh\n",
        )
        .unwrap();
        fs::write(rootfs.join("etc/group"), "root:x:0:\napp:x:1000:\n").unwrap();

        let local = LocalStore::open(root.path().join("store")).unwrap();
        let base = local
            .import_rootfs(&rootfs, &platform, RunConfig::default())
            .await
            .unwrap();
        local.tag("base", &base.id).unwrap();

        let store = Arc::new(FailingStore {
            inner: local.clone(),
            fail_children: AtomicBool::new(false),
            fail_create: AtomicBool::new(false),
        });
        let backend = Arc::new(FakeBackend::new(store.clone()));

        Self {
            _root: root,
            context: TempDir::new().unwrap(),
            local,
            store,
            backend,
            base,
        }
    }

    pub fn builder(&self) -> Builder {
        self.builder_with(Progress::quiet(), BuildConfig::default())
    }

    pub fn builder_with(&self, progress: Progress, options: BuildConfig) -> Builder {
        Builder::new(
            self.store.clone(),
            self.backend.clone(),
            BuildContext::new(self.context.path()),
            &options,
            progress,
        )
        .unwrap()
    }

    pub fn layer_exists(&self, diff_id: &str) -> bool {
        let hex = diff_id.trim_start_matches("sha256:");
        self.local.root().join("layers").join(format!("{}.json", hex)).exists()
    }
}
