//! On-disk content-addressed store
//!
//! # Layout
//!
//! ```text
//! <root>/
//! ├── blobs/sha256/<xx>/<hex>   # file contents, named by digest
//! ├── layers/<hex>.json         # layer manifests, named by diff id
//! ├── images/<hex>.json         # image records, named by image id
//! ├── refs/<hex(name)>          # tags
//! └── scratch/<uuid>/           # writable layers
//! ```
//!
//! Every record is written through a temp file and a rename, so
//! concurrent builds sharing a store only ever see complete files.

use super::layer::{CommittedLayer, LayerRelease, RwLayer};
use super::manifest::{self, EntryKind, LayerManifest, Tree};
use super::ImageStore;
use crate::error::{StrataError, StrataResult};
use crate::fsutil::{set_mode, set_owner, write_atomic};
use crate::image::{ImageConfig, ImageId, ImageRecord, Platform};
use crate::runconfig::RunConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Scratch space for writable layers
struct ScratchArea {
    dir: PathBuf,
    active: Mutex<HashSet<String>>,
    created: AtomicUsize,
}

impl LayerRelease for ScratchArea {
    fn release(&self, id: &str, root: &Path) {
        if let Err(e) = fs::remove_dir_all(root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove writable layer {}: {}", root.display(), e);
            }
        }
        if let Ok(mut active) = self.active.lock() {
            active.remove(id);
        }
        debug!("Released writable layer {}", id);
    }
}

/// A tag pointing at an image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub image: ImageId,
}

/// What a prune pass reclaimed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub layers: usize,
    pub blobs: usize,
    pub scratch: usize,
}

/// Local on-disk store
#[derive(Clone)]
pub struct LocalStore {
    root: PathBuf,
    scratch: Arc<ScratchArea>,
}

impl LocalStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> StrataResult<Self> {
        let root = root.into();
        for dir in ["blobs/sha256", "layers", "images", "refs", "scratch"] {
            let path = root.join(dir);
            fs::create_dir_all(&path)
                .map_err(|e| StrataError::io(format!("creating {}", path.display()), e))?;
        }

        Ok(Self {
            scratch: Arc::new(ScratchArea {
                dir: root.join("scratch"),
                active: Mutex::new(HashSet::new()),
                created: AtomicUsize::new(0),
            }),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writable layers currently held
    pub fn active_rw_layers(&self) -> usize {
        self.scratch.active.lock().map(|a| a.len()).unwrap_or(0)
    }

    /// Writable layers handed out since the store was opened
    pub fn rw_layers_created(&self) -> usize {
        self.scratch.created.load(Ordering::SeqCst)
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        let subdir = &hex[..2.min(hex.len())];
        self.root.join("blobs/sha256").join(subdir).join(hex)
    }

    fn layer_path(&self, diff_id: &str) -> PathBuf {
        let hex = diff_id.strip_prefix("sha256:").unwrap_or(diff_id);
        self.root.join("layers").join(format!("{}.json", hex))
    }

    fn image_path(&self, id: &ImageId) -> PathBuf {
        self.root.join("images").join(format!("{}.json", id.hex()))
    }

    fn ref_path(&self, name: &str) -> PathBuf {
        self.root.join("refs").join(hex::encode(name))
    }

    /// Run blocking filesystem work off the async runtime
    async fn blocking<T, F>(&self, f: F) -> StrataResult<T>
    where
        T: Send + 'static,
        F: FnOnce(LocalStore) -> StrataResult<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(store))
            .await
            .map_err(|e| StrataError::Internal(format!("store task failed: {}", e)))?
    }

    /// Copy a file into the blob store under its precomputed digest
    fn store_blob(&self, source: &Path, digest: &str) -> StrataResult<()> {
        let blob_path = self.blob_path(digest);
        if blob_path.exists() {
            debug!("Blob {} already stored", digest);
            return Ok(());
        }
        let dir = blob_path
            .parent()
            .ok_or_else(|| StrataError::Internal("blob path has no parent".into()))?;
        fs::create_dir_all(dir)
            .map_err(|e| StrataError::io(format!("creating {}", dir.display()), e))?;

        let temp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));
        fs::copy(source, &temp_path)
            .map_err(|e| StrataError::io(format!("storing blob from {}", source.display()), e))?;
        fs::rename(&temp_path, &blob_path)
            .map_err(|e| StrataError::io(format!("storing blob {}", digest), e))?;
        Ok(())
    }

    fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> StrataResult<T> {
        let data =
            fs::read(path).map_err(|e| StrataError::io(format!("reading {}", path.display()), e))?;
        serde_json::from_slice(&data).map_err(|e| StrataError::StoreCorrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    fn read_image(&self, id: &ImageId) -> StrataResult<ImageRecord> {
        let path = self.image_path(id);
        if !path.exists() {
            return Err(StrataError::ImageNotFound(id.to_string()));
        }
        Self::read_json(&path)
    }

    fn read_layer(&self, diff_id: &str) -> StrataResult<LayerManifest> {
        let path = self.layer_path(diff_id);
        if !path.exists() {
            return Err(StrataError::LayerNotFound(diff_id.to_string()));
        }
        Self::read_json(&path)
    }

    fn write_layer(&self, diff_id: &str, layer: &LayerManifest) -> StrataResult<()> {
        let path = self.layer_path(diff_id);
        if path.exists() {
            return Ok(());
        }
        write_atomic(&path, &serde_json::to_vec_pretty(layer)?)?;
        info!(
            "Stored layer {} ({} entries)",
            diff_id,
            layer.entries.len()
        );
        Ok(())
    }

    /// Every registered image
    fn all_images(&self) -> StrataResult<Vec<ImageRecord>> {
        let dir = self.root.join("images");
        let entries =
            fs::read_dir(&dir).map_err(|e| StrataError::io(format!("listing {}", dir.display()), e))?;

        let mut images = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| StrataError::io(format!("listing {}", dir.display()), e))?
                .path();
            if path.extension().is_some_and(|ext| ext == "json") {
                images.push(Self::read_json(&path)?);
            }
        }
        Ok(images)
    }

    /// Flattened filesystem of an image
    fn flatten(&self, record: &ImageRecord) -> StrataResult<Tree> {
        let mut tree = Tree::new();
        for diff_id in record.diff_ids() {
            manifest::apply(&mut tree, &self.read_layer(diff_id)?);
        }
        Ok(tree)
    }

    /// Write a flattened tree out to `dest`
    fn materialize(&self, tree: &Tree, dest: &Path) -> StrataResult<()> {
        let mut dirs = Vec::new();

        for entry in tree.values() {
            let target = dest.join(&entry.path);
            match entry.kind {
                EntryKind::Dir => {
                    fs::create_dir_all(&target)
                        .map_err(|e| StrataError::io(format!("creating {}", target.display()), e))?;
                    dirs.push(entry);
                }
                EntryKind::File => {
                    let digest = entry.digest.as_deref().ok_or_else(|| StrataError::StoreCorrupt {
                        path: PathBuf::from(&entry.path),
                        reason: "file entry without digest".into(),
                    })?;
                    fs::copy(self.blob_path(digest), &target)
                        .map_err(|e| StrataError::io(format!("restoring {}", entry.path), e))?;
                    set_mode(&target, entry.mode)?;
                }
                EntryKind::Symlink => {
                    let link = entry.target.as_deref().unwrap_or_default();
                    std::os::unix::fs::symlink(link, &target)
                        .map_err(|e| StrataError::io(format!("linking {}", entry.path), e))?;
                }
                EntryKind::Whiteout => continue,
            }
            set_owner(&target, entry.uid, entry.gid)?;
        }

        // Read-only directories get their mode once their contents exist
        for entry in dirs.into_iter().rev() {
            set_mode(&dest.join(&entry.path), entry.mode)?;
        }
        Ok(())
    }

    fn create_image_sync(
        &self,
        config: &[u8],
        parent: Option<&ImageId>,
        layer_digest: &str,
    ) -> StrataResult<ImageRecord> {
        let image_config: ImageConfig = serde_json::from_slice(config)
            .map_err(|e| StrataError::InvalidParameter(format!("invalid image config: {}", e)))?;

        if !self.layer_path(layer_digest).exists() {
            return Err(StrataError::LayerNotFound(layer_digest.to_string()));
        }
        if let Some(parent) = parent {
            if !self.image_path(parent).exists() {
                return Err(StrataError::ImageNotFound(parent.to_string()));
            }
        }

        let record = ImageRecord {
            id: ImageId::from_config_bytes(config),
            parent: parent.cloned(),
            config: image_config,
        };
        write_atomic(&self.image_path(&record.id), &serde_json::to_vec_pretty(&record)?)?;
        info!("Registered image {}", record.id.short());
        Ok(record)
    }

    fn commit_sync(&self, image: &ImageId, root: &Path) -> StrataResult<CommittedLayer> {
        let record = self.read_image(image)?;
        let base = self.flatten(&record)?;
        let current = manifest::scan(root)?;
        let layer = manifest::diff(&base, &current);

        for entry in &layer.entries {
            if let (EntryKind::File, Some(digest)) = (entry.kind, entry.digest.as_deref()) {
                self.store_blob(&root.join(&entry.path), digest)?;
            }
        }

        let diff_id = layer.diff_id()?;
        self.write_layer(&diff_id, &layer)?;

        Ok(CommittedLayer {
            digest: diff_id.clone(),
            diff_id,
            size: layer.content_size(),
            empty: layer.is_empty(),
        })
    }

    /// Create a parentless base image from the contents of a directory
    pub async fn import_rootfs(
        &self,
        dir: &Path,
        platform: &Platform,
        config: RunConfig,
    ) -> StrataResult<ImageRecord> {
        let dir = dir.to_path_buf();
        let platform = platform.clone();
        self.blocking(move |store| {
            if !dir.is_dir() {
                return Err(StrataError::SourceNotFound(dir.display().to_string()));
            }
            let tree = manifest::scan(&dir)?;
            for entry in tree.values() {
                if let (EntryKind::File, Some(digest)) = (entry.kind, entry.digest.as_deref()) {
                    store.store_blob(&dir.join(&entry.path), digest)?;
                }
            }
            let layer = LayerManifest {
                entries: tree.into_values().collect(),
            };
            let diff_id = layer.diff_id()?;
            store.write_layer(&diff_id, &layer)?;

            let created_by = format!("import {}", dir.display());
            let image = ImageConfig::base(&platform, config, diff_id.clone(), &created_by);
            store.create_image_sync(&image.to_bytes()?, None, &diff_id)
        })
        .await
    }

    /// Point tag `name` at `id`
    pub fn tag(&self, name: &str, id: &ImageId) -> StrataResult<()> {
        if !self.image_path(id).exists() {
            return Err(StrataError::ImageNotFound(id.to_string()));
        }
        let tag = Tag {
            name: name.to_string(),
            image: id.clone(),
        };
        write_atomic(&self.ref_path(name), &serde_json::to_vec(&tag)?)?;
        debug!("Tagged {} as {}", id.short(), name);
        Ok(())
    }

    /// All tags, sorted by name
    pub fn tags(&self) -> StrataResult<Vec<Tag>> {
        let dir = self.root.join("refs");
        let entries =
            fs::read_dir(&dir).map_err(|e| StrataError::io(format!("listing {}", dir.display()), e))?;
        let mut tags: Vec<Tag> = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| StrataError::io(format!("listing {}", dir.display()), e))?
                .path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.'))
            {
                tags.push(Self::read_json(&path)?);
            }
        }
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tags)
    }

    /// All images, oldest first
    pub async fn list_images(&self) -> StrataResult<Vec<ImageRecord>> {
        self.blocking(|store| {
            let mut images = store.all_images()?;
            images.sort_by(|a, b| a.config.created.cmp(&b.config.created));
            Ok(images)
        })
        .await
    }

    /// Resolve a tag, full id or unique id prefix
    fn resolve_sync(&self, reference: &str) -> StrataResult<ImageRecord> {
        let ref_path = self.ref_path(reference);
        if ref_path.exists() {
            let tag: Tag = Self::read_json(&ref_path)?;
            return self.read_image(&tag.image);
        }

        let hex = reference.strip_prefix("sha256:").unwrap_or(reference);
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StrataError::ImageNotFound(reference.to_string()));
        }
        let mut matches = self
            .all_images()?
            .into_iter()
            .filter(|image| image.id.hex().starts_with(hex));
        match (matches.next(), matches.next()) {
            (Some(image), None) => Ok(image),
            (Some(_), Some(_)) => Err(StrataError::InvalidParameter(format!(
                "ambiguous image reference {:?}",
                reference
            ))),
            _ => Err(StrataError::ImageNotFound(reference.to_string())),
        }
    }

    /// Remove layers no image references, the blobs only they used and
    /// leftover scratch directories of crashed builds.
    pub async fn prune_layers(&self) -> StrataResult<PruneReport> {
        self.blocking(|store| {
            let mut report = PruneReport::default();
            let referenced: HashSet<String> = store
                .all_images()?
                .iter()
                .flat_map(|image| image.diff_ids().iter().cloned())
                .collect();

            let layers_dir = store.root.join("layers");
            let mut live_blobs = HashSet::new();
            for entry in fs::read_dir(&layers_dir)
                .map_err(|e| StrataError::io(format!("listing {}", layers_dir.display()), e))?
            {
                let path = entry
                    .map_err(|e| StrataError::io("listing layers", e))?
                    .path();
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if path.extension().map(|ext| ext != "json").unwrap_or(true) {
                    continue;
                }
                if referenced.contains(&format!("sha256:{}", stem)) {
                    let layer: LayerManifest = Self::read_json(&path)?;
                    live_blobs.extend(layer.blob_digests().map(str::to_string));
                } else {
                    fs::remove_file(&path)
                        .map_err(|e| StrataError::io(format!("removing {}", path.display()), e))?;
                    report.layers += 1;
                }
            }

            let blobs_dir = store.root.join("blobs/sha256");
            for subdir in fs::read_dir(&blobs_dir)
                .map_err(|e| StrataError::io(format!("listing {}", blobs_dir.display()), e))?
            {
                let subdir = subdir.map_err(|e| StrataError::io("listing blobs", e))?.path();
                if !subdir.is_dir() {
                    continue;
                }
                for blob in fs::read_dir(&subdir).map_err(|e| StrataError::io("listing blobs", e))? {
                    let path = blob.map_err(|e| StrataError::io("listing blobs", e))?.path();
                    let digest = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                    if !live_blobs.contains(digest) {
                        fs::remove_file(&path)
                            .map_err(|e| StrataError::io(format!("removing {}", path.display()), e))?;
                        report.blobs += 1;
                    }
                }
            }

            let active: HashSet<String> = store
                .scratch
                .active
                .lock()
                .map(|a| a.clone())
                .unwrap_or_default();
            for entry in fs::read_dir(&store.scratch.dir)
                .map_err(|e| StrataError::io("listing scratch", e))?
            {
                let entry = entry.map_err(|e| StrataError::io("listing scratch", e))?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if !active.contains(&name) {
                    fs::remove_dir_all(entry.path())
                        .map_err(|e| StrataError::io(format!("removing scratch {}", name), e))?;
                    report.scratch += 1;
                }
            }

            if report != PruneReport::default() {
                info!(
                    "Pruned {} layers, {} blobs, {} scratch directories",
                    report.layers, report.blobs, report.scratch
                );
            }
            Ok(report)
        })
        .await
    }
}

#[async_trait]
impl ImageStore for LocalStore {
    async fn get_image(&self, id: &ImageId) -> StrataResult<ImageRecord> {
        let id = id.clone();
        self.blocking(move |store| store.read_image(&id)).await
    }

    async fn lookup(&self, reference: &str) -> StrataResult<ImageRecord> {
        let reference = reference.to_string();
        self.blocking(move |store| store.resolve_sync(&reference)).await
    }

    async fn create_image(
        &self,
        config: &[u8],
        parent: Option<&ImageId>,
        layer_digest: &str,
    ) -> StrataResult<ImageRecord> {
        let config = config.to_vec();
        let parent = parent.cloned();
        let layer_digest = layer_digest.to_string();
        self.blocking(move |store| store.create_image_sync(&config, parent.as_ref(), &layer_digest))
            .await
    }

    async fn children(&self, parent: &ImageId) -> StrataResult<Vec<ImageRecord>> {
        let parent = parent.clone();
        self.blocking(move |store| {
            Ok(store
                .all_images()?
                .into_iter()
                .filter(|image| image.parent.as_ref() == Some(&parent))
                .collect())
        })
        .await
    }

    async fn new_rw_layer(&self, image: &ImageId) -> StrataResult<RwLayer> {
        let image = image.clone();
        self.blocking(move |store| {
            let record = store.read_image(&image)?;
            let tree = store.flatten(&record)?;

            let id = Uuid::new_v4().to_string();
            let root = store.scratch.dir.join(&id);
            fs::create_dir(&root)
                .map_err(|e| StrataError::io(format!("creating {}", root.display()), e))?;
            if let Ok(mut active) = store.scratch.active.lock() {
                active.insert(id.clone());
            }
            store.scratch.created.fetch_add(1, Ordering::SeqCst);

            // Constructed before materializing so a failure cleans up
            let owner: Arc<dyn LayerRelease> = store.scratch.clone();
            let layer = RwLayer::new(id, root, image, owner);
            store.materialize(&tree, layer.root())?;
            debug!(
                "Created writable layer {} for {}",
                layer.id(),
                layer.image().short()
            );
            Ok(layer)
        })
        .await
    }

    async fn commit_rw_layer(&self, layer: &RwLayer) -> StrataResult<CommittedLayer> {
        if layer.is_released() {
            return Err(StrataError::Internal(format!(
                "writable layer {} was already released",
                layer.id()
            )));
        }
        let image = layer.image().clone();
        let root = layer.root().to_path_buf();
        self.blocking(move |store| store.commit_sync(&image, &root)).await
    }

    async fn release_layer(&self, layer: &CommittedLayer) -> StrataResult<()> {
        let diff_id = layer.diff_id.clone();
        self.blocking(move |store| {
            let referenced = store
                .all_images()?
                .iter()
                .any(|image| image.diff_ids().contains(&diff_id));
            if referenced {
                return Ok(());
            }
            let path = store.layer_path(&diff_id);
            match fs::remove_file(&path) {
                Ok(()) => {
                    info!("Reclaimed unreferenced layer {}", diff_id);
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StrataError::io(format!("removing {}", path.display()), e)),
            }
        })
        .await
    }
}
