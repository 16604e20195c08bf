//! Layer handles

use crate::image::ImageId;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Owner of writable-layer scratch space
pub trait LayerRelease: Send + Sync {
    fn release(&self, id: &str, root: &Path);
}

/// An uncommitted writable layer.
///
/// The layer is released exactly once: either by an explicit
/// [`RwLayer::release`] or when the handle is dropped, which also covers a
/// build future being dropped part way through a step.
pub struct RwLayer {
    id: String,
    root: PathBuf,
    image: ImageId,
    owner: Arc<dyn LayerRelease>,
    released: AtomicBool,
}

impl RwLayer {
    pub fn new(
        id: impl Into<String>,
        root: impl Into<PathBuf>,
        image: ImageId,
        owner: Arc<dyn LayerRelease>,
    ) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
            image,
            owner,
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Directory holding the layer's filesystem
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Image the layer was created from
    pub fn image(&self) -> &ImageId {
        &self.image
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Release the layer. Later calls are no-ops.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.owner.release(&self.id, &self.root);
        }
    }
}

impl Drop for RwLayer {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for RwLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLayer")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("image", &self.image)
            .field("released", &self.is_released())
            .finish()
    }
}

/// An immutable layer produced by committing a writable layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedLayer {
    /// Digest of the layer's uncompressed diff
    pub diff_id: String,
    /// Digest the store addresses the layer by
    pub digest: String,
    /// Total bytes of file content in the diff
    pub size: u64,
    /// True when the diff has no entries
    pub empty: bool,
}
