//! Image and layer storage
//!
//! The build engine only talks to storage through [`ImageStore`], given to
//! each component as an `Arc<dyn ImageStore>` at construction.
//! [`LocalStore`] is the on-disk implementation the CLI uses.

pub mod layer;
pub mod local;
pub mod manifest;
pub mod sources;

pub use layer::{CommittedLayer, LayerRelease, RwLayer};
pub use local::LocalStore;
pub use manifest::{EntryKind, FileEntry, LayerManifest};
pub use sources::{ImageMount, ImageSources};

use crate::error::StrataResult;
use crate::image::{ImageId, ImageRecord};
use async_trait::async_trait;

/// Content store holding image records and layers.
///
/// Implementations must tolerate concurrent readers and writers: two
/// builds sharing a store may register images at the same time.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Fetch a registered image
    async fn get_image(&self, id: &ImageId) -> StrataResult<ImageRecord>;

    /// Resolve a user-facing reference (tag or id) to an image
    async fn lookup(&self, reference: &str) -> StrataResult<ImageRecord> {
        self.get_image(&ImageId::new(reference)).await
    }

    /// Register an image from its serialized configuration.
    ///
    /// Once this returns the record is durably retrievable.
    async fn create_image(
        &self,
        config: &[u8],
        parent: Option<&ImageId>,
        layer_digest: &str,
    ) -> StrataResult<ImageRecord>;

    /// All images registered with `parent` as their parent
    async fn children(&self, parent: &ImageId) -> StrataResult<Vec<ImageRecord>>;

    /// Acquire a writable layer holding the filesystem of `image`
    async fn new_rw_layer(&self, image: &ImageId) -> StrataResult<RwLayer>;

    /// Turn the contents of a writable layer into an immutable layer
    async fn commit_rw_layer(&self, layer: &RwLayer) -> StrataResult<CommittedLayer>;

    /// Give up a committed layer; reclaimed if no image references it
    async fn release_layer(&self, layer: &CommittedLayer) -> StrataResult<()>;
}
