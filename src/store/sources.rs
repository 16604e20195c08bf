//! Mount tracking for the duration of a build
//!
//! A committed layer is registered here the moment it exists, before the
//! image record that will reference it. If registration of the image then
//! fails, the layer is still tracked and released when the build ends,
//! which lets the store reclaim it.

use super::layer::CommittedLayer;
use super::ImageStore;
use crate::error::StrataResult;
use crate::image::{ImageId, ImageRecord};
use std::sync::Arc;
use tracing::{debug, warn};

/// A layer and/or image held by the build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMount {
    image: Option<ImageRecord>,
    layer: Option<CommittedLayer>,
}

impl ImageMount {
    pub fn new(image: Option<ImageRecord>, layer: Option<CommittedLayer>) -> Self {
        Self { image, layer }
    }

    pub fn image(&self) -> Option<&ImageRecord> {
        self.image.as_ref()
    }

    pub fn layer(&self) -> Option<&CommittedLayer> {
        self.layer.as_ref()
    }
}

/// Mounts held by one build
pub struct ImageSources {
    store: Arc<dyn ImageStore>,
    mounts: Vec<ImageMount>,
}

impl ImageSources {
    pub fn new(store: Arc<dyn ImageStore>) -> Self {
        Self {
            store,
            mounts: Vec::new(),
        }
    }

    /// Mount of an image, fetching and tracking it on first use
    pub async fn get(&mut self, id: &ImageId) -> StrataResult<ImageRecord> {
        if let Some(image) = self
            .mounts
            .iter()
            .filter_map(|m| m.image())
            .find(|image| &image.id == id)
        {
            return Ok(image.clone());
        }

        let image = self.store.get_image(id).await?;
        self.add(ImageMount::new(Some(image.clone()), None));
        Ok(image)
    }

    /// Track a mount.
    ///
    /// A mount carrying an image for a layer that is already tracked
    /// without one supersedes the provisional entry.
    pub fn add(&mut self, mount: ImageMount) {
        if let (Some(layer), Some(_)) = (mount.layer(), mount.image()) {
            if let Some(existing) = self
                .mounts
                .iter_mut()
                .find(|m| m.image.is_none() && m.layer() == Some(layer))
            {
                *existing = mount;
                return;
            }
        }
        self.mounts.push(mount);
    }

    pub fn mounts(&self) -> impl Iterator<Item = &ImageMount> {
        self.mounts.iter()
    }

    /// Committed layers no image has claimed yet
    pub fn orphaned_layers(&self) -> Vec<&CommittedLayer> {
        self.mounts
            .iter()
            .filter(|m| m.image.is_none())
            .filter_map(|m| m.layer())
            .collect()
    }

    /// Release every tracked layer and forget all mounts.
    ///
    /// All layers are released even if one release fails; the first error
    /// is returned.
    pub async fn unmount_all(&mut self) -> StrataResult<()> {
        let mut first_err = None;
        for mount in self.mounts.drain(..) {
            let Some(layer) = mount.layer else {
                continue;
            };
            if let Err(e) = self.store.release_layer(&layer).await {
                warn!("Failed to release layer {}: {}", layer.diff_id, e);
                first_err.get_or_insert(e);
            } else {
                debug!("Released layer {}", layer.diff_id);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
