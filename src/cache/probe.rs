//! Cache probing

use super::key::CacheKey;
use crate::error::{StrataError, StrataResult};
use crate::image::{ImageId, Platform};
use crate::runconfig::RunConfig;
use crate::store::ImageStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Read-only cache query
#[async_trait]
pub trait ImageProber: Send + Sync {
    /// Image previously built from `candidate` on `parent`, if any.
    ///
    /// A miss is `Ok(None)`. Errors mean the cache could not be consulted
    /// and must not be treated as a miss.
    async fn probe(
        &self,
        parent: &ImageId,
        candidate: &RunConfig,
        platform: &Platform,
    ) -> StrataResult<Option<ImageId>>;
}

/// Prober backed by the image store's parent/child index
pub struct StoreProber {
    store: Arc<dyn ImageStore>,
}

impl StoreProber {
    pub fn new(store: Arc<dyn ImageStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ImageProber for StoreProber {
    async fn probe(
        &self,
        parent: &ImageId,
        candidate: &RunConfig,
        platform: &Platform,
    ) -> StrataResult<Option<ImageId>> {
        let wanted = CacheKey::compute(parent, candidate, platform)?;

        let children = self
            .store
            .children(parent)
            .await
            .map_err(|e| StrataError::CacheProbe {
                parent: parent.to_string(),
                source: Box::new(e),
            })?;

        // Several children can share a key when two builds raced; the
        // newest one wins so repeated probes agree.
        let mut hit = None;
        for child in children {
            if CacheKey::of_image(&child)?.as_ref() != Some(&wanted) {
                continue;
            }
            let newer = match &hit {
                Some((_, created)) => child.config.created > *created,
                None => true,
            };
            if newer {
                hit = Some((child.id, child.config.created));
            }
        }

        match &hit {
            Some((id, _)) => debug!("Cache hit for key {} on {}: {}", wanted, parent, id),
            None => debug!("Cache miss for key {} on {}", wanted, parent),
        }
        Ok(hit.map(|(id, _)| id))
    }
}

/// Prober for `--no-cache` builds
pub struct NoCacheProber;

#[async_trait]
impl ImageProber for NoCacheProber {
    async fn probe(
        &self,
        _parent: &ImageId,
        _candidate: &RunConfig,
        _platform: &Platform,
    ) -> StrataResult<Option<ImageId>> {
        Ok(None)
    }
}

/// Choose the prober for a build
pub fn new_prober(store: Arc<dyn ImageStore>, no_cache: bool) -> Box<dyn ImageProber> {
    if no_cache {
        Box::new(NoCacheProber)
    } else {
        Box::new(StoreProber::new(store))
    }
}
