//! Cache key derivation

use crate::error::StrataResult;
use crate::image::{ImageId, ImageRecord, Platform};
use crate::runconfig::RunConfig;
use sha2::{Digest, Sha256};
use std::fmt;

/// Deterministic key for one build step
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Compute the key for running `candidate` on top of `parent`.
    ///
    /// Fields are separated by a NUL byte, which cannot appear in an image
    /// id or in the platform string.
    pub fn compute(
        parent: &ImageId,
        candidate: &RunConfig,
        platform: &Platform,
    ) -> StrataResult<Self> {
        let mut hasher = Sha256::new();
        hasher.update(parent.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(candidate.canonical_json()?);
        hasher.update([0u8]);
        hasher.update(platform.to_string().as_bytes());
        Ok(Self(hex::encode(hasher.finalize())))
    }

    /// Key an existing child image would have been probed under, or
    /// `None` for a parentless image.
    pub fn of_image(record: &ImageRecord) -> StrataResult<Option<Self>> {
        match &record.parent {
            Some(parent) => Self::compute(
                parent,
                &record.config.container_config,
                &record.platform(),
            )
            .map(Some),
            None => Ok(None),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
