//! Image records and lineage
//!
//! An image record is immutable once the store has registered it. A build
//! step never edits its parent: it produces a child configuration with
//! [`ImageConfig::child`] and registers that as a new record.

use crate::error::{StrataError, StrataResult};
use crate::runconfig::RunConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Number of hex characters shown for truncated ids
const SHORT_ID_LEN: usize = 12;

/// Content-addressed image identity (`sha256:<hex>`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(String);

impl ImageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity of a serialized image configuration
    pub fn from_config_bytes(config: &[u8]) -> Self {
        Self(format!("sha256:{}", hex::encode(Sha256::digest(config))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex digest without the algorithm prefix
    pub fn hex(&self) -> &str {
        self.0.strip_prefix("sha256:").unwrap_or(&self.0)
    }

    /// Truncated form used in build output
    pub fn short(&self) -> &str {
        truncate_id(&self.0)
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Truncate an image or container id for display
pub fn truncate_id(id: &str) -> &str {
    let id = id.strip_prefix("sha256:").unwrap_or(id);
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Target platform triple
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            variant: None,
        }
    }

    /// Platform of the running host, using OCI architecture names
    pub fn host() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            "powerpc64" => "ppc64le",
            other => other,
        };
        let os = match std::env::consts::OS {
            "macos" => "linux",
            other => other,
        };
        Self::new(os, architecture)
    }

    /// Parse `os/arch[/variant]`
    pub fn parse(spec: &str) -> StrataResult<Self> {
        let parts: Vec<&str> = spec.split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self::new(*os, *arch)),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                Ok(Self {
                    os: os.to_string(),
                    architecture: arch.to_string(),
                    variant: Some(variant.to_string()),
                })
            }
            _ => Err(StrataError::InvalidParameter(format!(
                "invalid platform {:?}: expected os/arch[/variant]",
                spec
            ))),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// Layer chain of an image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,
    pub diff_ids: Vec<String>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            kind: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// One step of image history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

/// Serialized image configuration, the content an image id is computed over
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    pub created: DateTime<Utc>,
    /// Configuration containers started from this image use
    pub config: RunConfig,
    /// Candidate configuration of the step that produced this image
    #[serde(default)]
    pub container_config: RunConfig,
    pub rootfs: RootFs,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// Inputs for a child image
#[derive(Debug, Clone)]
pub struct ChildConfig {
    pub author: String,
    pub container_config: RunConfig,
    pub diff_id: String,
    pub empty_layer: bool,
    pub config: RunConfig,
}

impl ImageConfig {
    /// Configuration for a parentless image holding a single layer
    pub fn base(platform: &Platform, config: RunConfig, diff_id: String, created_by: &str) -> Self {
        let created = Utc::now();
        Self {
            architecture: platform.architecture.clone(),
            os: platform.os.clone(),
            variant: platform.variant.clone(),
            author: String::new(),
            created,
            config,
            container_config: RunConfig::default(),
            rootfs: RootFs {
                diff_ids: vec![diff_id],
                ..RootFs::default()
            },
            history: vec![HistoryEntry {
                created,
                created_by: created_by.to_string(),
                author: String::new(),
                empty_layer: false,
            }],
        }
    }

    /// Configuration of a child of `parent`.
    ///
    /// Architecture and variant always come from the parent; a build never
    /// changes its target platform part way through.
    pub fn child(parent: &ImageConfig, child: ChildConfig, os: &str) -> Self {
        let mut rootfs = parent.rootfs.clone();
        if !child.empty_layer {
            rootfs.diff_ids.push(child.diff_id);
        }

        let created = Utc::now();
        let mut history = parent.history.clone();
        history.push(HistoryEntry {
            created,
            created_by: child.container_config.cmd.join(" "),
            author: child.author.clone(),
            empty_layer: child.empty_layer,
        });

        Self {
            architecture: parent.architecture.clone(),
            os: os.to_string(),
            variant: parent.variant.clone(),
            author: child.author,
            created,
            config: child.config,
            container_config: child.container_config,
            rootfs,
            history,
        }
    }

    pub fn platform(&self) -> Platform {
        Platform {
            os: self.os.clone(),
            architecture: self.architecture.clone(),
            variant: self.variant.clone(),
        }
    }

    /// Encode for registration with a store
    pub fn to_bytes(&self) -> StrataResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(StrataError::EncodeImageConfig)
    }
}

/// An image as registered with a store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: ImageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ImageId>,
    pub config: ImageConfig,
}

impl ImageRecord {
    pub fn platform(&self) -> Platform {
        self.config.platform()
    }

    pub fn diff_ids(&self) -> &[String] {
        &self.config.rootfs.diff_ids
    }
}
