//! Layer manifests
//!
//! A layer is described by the entries it adds or changes relative to the
//! flattened filesystem of its parent, plus whiteouts for removed paths.
//! File contents live in the blob store and are referenced by digest.

use crate::error::{StrataError, StrataResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use walkdir::WalkDir;

/// Kind of a manifest entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
    /// Marks a path removed relative to the lower layers
    Whiteout,
}

/// One path in a layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Relative path, `/`-separated, without a leading slash
    pub path: String,
    pub kind: EntryKind,
    /// Permission bits
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    /// Blob digest of the content (regular files only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default)]
    pub size: u64,
    /// Symlink target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl FileEntry {
    fn whiteout(path: &str) -> Self {
        Self {
            path: path.to_string(),
            kind: EntryKind::Whiteout,
            mode: 0,
            uid: 0,
            gid: 0,
            digest: None,
            size: 0,
            target: None,
        }
    }
}

/// Manifest describing all entries in a layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerManifest {
    pub entries: Vec<FileEntry>,
}

/// A flattened filesystem, keyed by relative path.
///
/// Ordering by path puts every directory before its contents.
pub type Tree = BTreeMap<String, FileEntry>;

impl LayerManifest {
    /// Digest of the manifest's canonical encoding, the layer's diff id
    pub fn diff_id(&self) -> StrataResult<String> {
        let encoded = serde_json::to_vec(&self.entries)?;
        Ok(format!("sha256:{}", hex::encode(Sha256::digest(&encoded))))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes of file content the layer adds
    pub fn content_size(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::File)
            .map(|e| e.size)
            .sum()
    }

    /// Blob digests referenced by the layer
    pub fn blob_digests(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|e| e.digest.as_deref())
    }
}

fn is_under(path: &str, dir: &str) -> bool {
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}

/// Apply a layer on top of a flattened tree
pub fn apply(tree: &mut Tree, layer: &LayerManifest) {
    for entry in &layer.entries {
        match entry.kind {
            EntryKind::Whiteout => {
                tree.remove(&entry.path);
                tree.retain(|path, _| !is_under(path, &entry.path));
            }
            _ => {
                // A directory replaced by a file or link loses its contents
                if entry.kind != EntryKind::Dir {
                    tree.retain(|path, _| !is_under(path, &entry.path));
                }
                tree.insert(entry.path.clone(), entry.clone());
            }
        }
    }
}

/// Compute the layer that turns `base` into `current`
pub fn diff(base: &Tree, current: &Tree) -> LayerManifest {
    let mut entries = Vec::new();

    let mut removed: Vec<&str> = Vec::new();
    for path in base.keys() {
        if current.contains_key(path) {
            continue;
        }
        // Whiting out a directory covers everything below it
        if removed.iter().any(|dir| is_under(path, dir)) {
            continue;
        }
        removed.push(path);
    }
    entries.extend(removed.into_iter().map(FileEntry::whiteout));

    for (path, entry) in current {
        if base.get(path) != Some(entry) {
            entries.push(entry.clone());
        }
    }

    LayerManifest { entries }
}

/// SHA-256 of a file's contents, streamed
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Scan a directory into a tree, hashing regular files
pub fn scan(root: &Path) -> StrataResult<Tree> {
    let mut tree = Tree::new();

    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| {
            StrataError::io(
                format!("scanning {}", root.display()),
                e.into_io_error()
                    .unwrap_or_else(|| io::Error::other("filesystem loop")),
            )
        })?;
        let full = entry.path();
        let rel = full
            .strip_prefix(root)
            .map_err(|e| StrataError::Internal(e.to_string()))?;
        let rel = rel.to_string_lossy().replace('\\', "/");

        let meta = entry
            .metadata()
            .map_err(|e| StrataError::Internal(format!("stat {}: {}", full.display(), e)))?;
        let file_type = meta.file_type();

        let (kind, digest, size, target) = if file_type.is_symlink() {
            let target = std::fs::read_link(full)
                .map_err(|e| StrataError::io(format!("reading link {}", full.display()), e))?;
            (
                EntryKind::Symlink,
                None,
                0,
                Some(target.to_string_lossy().into_owned()),
            )
        } else if file_type.is_dir() {
            (EntryKind::Dir, None, 0, None)
        } else if file_type.is_file() {
            let digest = hash_file(full)
                .map_err(|e| StrataError::io(format!("hashing {}", full.display()), e))?;
            (EntryKind::File, Some(digest), meta.len(), None)
        } else {
            // Sockets, fifos and device nodes are not carried in layers
            continue;
        };

        tree.insert(
            rel.clone(),
            FileEntry {
                path: rel,
                kind,
                mode: meta.mode() & 0o7777,
                uid: meta.uid(),
                gid: meta.gid(),
                digest,
                size,
                target,
            },
        );
    }

    Ok(tree)
}
