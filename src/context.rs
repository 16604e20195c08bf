//! Build context: the directory copy sources are resolved in

use crate::copy::CopyInfo;
use crate::error::{StrataError, StrataResult};
use crate::store::manifest::hash_file;
use sha2::{Digest, Sha256};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Directory copy sources are resolved against
#[derive(Debug, Clone)]
pub struct BuildContext {
    root: PathBuf,
}

impl BuildContext {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve and hash the sources of one instruction, in order
    pub fn resolve(&self, sources: &[String], allow_decompress: bool) -> StrataResult<Vec<CopyInfo>> {
        if sources.is_empty() {
            return Err(StrataError::InvalidParameter(
                "copy instruction needs at least one source".into(),
            ));
        }
        sources
            .iter()
            .map(|source| {
                let path = clean_relative(source)?;
                let full = self.root.join(&path);
                let hash = content_hash(&full)
                    .map_err(|_| StrataError::SourceNotFound(source.clone()))?;
                Ok(CopyInfo {
                    root: self.root.clone(),
                    path,
                    hash,
                    decompress: allow_decompress,
                })
            })
            .collect()
    }
}

/// Normalize a source path lexically, rejecting anything that leaves the
/// context. A leading `/` means the context root.
fn clean_relative(source: &str) -> StrataResult<String> {
    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(source.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(StrataError::InvalidParameter(format!(
                        "source {:?} is outside the build context",
                        source
                    )));
                }
            }
            Component::Prefix(_) => {
                return Err(StrataError::InvalidParameter(format!(
                    "unsupported source path {:?}",
                    source
                )))
            }
        }
    }
    Ok(if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    })
}

/// `file:<sha256>` of a single entry, or `dir:<sha256>` over a
/// directory's sorted listing.
///
/// Every entry is hashed with its kind and mode as well as its contents,
/// so a `chmod` or a file replaced by a symlink changes the hash.
pub fn content_hash(path: &Path) -> StrataResult<String> {
    let meta = fs::symlink_metadata(path)
        .map_err(|e| StrataError::io(format!("stat {}", path.display()), e))?;
    if !meta.is_dir() {
        return Ok(format!("file:{}", entry_digest(path, &meta)?));
    }

    let mut hasher = Sha256::new();
    for entry in WalkDir::new(path).follow_links(false).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| StrataError::Internal(format!("walking {}: {}", path.display(), e)))?;
        let rel = entry
            .path()
            .strip_prefix(path)
            .map_err(|e| StrataError::Internal(e.to_string()))?;
        let meta = entry
            .metadata()
            .map_err(|e| StrataError::Internal(e.to_string()))?;
        let digest = entry_digest(entry.path(), &meta)?;
        hasher.update(format!("{}\0{}\n", rel.to_string_lossy(), digest).as_bytes());
    }
    Ok(format!("dir:{}", hex::encode(hasher.finalize())))
}

/// sha256 over an entry's kind, mode and contents. A symlink's contents
/// are its target; a directory has none.
fn entry_digest(path: &Path, meta: &fs::Metadata) -> StrataResult<String> {
    let file_type = meta.file_type();
    let (kind, contents) = if file_type.is_symlink() {
        let target = fs::read_link(path)
            .map_err(|e| StrataError::io(format!("reading link {}", path.display()), e))?;
        (
            "symlink",
            hex::encode(Sha256::digest(target.to_string_lossy().as_bytes())),
        )
    } else if file_type.is_dir() {
        ("dir", String::new())
    } else {
        let digest =
            hash_file(path).map_err(|e| StrataError::io(format!("hashing {}", path.display()), e))?;
        ("file", digest)
    };
    let record = format!("{}\0{:o}\0{}", kind, meta.mode() & 0o7777, contents);
    Ok(hex::encode(Sha256::digest(record.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn file_hash_depends_on_content() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a"), "one").unwrap();
        let ctx = BuildContext::new(dir.path());
        let first = ctx.resolve(&["a".into()], false).unwrap();
        assert!(first[0].hash.starts_with("file:"));

        fs::write(dir.path().join("a"), "two").unwrap();
        let second = ctx.resolve(&["a".into()], false).unwrap();
        assert_ne!(first[0].hash, second[0].hash);
    }

    #[test]
    fn file_hash_depends_on_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("run.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).unwrap();
        let ctx = BuildContext::new(dir.path());
        let before = ctx.resolve(&["run.sh".into()], false).unwrap();

        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let after = ctx.resolve(&["run.sh".into()], false).unwrap();
        assert_ne!(before[0].hash, after[0].hash);

        fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).unwrap();
        let restored = ctx.resolve(&["run.sh".into()], false).unwrap();
        assert_eq!(before[0].hash, restored[0].hash);
    }

    #[test]
    fn symlink_differs_from_file_with_its_target_as_content() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("plain"), "target").unwrap();
        std::os::unix::fs::symlink("target", dir.path().join("link")).unwrap();
        let ctx = BuildContext::new(dir.path());
        let hashes = ctx.resolve(&["plain".into(), "link".into()], false).unwrap();
        assert_ne!(hashes[0].hash, hashes[1].hash);

        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        fs::write(a.path().join("entry"), "target").unwrap();
        std::os::unix::fs::symlink("target", b.path().join("entry")).unwrap();
        assert_ne!(content_hash(a.path()).unwrap(), content_hash(b.path()).unwrap());
    }

    #[test]
    fn dir_hash_depends_on_entry_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        let tool = dir.path().join("bin/tool");
        fs::write(&tool, "x").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o644)).unwrap();
        let before = content_hash(&dir.path().join("bin")).unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        assert_ne!(before, content_hash(&dir.path().join("bin")).unwrap());
    }

    #[test]
    fn dir_hash_is_stable() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src/sub")).unwrap();
        fs::write(dir.path().join("src/sub/x"), "x").unwrap();
        fs::write(dir.path().join("src/y"), "y").unwrap();
        let ctx = BuildContext::new(dir.path());
        let a = ctx.resolve(&["src".into()], false).unwrap();
        let b = ctx.resolve(&["./src/".into()], false).unwrap();
        assert!(a[0].hash.starts_with("dir:"));
        assert_eq!(a[0].hash, b[0].hash);
        assert_eq!(b[0].path, "src");
    }

    #[test]
    fn escapes_are_rejected() {
        let dir = TempDir::new().unwrap();
        let ctx = BuildContext::new(dir.path());
        assert!(ctx
            .resolve(&["../etc/passwd".into()], false)
            .unwrap_err()
            .is_invalid_parameter());
    }

    #[test]
    fn missing_source_is_reported() {
        let dir = TempDir::new().unwrap();
        let ctx = BuildContext::new(dir.path());
        assert!(matches!(
            ctx.resolve(&["missing".into()], false).unwrap_err(),
            StrataError::SourceNotFound(_)
        ));
    }
}
