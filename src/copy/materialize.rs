//! Writing copy sources into a writable layer

use super::ownership::Identity;
use super::CopyInfo;
use crate::error::{StrataError, StrataResult};
use crate::fsutil::{resolve_in_root, set_owner};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Destination inside a writable layer
#[derive(Debug, Clone)]
pub struct DestInfo {
    /// Root of the writable layer
    pub root: PathBuf,
    /// Normalized absolute destination; a trailing slash means directory
    pub path: String,
}

impl DestInfo {
    /// Destination as a path relative to the layer root
    fn relative(&self) -> &Path {
        Path::new(self.path.trim_start_matches('/'))
    }

    fn is_dir(&self) -> bool {
        self.path.ends_with('/')
    }
}

/// Options applied uniformly to every source of one instruction
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyFileOptions {
    pub decompress: bool,
    /// Owner for created files; `None` keeps the source ownership
    pub identity: Option<Identity>,
}

fn io_err(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> StrataError {
    let context = context.into();
    move |e| StrataError::io(context, e)
}

fn chown(path: &Path, identity: Option<Identity>) -> StrataResult<()> {
    match identity {
        Some(id) => set_owner(path, id.uid, id.gid),
        None => Ok(()),
    }
}

/// Create `dir` and any missing parents, giving only the newly created
/// directories to `identity`.
fn mkdir_all_and_chown_new(dir: &Path, identity: Option<Identity>) -> StrataResult<()> {
    let mut missing = Vec::new();
    let mut cursor = Some(dir);
    while let Some(path) = cursor {
        if path.exists() {
            break;
        }
        missing.push(path.to_path_buf());
        cursor = path.parent();
    }
    fs::create_dir_all(dir).map_err(io_err(format!("creating {}", dir.display())))?;
    for path in missing.iter().rev() {
        chown(path, identity)?;
    }
    Ok(())
}

/// Copy one non-directory entry to `rel` inside the layer at `root`.
///
/// Only the parent is resolved through the layer's symlinks. A symlink
/// already at the destination is replaced rather than written through.
fn copy_file(src: &Path, root: &Path, rel: &Path, identity: Option<Identity>) -> StrataResult<()> {
    let name = rel
        .file_name()
        .ok_or_else(|| StrataError::InvalidParameter(format!("invalid destination {}", rel.display())))?;
    let parent = resolve_in_root(root, rel.parent().unwrap_or_else(|| Path::new("")))?;
    mkdir_all_and_chown_new(&parent, identity)?;
    let dest = parent.join(name);

    let meta = fs::symlink_metadata(src).map_err(io_err(format!("stat {}", src.display())))?;
    let source_is_link = meta.file_type().is_symlink();
    if let Ok(existing) = fs::symlink_metadata(&dest) {
        if existing.file_type().is_symlink() || (source_is_link && !existing.is_dir()) {
            fs::remove_file(&dest).map_err(io_err(format!("replacing {}", dest.display())))?;
        }
    }

    if source_is_link {
        let target = fs::read_link(src).map_err(io_err(format!("reading link {}", src.display())))?;
        std::os::unix::fs::symlink(&target, &dest)
            .map_err(io_err(format!("linking {}", dest.display())))?;
    } else {
        fs::copy(src, &dest).map_err(io_err(format!(
            "copying {} to {}",
            src.display(),
            dest.display()
        )))?;
    }
    chown(&dest, identity)
}

fn copy_dir(src: &Path, root: &Path, rel: &Path, identity: Option<Identity>) -> StrataResult<()> {
    mkdir_all_and_chown_new(&resolve_in_root(root, rel)?, identity)?;
    for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| StrataError::Internal(format!("walking {}: {}", src.display(), e)))?;
        let child = rel.join(
            entry
                .path()
                .strip_prefix(src)
                .map_err(|e| StrataError::Internal(e.to_string()))?,
        );
        if entry.file_type().is_dir() {
            let target = resolve_in_root(root, &child)?;
            fs::create_dir_all(&target).map_err(io_err(format!("creating {}", target.display())))?;
            fs::set_permissions(
                &target,
                entry
                    .metadata()
                    .map_err(|e| StrataError::Internal(e.to_string()))?
                    .permissions(),
            )
            .map_err(io_err(format!("chmod {}", target.display())))?;
            chown(&target, identity)?;
        } else {
            copy_file(entry.path(), root, &child, identity)?;
        }
    }
    Ok(())
}

/// Whether `path` names a tar archive, optionally gzip-compressed
fn is_archive(path: &Path) -> StrataResult<bool> {
    let mut header = [0u8; 262];
    let mut file = File::open(path).map_err(io_err(format!("opening {}", path.display())))?;
    let n = file
        .read(&mut header)
        .map_err(io_err(format!("reading {}", path.display())))?;
    let gzip = n >= 2 && header[0] == 0x1f && header[1] == 0x8b;
    let tar = n >= 262 && &header[257..262] == b"ustar";
    Ok(gzip || tar)
}

fn extract_archive(src: &Path, dest: &Path, identity: Option<Identity>) -> StrataResult<()> {
    mkdir_all_and_chown_new(dest, identity)?;

    let mut magic = [0u8; 2];
    let mut head = File::open(src).map_err(io_err(format!("opening {}", src.display())))?;
    let gzip = head.read(&mut magic).map(|n| n == 2).unwrap_or(false) && magic == [0x1f, 0x8b];

    let file = BufReader::new(File::open(src).map_err(io_err(format!("opening {}", src.display())))?);
    let reader: Box<dyn Read> = if gzip {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    let entries = archive
        .entries()
        .map_err(io_err(format!("reading archive {}", src.display())))?;
    for entry in entries {
        let mut entry = entry.map_err(io_err(format!("reading archive {}", src.display())))?;
        let path = entry
            .path()
            .map_err(io_err("archive entry path"))?
            .into_owned();
        // unpack_in refuses entries that would land outside `dest`
        let unpacked = entry
            .unpack_in(dest)
            .map_err(io_err(format!("extracting {}", path.display())))?;
        if unpacked {
            chown(&dest.join(&path), identity)?;
        }
    }
    debug!("Extracted {} into {}", src.display(), dest.display());
    Ok(())
}

/// Materialize one source at the destination.
///
/// Directories have their contents copied. Archives are unpacked when
/// both the instruction and the source allow it. Files go into the
/// destination directory when it is one, or become the destination.
/// Symlinks in the layer are followed without leaving it.
pub fn copy_for_info(dest: &DestInfo, info: &CopyInfo, options: &CopyFileOptions) -> StrataResult<()> {
    let src = info.root.join(&info.path);
    let rel = dest.relative();
    let meta = fs::symlink_metadata(&src).map_err(|_| StrataError::SourceNotFound(info.path.clone()))?;

    if meta.is_dir() {
        return copy_dir(&src, &dest.root, rel, options.identity);
    }

    if options.decompress && info.decompress && is_archive(&src)? {
        let target = resolve_in_root(&dest.root, rel)?;
        return extract_archive(&src, &target, options.identity);
    }

    if dest.is_dir() || resolve_in_root(&dest.root, rel)?.is_dir() {
        let name = src
            .file_name()
            .ok_or_else(|| StrataError::SourceNotFound(info.path.clone()))?;
        copy_file(&src, &dest.root, &rel.join(name), options.identity)
    } else {
        copy_file(&src, &dest.root, rel, options.identity)
    }
}
