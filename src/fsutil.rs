//! Filesystem helpers shared by the store and the copy subsystem

use crate::error::{StrataError, StrataResult};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Write `data` to `path` through a temp file and rename, so readers never
/// see a partial file.
pub fn write_atomic(path: &Path, data: &[u8]) -> StrataResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| StrataError::Internal(format!("no parent for {}", path.display())))?;
    let temp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));

    fs::write(&temp_path, data)
        .map_err(|e| StrataError::io(format!("writing {}", temp_path.display()), e))?;
    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        StrataError::io(format!("renaming into {}", path.display()), e)
    })
}

/// Whether the process can change file ownership
pub fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Set ownership of `path` without following symlinks.
///
/// Only root can give files away; unprivileged builds keep the invoking
/// user as owner.
pub fn set_owner(path: &Path, uid: u32, gid: u32) -> StrataResult<()> {
    if !running_as_root() {
        debug!("Not root, leaving owner of {} unchanged", path.display());
        return Ok(());
    }
    std::os::unix::fs::lchown(path, Some(uid), Some(gid))
        .map_err(|e| StrataError::io(format!("chown {}", path.display()), e))
}

/// Set permission bits of `path`
pub fn set_mode(path: &Path, mode: u32) -> StrataResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| StrataError::io(format!("chmod {}", path.display()), e))
}

/// Symlinks followed while resolving one path before giving up
const MAX_SYMLINKS: usize = 255;

/// Resolve `path` as a process chrooted at `root` would see it.
///
/// Symlinks are followed, but absolute targets restart at `root` and `..`
/// stops at `root`, so the result is always `root` or below it. Missing
/// components are kept as written.
pub fn resolve_in_root(root: &Path, path: &Path) -> StrataResult<PathBuf> {
    let mut pending: VecDeque<OsString> = parts(path).into();
    let mut resolved = PathBuf::new();
    let mut followed = 0;

    while let Some(part) = pending.pop_front() {
        if part == ".." {
            resolved.pop();
            continue;
        }
        let candidate = resolved.join(&part);
        let host = root.join(&candidate);
        let is_link = fs::symlink_metadata(&host)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if !is_link {
            resolved = candidate;
            continue;
        }

        followed += 1;
        if followed > MAX_SYMLINKS {
            return Err(StrataError::InvalidParameter(format!(
                "too many levels of symbolic links in {}",
                path.display()
            )));
        }
        let target = fs::read_link(&host)
            .map_err(|e| StrataError::io(format!("reading link {}", host.display()), e))?;
        if target.has_root() {
            resolved = PathBuf::new();
        }
        for part in parts(&target).into_iter().rev() {
            pending.push_front(part);
        }
    }
    Ok(root.join(resolved))
}

/// Normal components of `path`, with `..` kept as a literal part
fn parts(path: &Path) -> Vec<OsString> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_os_string()),
            Component::ParentDir => Some(OsString::from("..")),
            _ => None,
        })
        .collect()
}
