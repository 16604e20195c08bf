//! Ownership resolution for copied files

use crate::error::{StrataError, StrataResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// A uid/gid pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

/// One contiguous range of a user-namespace mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

/// Container-to-host id translation. Empty means identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityMapping {
    uids: Vec<IdMap>,
    gids: Vec<IdMap>,
}

fn to_host(id: u32, maps: &[IdMap]) -> Option<u32> {
    if maps.is_empty() {
        return Some(id);
    }
    maps.iter().find_map(|m| {
        let offset = id.checked_sub(m.container_id)?;
        if offset < m.size {
            m.host_id.checked_add(offset)
        } else {
            None
        }
    })
}

impl IdentityMapping {
    pub fn new(uids: Vec<IdMap>, gids: Vec<IdMap>) -> Self {
        Self { uids, gids }
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty() && self.gids.is_empty()
    }

    /// Host identity of container root
    pub fn root_pair(&self) -> Identity {
        Identity {
            uid: to_host(0, &self.uids).unwrap_or(0),
            gid: to_host(0, &self.gids).unwrap_or(0),
        }
    }

    /// Translate a container identity to the host
    pub fn to_host(&self, identity: Identity) -> StrataResult<Identity> {
        let uid = to_host(identity.uid, &self.uids).ok_or_else(|| {
            StrataError::InvalidParameter(format!(
                "container uid {} cannot be mapped to a host uid",
                identity.uid
            ))
        })?;
        let gid = to_host(identity.gid, &self.gids).ok_or_else(|| {
            StrataError::InvalidParameter(format!(
                "container gid {} cannot be mapped to a host gid",
                identity.gid
            ))
        })?;
        Ok(Identity { uid, gid })
    }
}

/// Look up a name in a colon-separated database such as `/etc/passwd`,
/// returning the numeric id in field `id_field`.
fn lookup_id(db: &Path, name: &str, id_field: usize) -> StrataResult<u32> {
    let content = fs::read_to_string(db)
        .map_err(|e| StrataError::io(format!("reading {}", db.display()), e))?;
    content
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .find_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.first() == Some(&name) {
                fields.get(id_field).and_then(|id| id.parse().ok())
            } else {
                None
            }
        })
        .ok_or_else(|| {
            StrataError::InvalidParameter(format!("no entry for {:?} in {}", name, db.display()))
        })
}

fn lookup_user(spec: &str, root: &Path) -> StrataResult<u32> {
    if let Ok(uid) = spec.parse() {
        return Ok(uid);
    }
    lookup_id(&root.join("etc/passwd"), spec, 2)
        .map_err(|e| StrataError::InvalidParameter(format!("can't find uid for user {}: {}", spec, e)))
}

fn lookup_group(spec: &str, root: &Path) -> StrataResult<u32> {
    if let Ok(gid) = spec.parse() {
        return Ok(gid);
    }
    lookup_id(&root.join("etc/group"), spec, 2)
        .map_err(|e| StrataError::InvalidParameter(format!("can't find gid for group {}: {}", spec, e)))
}

/// Resolve a `--chown` value against the filesystem at `root`.
///
/// `user[:group]`; a missing group means the user's name or id is used for
/// the group as well. Names are looked up in the layer's own
/// `/etc/passwd` and `/etc/group`, never the host's.
pub fn parse_chown_flag(
    chown: &str,
    root: &Path,
    mapping: &IdentityMapping,
) -> StrataResult<Identity> {
    let (user, group) = match chown.split_once(':') {
        Some((user, group)) => (user, group),
        None => (chown, chown),
    };
    if user.is_empty() || group.is_empty() {
        return Err(StrataError::InvalidParameter(format!(
            "invalid chown string format: {}",
            chown
        )));
    }

    let identity = Identity {
        uid: lookup_user(user, root)?,
        gid: lookup_group(group, root)?,
    };
    mapping.to_host(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rootfs() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        fs::write(
            dir.path().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\napp:x:1000:1000::/home/app:/bin/sh\n",
        )
        .unwrap();
        fs::write(dir.path().join("etc/group"), "root:x:0:\nstaff:x:50:app\n").unwrap();
        dir
    }

    #[test]
    fn numeric_ids_need_no_lookup() {
        let dir = TempDir::new().unwrap();
        let identity = parse_chown_flag("1:2", dir.path(), &IdentityMapping::default()).unwrap();
        assert_eq!(identity, Identity { uid: 1, gid: 2 });
    }

    #[test]
    fn names_resolve_through_layer_databases() {
        let dir = rootfs();
        let mapping = IdentityMapping::default();
        assert_eq!(
            parse_chown_flag("app:staff", dir.path(), &mapping).unwrap(),
            Identity { uid: 1000, gid: 50 }
        );
        assert_eq!(
            parse_chown_flag("app:0", dir.path(), &mapping).unwrap(),
            Identity { uid: 1000, gid: 0 }
        );
        assert_eq!(
            parse_chown_flag("root", dir.path(), &mapping).unwrap(),
            Identity { uid: 0, gid: 0 }
        );
    }

    #[test]
    fn unknown_name_fails() {
        let dir = rootfs();
        assert!(parse_chown_flag("nobody", dir.path(), &IdentityMapping::default()).is_err());
        assert!(parse_chown_flag(":", dir.path(), &IdentityMapping::default()).is_err());
    }

    #[test]
    fn mapping_translates_to_host() {
        let mapping = IdentityMapping::new(
            vec![IdMap {
                container_id: 0,
                host_id: 100000,
                size: 65536,
            }],
            vec![IdMap {
                container_id: 0,
                host_id: 200000,
                size: 65536,
            }],
        );
        assert_eq!(mapping.root_pair(), Identity { uid: 100000, gid: 200000 });
        let dir = TempDir::new().unwrap();
        assert_eq!(
            parse_chown_flag("10:20", dir.path(), &mapping).unwrap(),
            Identity { uid: 100010, gid: 200020 }
        );
        assert!(mapping.to_host(Identity { uid: 70000, gid: 0 }).is_err());
    }

    #[test]
    fn mapping_past_u32_max_is_unmapped() {
        let mapping = IdentityMapping::new(
            vec![IdMap {
                container_id: 0,
                host_id: u32::MAX - 10,
                size: 65536,
            }],
            Vec::new(),
        );
        assert_eq!(
            mapping.to_host(Identity { uid: 10, gid: 0 }).unwrap(),
            Identity { uid: u32::MAX, gid: 0 }
        );
        assert!(mapping
            .to_host(Identity { uid: 11, gid: 0 })
            .unwrap_err()
            .is_invalid_parameter());
    }
}
