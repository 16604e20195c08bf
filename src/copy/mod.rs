//! COPY and ADD support
//!
//! Sources are resolved and hashed by the build context before a step
//! runs. The aggregate source hash goes into the step's candidate
//! configuration, so an unchanged source set hits the cache without any
//! layer being mounted.

pub mod materialize;
pub mod ownership;

pub use materialize::{copy_for_info, CopyFileOptions, DestInfo};
pub use ownership::{parse_chown_flag, IdMap, Identity, IdentityMapping};

use crate::error::{StrataError, StrataResult};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// One resolved copy source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyInfo {
    /// Directory the source was resolved in
    pub root: PathBuf,
    /// Path relative to `root`
    pub path: String,
    /// `file:<sha256>` or `dir:<sha256>`
    pub hash: String,
    /// Whether an archive source may be unpacked at the destination
    pub decompress: bool,
}

/// A resolved COPY or ADD instruction
#[derive(Debug, Clone)]
pub struct CopyInstruction {
    /// `COPY` or `ADD`
    pub cmd_name: String,
    pub infos: Vec<CopyInfo>,
    pub dest: String,
    /// Raw `--chown` value, empty when not given
    pub chown: String,
    pub allow_local_decompression: bool,
    pub preserve_ownership: bool,
}

/// Aggregate hash of the sources of one instruction, in declaration order
pub fn source_hash(infos: &[CopyInfo]) -> String {
    match infos {
        [single] => single.hash.clone(),
        _ => {
            let hashes: Vec<&str> = infos.iter().map(|info| info.hash.as_str()).collect();
            hash_string_slice("multi", &hashes)
        }
    }
}

/// `<prefix>:` followed by the SHA-256 of the comma-joined values
pub fn hash_string_slice(prefix: &str, values: &[&str]) -> String {
    let digest = Sha256::digest(values.join(",").as_bytes());
    format!("{}:{}", prefix, hex::encode(digest))
}

/// Comment recorded in the candidate command of a copy step
pub fn copy_comment(instruction: &CopyInstruction, src_hash: &str) -> String {
    let chown = if instruction.chown.is_empty() {
        String::new()
    } else {
        format!("--chown={} ", instruction.chown)
    };
    format!(
        "{} {}{} in {} ",
        instruction.cmd_name, chown, src_hash, instruction.dest
    )
}

/// Resolve a destination against the working directory.
///
/// Relative destinations are joined onto the working directory. A trailing
/// slash marks the destination as a directory and is kept.
pub fn normalize_dest(cmd_name: &str, working_dir: &str, requested: &str) -> StrataResult<String> {
    if requested.is_empty() {
        return Err(StrataError::InvalidDestination {
            instruction: cmd_name.to_string(),
            reason: "destination path is empty".into(),
        });
    }

    let is_dir = requested.ends_with('/') || requested.ends_with("/.") || requested == ".";
    let joined = if requested.starts_with('/') {
        requested.to_string()
    } else {
        format!("/{}/{}", working_dir.trim_start_matches('/'), requested)
    };

    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    let mut dest = format!("/{}", parts.join("/"));
    if is_dir && !dest.ends_with('/') {
        dest.push('/');
    }
    Ok(dest)
}
