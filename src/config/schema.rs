//! Configuration schema for strata
//!
//! Configuration is stored at `~/.config/strata/config.toml`

use crate::copy::IdMap;
use crate::runtime_spec::NetworkInfoPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Image store settings
    pub store: StoreConfig,

    /// Options applied to every build
    pub build: BuildConfig,

    /// Container runtime settings
    pub runtime: RuntimeConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Image store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Store directory (default: `<data dir>/strata`)
    pub root: Option<PathBuf>,
}

impl StoreConfig {
    /// Configured root, or the platform data directory
    pub fn resolved_root(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("strata")
        })
    }
}

/// A resource limit for build containers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ulimit {
    pub name: String,
    pub soft: i64,
    pub hard: i64,
}

/// A host device made available to build containers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMapping {
    /// Host path on Linux; `class/<id>` or `<type>://<id>` on Windows
    pub path_on_host: String,
    #[serde(default)]
    pub path_in_container: String,
    #[serde(default)]
    pub cgroup_permissions: String,
}

/// Build options, fixed for the duration of a build
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Network for RUN containers; empty or "default" means the platform default
    pub network_mode: String,
    pub isolation: String,
    pub security_opt: Vec<String>,
    pub extra_hosts: Vec<String>,
    pub cgroup_parent: String,
    pub cpu_shares: i64,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub cpuset_cpus: String,
    pub cpuset_mems: String,
    pub cpu_count: i64,
    pub cpu_percent: i64,
    /// CPU quota in units of 1e-9 CPUs
    pub nano_cpus: i64,
    pub memory: i64,
    pub memory_swap: i64,
    pub io_maximum_bandwidth: u64,
    pub io_maximum_iops: u64,
    pub shm_size: i64,
    pub ulimits: Vec<Ulimit>,
    pub devices: Vec<DeviceMapping>,
    /// Target platform as `os/arch[/variant]`; defaults to the base image's
    pub platform: Option<String>,
    pub no_cache: bool,
    /// Apply configuration changes without registering images
    pub disable_commit: bool,
    pub uid_map: Vec<IdMap>,
    pub gid_map: Vec<IdMap>,
}

/// Container runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Podman executable
    pub podman: String,

    /// What to do when a network's driver info cannot be read
    pub network_info_policy: NetworkInfoPolicy,

    /// Directory holding a `CredentialSpecs` folder for `file://` specs
    pub credential_spec_root: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            podman: "podman".to_string(),
            network_info_policy: NetworkInfoPolicy::ContinueOnNetworkInfoError,
            credential_spec_root: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("strata"),
        }
    }
}
