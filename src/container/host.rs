//! Host configuration for build containers

use crate::config::schema::{BuildConfig, DeviceMapping, Ulimit};
use serde::{Deserialize, Serialize};

/// Resource limits applied to every build container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cgroup_parent: String,
    pub cpu_shares: i64,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub cpuset_cpus: String,
    pub cpuset_mems: String,
    pub cpu_count: i64,
    pub cpu_percent: i64,
    pub nano_cpus: i64,
    pub memory: i64,
    pub memory_swap: i64,
    pub io_maximum_bandwidth: u64,
    pub io_maximum_iops: u64,
    pub ulimits: Vec<Ulimit>,
    pub devices: Vec<DeviceMapping>,
}

/// Logging driver configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(rename = "type")]
    pub kind: String,
}

/// Host-side configuration of a build container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub security_opt: Vec<String>,
    pub isolation: String,
    pub shm_size: i64,
    pub resources: Resources,
    pub network_mode: String,
    pub log_config: LogConfig,
    pub extra_hosts: Vec<String>,
}

impl HostConfig {
    /// Whether the container runs in a Hyper-V utility VM
    pub fn is_hyperv(&self) -> bool {
        self.isolation.eq_ignore_ascii_case("hyperv")
    }

    /// Networks the container joins. Host, none and shared-namespace
    /// modes join none of their own.
    pub fn networks(&self) -> Vec<String> {
        let mode = self.network_mode.as_str();
        if mode == "host" || mode == "none" || mode.starts_with("container:") {
            Vec::new()
        } else {
            vec![mode.to_string()]
        }
    }
}

/// Default network of the target OS
pub fn default_network(os: &str) -> &'static str {
    if os.eq_ignore_ascii_case("windows") {
        "nat"
    } else {
        "bridge"
    }
}

/// Derive the host configuration for a build.
///
/// Computed once per build; every container of the build shares it.
pub fn host_config_from_options(options: &BuildConfig, os: &str) -> HostConfig {
    let network_mode = match options.network_mode.as_str() {
        "" | "default" => default_network(os).to_string(),
        other => other.to_string(),
    };

    HostConfig {
        security_opt: options.security_opt.clone(),
        isolation: options.isolation.clone(),
        shm_size: options.shm_size,
        resources: Resources {
            cgroup_parent: options.cgroup_parent.clone(),
            cpu_shares: options.cpu_shares,
            cpu_period: options.cpu_period,
            cpu_quota: options.cpu_quota,
            cpuset_cpus: options.cpuset_cpus.clone(),
            cpuset_mems: options.cpuset_mems.clone(),
            cpu_count: options.cpu_count,
            cpu_percent: options.cpu_percent,
            nano_cpus: options.nano_cpus,
            memory: options.memory,
            memory_swap: options.memory_swap,
            io_maximum_bandwidth: options.io_maximum_bandwidth,
            io_maximum_iops: options.io_maximum_iops,
            ulimits: options.ulimits.clone(),
            devices: options.devices.clone(),
        },
        network_mode,
        // Build containers never keep logs
        log_config: LogConfig {
            kind: "none".to_string(),
        },
        extra_hosts: options.extra_hosts.clone(),
    }
}
