//! Runtime-spec synthesis for build containers
//!
//! Turns a run configuration and the build's host configuration into the
//! process, resource, device, credential and network settings a backend
//! hands to the runtime. Malformed user input is reported as an
//! invalid-parameter error; everything else is a system error.

use crate::config::schema::DeviceMapping;
use crate::container::host::HostConfig;
use crate::error::{StrataError, StrataResult};
use crate::runconfig::RunConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Folder under the credential-spec root holding `file://` specs
const CREDENTIAL_SPEC_DIR: &str = "CredentialSpecs";

const DEFAULT_LINUX_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const INVALID_CREDENTIAL_SPEC: &str = "invalid credential spec security option - value must be \
     prefixed by 'file://', 'registry://', or 'raw://' followed by a non-empty value";

/// What to do when a network's driver info cannot be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkInfoPolicy {
    /// Skip the network and count it
    #[serde(rename = "continue")]
    ContinueOnNetworkInfoError,
    /// Abort container creation
    #[serde(rename = "fail")]
    FailOnNetworkInfoError,
}

/// Source of per-network driver data
#[async_trait]
pub trait NetworkInfoSource: Send + Sync {
    async fn driver_info(&self, network: &str) -> StrataResult<Map<String, Value>>;
}

/// Network source for runtimes that expose no driver data
pub struct NoNetworkInfo;

#[async_trait]
impl NetworkInfoSource for NoNetworkInfo {
    async fn driver_info(&self, _network: &str) -> StrataResult<Map<String, Value>> {
        Ok(Map::new())
    }
}

/// Store backing `config://` credential specs
#[async_trait]
pub trait CredentialConfigStore: Send + Sync {
    async fn get(&self, name: &str) -> StrataResult<String>;
}

/// Inputs to synthesis that do not come from the configurations
pub struct SpecContext<'a> {
    pub container_id: &'a str,
    pub os: &'a str,
    pub credential_spec_root: &'a Path,
    pub num_cpus: usize,
    pub networks: &'a dyn NetworkInfoSource,
    pub network_policy: NetworkInfoPolicy,
    pub config_store: Option<&'a dyn CredentialConfigStore>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    pub cwd: String,
    pub env: Vec<String>,
    pub user: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuResources {
    /// Portion of host CPU in units of 1/10000
    pub maximum: u16,
    pub shares: u16,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StorageResources {
    pub bps: u64,
    pub iops: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SpecResources {
    pub cpu: Option<CpuResources>,
    pub memory_limit: Option<u64>,
    pub storage: Option<StorageResources>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpecDevice {
    pub id_type: String,
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkSpec {
    pub endpoints: Vec<String>,
    pub allow_unqualified_dns_query: bool,
    /// Networks skipped because their driver info could not be read
    pub skipped: usize,
}

/// Synthesized runtime settings for one container
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeSpec {
    pub os: String,
    pub process: ProcessSpec,
    pub resources: Option<SpecResources>,
    pub devices: Vec<SpecDevice>,
    pub credential_spec: Option<String>,
    pub network: NetworkSpec,
}

fn is_windows(os: &str) -> bool {
    os.eq_ignore_ascii_case("windows")
}

impl RuntimeSpec {
    pub async fn synthesize(
        config: &RunConfig,
        host: &HostConfig,
        ctx: &SpecContext<'_>,
    ) -> StrataResult<Self> {
        let process = process_spec(config, ctx.os)?;
        let network = collect_endpoints(&host.networks(), ctx.networks, ctx.network_policy).await?;

        let (resources, devices, credential_spec) = if is_windows(ctx.os) {
            (
                resources_for(host, host.is_hyperv(), ctx.num_cpus),
                windows_devices(&host.resources.devices)?,
                credential_spec(&host.security_opt, ctx).await?,
            )
        } else {
            (None, Vec::new(), None)
        };

        let spec = Self {
            os: ctx.os.to_string(),
            process,
            resources,
            devices,
            credential_spec,
            network,
        };
        if let Ok(json) = serde_json::to_string(&spec) {
            debug!("Generated spec: {}", json);
        }
        Ok(spec)
    }
}

fn process_spec(config: &RunConfig, os: &str) -> StrataResult<ProcessSpec> {
    // An entrypoint of [""] means "no entrypoint"
    let entrypoint: Vec<String> = config
        .entrypoint
        .iter()
        .flatten()
        .filter(|arg| !arg.is_empty())
        .cloned()
        .collect();
    let args: Vec<String> = entrypoint.into_iter().chain(config.cmd.iter().cloned()).collect();
    if args.is_empty() {
        return Err(StrataError::InvalidParameter("no command specified".into()));
    }

    let cwd = if !config.working_dir.is_empty() {
        config.working_dir.clone()
    } else if is_windows(os) {
        "C:\\".to_string()
    } else {
        "/".to_string()
    };

    let mut env = config.env.clone();
    if !is_windows(os) && config.env_var("PATH").is_none() {
        env.push(DEFAULT_LINUX_PATH.to_string());
    }

    Ok(ProcessSpec {
        args,
        cwd,
        env,
        user: config.user.clone(),
    })
}

/// CPU, memory and IO limits for a Windows container
pub fn resources_for(host: &HostConfig, is_hyperv: bool, num_cpus: usize) -> Option<SpecResources> {
    let r = &host.resources;
    let shares = r.cpu_shares as u16;
    let mut maximum = (r.cpu_percent as u16).wrapping_mul(100);
    let mut count = r.cpu_count as u64;

    if r.nano_cpus > 0 {
        if is_hyperv {
            count = (r.nano_cpus / 1_000_000_000) as u64;
            if r.nano_cpus % 1_000_000_000 != 0 {
                count += 1;
                maximum = (r.nano_cpus / count as i64 / (1_000_000_000 / 10_000)) as u16;
                // Requests too small to register round up to the minimum
                maximum = maximum.max(1);
            }
        } else {
            let cpus = num_cpus.max(1) as i64;
            maximum = (r.nano_cpus / cpus / (1_000_000_000 / 10_000)) as u16;
            maximum = maximum.max(1);
        }
    }

    let mut resources = SpecResources::default();
    if maximum != 0 || shares != 0 || count != 0 {
        resources.cpu = Some(CpuResources {
            maximum,
            shares,
            count,
        });
    }
    if r.memory != 0 {
        resources.memory_limit = Some(r.memory as u64);
    }
    if r.io_maximum_bandwidth != 0 || r.io_maximum_iops != 0 {
        resources.storage = Some(StorageResources {
            bps: r.io_maximum_bandwidth,
            iops: r.io_maximum_iops,
        });
    }

    (resources != SpecResources::default()).then_some(resources)
}

/// Parse Windows device assignments: `class/<id>` or `<type>://<id>`
pub fn windows_devices(devices: &[DeviceMapping]) -> StrataResult<Vec<SpecDevice>> {
    devices
        .iter()
        .map(|device| {
            let path = device.path_on_host.as_str();
            if let Some(id) = path.strip_prefix("class/") {
                return Ok(SpecDevice {
                    id_type: "class".to_string(),
                    id: id.to_string(),
                });
            }
            let (id_type, id) = path.split_once("://").ok_or_else(|| {
                StrataError::InvalidParameter(format!(
                    "invalid device assignment path: '{}', must be 'class/ID' or 'IDType://ID'",
                    path
                ))
            })?;
            if id_type.is_empty() {
                return Err(StrataError::InvalidParameter(format!(
                    "invalid device assignment path: '{}', IDType cannot be empty",
                    path
                )));
            }
            Ok(SpecDevice {
                id_type: id_type.to_string(),
                id: id.to_string(),
            })
        })
        .collect()
}

/// Resolve the credential spec from security options.
///
/// Every option is validated; when several are valid only the last one
/// takes effect.
pub async fn credential_spec(
    security_opt: &[String],
    ctx: &SpecContext<'_>,
) -> StrataResult<Option<String>> {
    let mut spec = None;

    for opt in security_opt {
        let (key, value) = opt.split_once('=').ok_or_else(|| {
            StrataError::InvalidParameter(format!(
                "invalid security option: no equals sign in supplied value {}",
                opt
            ))
        })?;
        if !key.eq_ignore_ascii_case("credentialspec") {
            return Err(StrataError::InvalidParameter(format!(
                "security option not supported: {}",
                key
            )));
        }

        let (scheme, value) = match value.split_once("://") {
            Some((scheme, value)) if !value.is_empty() => (scheme, value),
            _ => return Err(StrataError::InvalidParameter(INVALID_CREDENTIAL_SPEC.into())),
        };

        let resolved = match scheme.to_ascii_lowercase().as_str() {
            "file" => read_credential_spec_file(ctx.container_id, ctx.credential_spec_root, value)?,
            "registry" => read_credential_spec_registry(ctx.container_id, value)?,
            "config" => {
                let store = ctx
                    .config_store
                    .ok_or_else(|| StrataError::InvalidParameter(INVALID_CREDENTIAL_SPEC.into()))?;
                store.get(value).await.map_err(|e| {
                    StrataError::System(format!("error getting value from config store: {}", e))
                })?
            }
            "raw" => value.to_string(),
            _ => return Err(StrataError::InvalidParameter(INVALID_CREDENTIAL_SPEC.into())),
        };
        spec = Some(resolved);
    }

    Ok(spec.filter(|s| !s.is_empty()))
}

/// Lexically clean a relative path, allowing `..` to climb
fn clean_join(base: &Path, location: &Path) -> PathBuf {
    let mut full = base.to_path_buf();
    for component in location.components() {
        match component {
            Component::ParentDir => {
                full.pop();
            }
            Component::Normal(part) => full.push(part),
            _ => {}
        }
    }
    full
}

fn read_credential_spec_file(id: &str, root: &Path, location: &str) -> StrataResult<String> {
    let location = Path::new(location);
    if location.is_absolute() {
        return Err(StrataError::InvalidParameter(
            "invalid credential spec: file:// path cannot be absolute".into(),
        ));
    }
    let base = root.join(CREDENTIAL_SPEC_DIR);
    let full = clean_join(&base, location);
    if !full.starts_with(&base) {
        return Err(StrataError::InvalidParameter(format!(
            "invalid credential spec: file:// path must be under {}",
            base.display()
        )));
    }
    std::fs::read_to_string(&full).map_err(|e| {
        StrataError::InvalidParameter(format!(
            "failed to load credential spec for container {}: {}",
            id, e
        ))
    })
}

fn read_credential_spec_registry(id: &str, name: &str) -> StrataResult<String> {
    // Only Windows hosts carry the credential-spec registry key
    Err(StrataError::InvalidParameter(format!(
        "failed handling spec {:?} for container {} - registry key could not be opened on this host",
        name, id
    )))
}

/// Gather endpoint ids from the driver info of each network
pub async fn collect_endpoints(
    networks: &[String],
    source: &dyn NetworkInfoSource,
    policy: NetworkInfoPolicy,
) -> StrataResult<NetworkSpec> {
    let mut spec = NetworkSpec::default();
    let mut gateway = None;

    for network in networks {
        let data = match source.driver_info(network).await {
            Ok(data) => data,
            Err(e) => match policy {
                NetworkInfoPolicy::ContinueOnNetworkInfoError => {
                    warn!("Skipping network {}: {}", network, e);
                    spec.skipped += 1;
                    continue;
                }
                NetworkInfoPolicy::FailOnNetworkInfoError => return Err(e),
            },
        };

        if let Some(id) = data
            .get("GW_INFO")
            .and_then(|gw| gw.get("hnsid"))
            .and_then(Value::as_str)
        {
            gateway = Some(id.to_string());
        }
        if let Some(id) = data.get("hnsid").and_then(Value::as_str) {
            spec.endpoints.push(id.to_string());
        }
        if data.contains_key("AllowUnqualifiedDNSQuery") {
            spec.allow_unqualified_dns_query = true;
        }
    }

    spec.endpoints.extend(gateway);
    Ok(spec)
}
