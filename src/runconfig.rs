//! Run configuration model
//!
//! A `RunConfig` is the container configuration implied by the build so
//! far. Steps never edit one in place: they call [`derive`] with an
//! ordered list of [`Modifier`]s and get a fresh value back. Map and set
//! fields are ordered collections so that the JSON encoding of two equal
//! configurations is byte-for-byte identical, which the cache key relies on.

use crate::error::StrataResult;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Prefix of every no-op marker command
pub const NOP_PREFIX: &str = "#(nop) ";

/// Healthcheck test value meaning "no healthcheck"
pub const HEALTHCHECK_NONE: &str = "NONE";

/// Healthcheck settings carried in the run configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthConfig {
    /// Test command, `["NONE"]` disables an inherited healthcheck
    pub test: Vec<String>,
    /// Seconds between checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    /// Seconds before a check is considered hung
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Seconds to wait before the first check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<u64>,
    /// Consecutive failures before unhealthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

impl HealthConfig {
    /// The sentinel value that switches an inherited healthcheck off
    pub fn disabled() -> Self {
        Self {
            test: vec![HEALTHCHECK_NONE.to_string()],
            ..Self::default()
        }
    }
}

/// Container configuration implied by the build so far
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RunConfig {
    pub user: String,
    pub exposed_ports: BTreeSet<String>,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub args_escaped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthConfig>,
    pub volumes: BTreeSet<String>,
    pub working_dir: String,
    /// `None` and `Some(vec![])` are different values: the first means
    /// "inherit", the second an explicitly empty entrypoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    pub on_build: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub shell: Vec<String>,
}

/// Which historical encoding a no-op marker command uses.
///
/// WORKDIR, COPY and ADD were always committed with the single-token
/// form; every other metadata instruction with the two-token form. Images
/// cached by either must keep matching, so the form is chosen by call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NopForm {
    /// `[shell..., "#(nop) ", comment]`
    TwoToken,
    /// `[shell..., "#(nop) " + comment]`
    OneToken,
}

/// A single named transformation applied by [`derive`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modifier {
    SetCommand(Vec<String>),
    SetEnv(Vec<String>),
    SetEntrypoint(Option<Vec<String>>),
    SetArgsEscaped(bool),
    /// Sets the entrypoint only when `cmd` is non-empty
    EntrypointIfCommand {
        cmd: Vec<String>,
        entrypoint: Option<Vec<String>>,
    },
    /// Substitutes the "no healthcheck" sentinel
    DisableHealthcheck,
    /// Replaces the command with a shell-prefixed no-op marker
    NopComment {
        comment: String,
        os: String,
        form: NopForm,
    },
}

impl Modifier {
    /// Two-token no-op marker, used by most metadata instructions
    pub fn comment(comment: impl Into<String>, os: &str) -> Self {
        Self::NopComment {
            comment: comment.into(),
            os: os.to_string(),
            form: NopForm::TwoToken,
        }
    }

    /// Single-token no-op marker, used by WORKDIR, COPY and ADD
    pub fn comment_string(comment: impl Into<String>, os: &str) -> Self {
        Self::NopComment {
            comment: comment.into(),
            os: os.to_string(),
            form: NopForm::OneToken,
        }
    }

    fn apply(&self, config: &mut RunConfig) {
        match self {
            Self::SetCommand(cmd) => config.cmd = cmd.clone(),
            Self::SetEnv(env) => config.env = env.clone(),
            Self::SetEntrypoint(entrypoint) => config.entrypoint = entrypoint.clone(),
            Self::SetArgsEscaped(escaped) => config.args_escaped = *escaped,
            Self::EntrypointIfCommand { cmd, entrypoint } => {
                if !cmd.is_empty() {
                    config.entrypoint = entrypoint.clone();
                }
            }
            Self::DisableHealthcheck => config.healthcheck = Some(HealthConfig::disabled()),
            Self::NopComment { comment, os, form } => {
                let mut cmd = shell_for(config, os);
                match form {
                    NopForm::TwoToken => {
                        cmd.push(NOP_PREFIX.to_string());
                        cmd.push(comment.clone());
                    }
                    NopForm::OneToken => cmd.push(format!("{}{}", NOP_PREFIX, comment)),
                }
                config.cmd = cmd;
            }
        }
    }
}

/// Derive a new configuration from `base` by applying `modifiers` in order.
///
/// `base` is only read; the result owns all of its collections.
pub fn derive(base: &RunConfig, modifiers: &[Modifier]) -> RunConfig {
    let mut config = base.clone();
    for modifier in modifiers {
        modifier.apply(&mut config);
    }
    config
}

/// Default shell used to prefix shell-form commands on `os`
pub fn default_shell_for_os(os: &str) -> Vec<String> {
    if os.eq_ignore_ascii_case("windows") {
        vec!["cmd".to_string(), "/S".to_string(), "/C".to_string()]
    } else {
        vec!["/bin/sh".to_string(), "-c".to_string()]
    }
}

/// The configured shell, falling back to the OS default
pub fn shell_for(config: &RunConfig, os: &str) -> Vec<String> {
    if config.shell.is_empty() {
        default_shell_for_os(os)
    } else {
        config.shell.clone()
    }
}

impl RunConfig {
    /// Canonical JSON encoding used for cache keys and image configs
    pub fn canonical_json(&self) -> StrataResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Look up an environment variable by name
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            let (k, v) = entry.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    /// Environment with `key=value` replacing any earlier definition of `key`
    pub fn env_with(&self, key: &str, value: &str) -> Vec<String> {
        let mut env = self.env.clone();
        let entry = format!("{}={}", key, value);
        match env
            .iter()
            .position(|e| e.split_once('=').map(|(k, _)| k) == Some(key))
        {
            Some(idx) => env[idx] = entry,
            None => env.push(entry),
        }
        env
    }
}
