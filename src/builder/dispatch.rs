//! Instructions and the state threaded between them

use super::Builder;
use crate::copy::CopyInstruction;
use crate::error::{StrataError, StrataResult};
use crate::image::{ImageId, Platform};
use crate::runconfig::{derive, shell_for, HealthConfig, Modifier, RunConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

/// Rolling context of a build, replaced by the driver after each step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchState {
    /// Most recent image; the base image once `from` ran
    pub image_id: Option<ImageId>,
    pub run_config: RunConfig,
    pub maintainer: String,
    pub operating_system: String,
    /// Platform of the base image
    pub platform: Option<Platform>,
    /// Whether `cmd` ran since the last `from`
    pub cmd_set: bool,
}

impl DispatchState {
    pub fn has_from_image(&self) -> bool {
        self.image_id.is_some()
    }
}

fn default_true() -> bool {
    true
}

/// A typed build instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "instruction", rename_all = "lowercase")]
pub enum Instruction {
    From {
        image: String,
    },
    Maintainer {
        name: String,
    },
    Env {
        /// `KEY=value` pairs
        vars: Vec<String>,
    },
    Label {
        labels: BTreeMap<String, String>,
    },
    Expose {
        ports: Vec<String>,
    },
    Volume {
        paths: Vec<String>,
    },
    Workdir {
        path: String,
    },
    User {
        user: String,
    },
    Cmd {
        args: Vec<String>,
        #[serde(default)]
        shell_form: bool,
    },
    Entrypoint {
        args: Vec<String>,
        #[serde(default)]
        shell_form: bool,
    },
    Healthcheck {
        /// `["NONE"]` disables an inherited healthcheck
        test: Vec<String>,
        #[serde(default)]
        interval: Option<u64>,
        #[serde(default)]
        timeout: Option<u64>,
        #[serde(default)]
        start_period: Option<u64>,
        #[serde(default)]
        retries: Option<u32>,
    },
    Shell {
        args: Vec<String>,
    },
    Onbuild {
        expression: String,
    },
    Run {
        command: Vec<String>,
        #[serde(default = "default_true")]
        shell_form: bool,
        /// `KEY=value` pairs visible to this command only
        #[serde(default)]
        build_args: Vec<String>,
    },
    Copy {
        sources: Vec<String>,
        dest: String,
        #[serde(default)]
        chown: String,
    },
    Add {
        sources: Vec<String>,
        dest: String,
        #[serde(default)]
        chown: String,
    },
}

impl Instruction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::From { .. } => "FROM",
            Self::Maintainer { .. } => "MAINTAINER",
            Self::Env { .. } => "ENV",
            Self::Label { .. } => "LABEL",
            Self::Expose { .. } => "EXPOSE",
            Self::Volume { .. } => "VOLUME",
            Self::Workdir { .. } => "WORKDIR",
            Self::User { .. } => "USER",
            Self::Cmd { .. } => "CMD",
            Self::Entrypoint { .. } => "ENTRYPOINT",
            Self::Healthcheck { .. } => "HEALTHCHECK",
            Self::Shell { .. } => "SHELL",
            Self::Onbuild { .. } => "ONBUILD",
            Self::Run { .. } => "RUN",
            Self::Copy { .. } => "COPY",
            Self::Add { .. } => "ADD",
        }
    }
}

fn fmt_args(f: &mut fmt::Formatter<'_>, args: &[String], shell_form: bool) -> fmt::Result {
    if shell_form {
        write!(f, "{}", args.join(" "))
    } else {
        write!(f, "{:?}", args)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.name())?;
        match self {
            Self::From { image } => write!(f, "{}", image),
            Self::Maintainer { name } => write!(f, "{}", name),
            Self::Env { vars } => write!(f, "{}", vars.join(" ")),
            Self::Label { labels } => {
                let pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                write!(f, "{}", pairs.join(" "))
            }
            Self::Expose { ports } => write!(f, "{}", ports.join(" ")),
            Self::Volume { paths } => write!(f, "{:?}", paths),
            Self::Workdir { path } => write!(f, "{}", path),
            Self::User { user } => write!(f, "{}", user),
            Self::Cmd { args, shell_form } | Self::Entrypoint { args, shell_form } => {
                fmt_args(f, args, *shell_form)
            }
            Self::Healthcheck { test, .. } => write!(f, "{:?}", test),
            Self::Shell { args } => write!(f, "{:?}", args),
            Self::Onbuild { expression } => write!(f, "{}", expression),
            Self::Run {
                command,
                shell_form,
                ..
            } => fmt_args(f, command, *shell_form),
            Self::Copy {
                sources,
                dest,
                chown,
            }
            | Self::Add {
                sources,
                dest,
                chown,
            } => {
                if !chown.is_empty() {
                    write!(f, "--chown={} ", chown)?;
                }
                write!(f, "{} {}", sources.join(" "), dest)
            }
        }
    }
}

/// A build plan file: `[[step]]` tables of typed instructions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(rename = "step", default)]
    pub steps: Vec<Instruction>,
}

impl Plan {
    pub fn parse(content: &str, path: &Path) -> StrataResult<Self> {
        toml::from_str(content).map_err(|e| StrataError::PlanInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub async fn load(path: &Path) -> StrataResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| StrataError::io(format!("reading plan {}", path.display()), e))?;
        Self::parse(&content, path)
    }
}

/// Split `KEY=value`
fn parse_key_value(pair: &str) -> StrataResult<(&str, &str)> {
    match pair.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key, value)),
        _ => Err(StrataError::InvalidParameter(format!(
            "expected KEY=value, got {:?}",
            pair
        ))),
    }
}

/// Resolve a WORKDIR against the current working directory
fn resolve_workdir(current: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", current, path)
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
    format!("/{}", parts.join("/"))
}

/// Command line for CMD, ENTRYPOINT and RUN
fn command_line(args: &[String], shell_form: bool, config: &RunConfig, os: &str) -> Vec<String> {
    if shell_form {
        let mut cmd = shell_for(config, os);
        cmd.push(args.join(" "));
        cmd
    } else {
        args.to_vec()
    }
}

/// `["|<n>", args..., cmd...]`, the cache record of a RUN with build args
fn prepend_env_on_cmd(build_args: &[String], cmd: &[String]) -> Vec<String> {
    let mut out = vec![format!("|{}", build_args.len())];
    out.extend(build_args.iter().cloned());
    out.extend(cmd.iter().cloned());
    out
}

impl Builder {
    /// Execute one instruction against `state`
    pub(crate) async fn dispatch(
        &mut self,
        state: &mut DispatchState,
        instruction: &Instruction,
    ) -> StrataResult<()> {
        match instruction {
            Instruction::From { image } => self.dispatch_from(state, image).await,
            Instruction::Maintainer { name } => {
                state.maintainer = name.clone();
                self.commit(state, &format!("MAINTAINER {}", name)).await
            }
            Instruction::Env { vars } => {
                let mut comment = "ENV".to_string();
                for var in vars {
                    let (key, value) = parse_key_value(var)?;
                    state.run_config.env = state.run_config.env_with(key, value);
                    comment.push_str(&format!(" {}={}", key, value));
                }
                self.commit(state, &comment).await
            }
            Instruction::Label { labels } => {
                let mut comment = "LABEL".to_string();
                for (key, value) in labels {
                    state.run_config.labels.insert(key.clone(), value.clone());
                    comment.push_str(&format!(" {}={}", key, value));
                }
                self.commit(state, &comment).await
            }
            Instruction::Expose { ports } => {
                let ports: Vec<String> = ports
                    .iter()
                    .map(|p| if p.contains('/') { p.clone() } else { format!("{}/tcp", p) })
                    .collect();
                state.run_config.exposed_ports.extend(ports.iter().cloned());
                self.commit(state, &format!("EXPOSE {}", ports.join(" "))).await
            }
            Instruction::Volume { paths } => {
                if paths.iter().any(|p| p.trim().is_empty()) {
                    return Err(StrataError::InvalidParameter(
                        "VOLUME specified can not be an empty string".into(),
                    ));
                }
                state.run_config.volumes.extend(paths.iter().cloned());
                self.commit(state, &format!("VOLUME [{}]", paths.join(" "))).await
            }
            Instruction::Workdir { path } => self.dispatch_workdir(state, path).await,
            Instruction::User { user } => {
                state.run_config.user = user.clone();
                self.commit(state, &format!("USER {}", user)).await
            }
            Instruction::Cmd { args, shell_form } => {
                let cmd = command_line(args, *shell_form, &state.run_config, &state.operating_system);
                state.run_config.cmd = cmd.clone();
                state.cmd_set = true;
                self.commit(state, &format!("CMD {:?}", cmd)).await
            }
            Instruction::Entrypoint { args, shell_form } => {
                let entrypoint =
                    command_line(args, *shell_form, &state.run_config, &state.operating_system);
                state.run_config.entrypoint = Some(entrypoint.clone());
                // An entrypoint set after the base image drops the inherited cmd
                if !state.cmd_set {
                    state.run_config.cmd = Vec::new();
                }
                self.commit(state, &format!("ENTRYPOINT {:?}", entrypoint)).await
            }
            Instruction::Healthcheck {
                test,
                interval,
                timeout,
                start_period,
                retries,
            } => {
                state.run_config.healthcheck = Some(HealthConfig {
                    test: test.clone(),
                    interval: *interval,
                    timeout: *timeout,
                    start_period: *start_period,
                    retries: *retries,
                });
                self.commit(state, &format!("HEALTHCHECK {:?}", test)).await
            }
            Instruction::Shell { args } => {
                if args.is_empty() {
                    return Err(StrataError::InvalidParameter(
                        "SHELL requires at least one argument".into(),
                    ));
                }
                state.run_config.shell = args.clone();
                self.commit(state, &format!("SHELL {:?}", args)).await
            }
            Instruction::Onbuild { expression } => {
                state.run_config.on_build.push(expression.clone());
                self.commit(state, &format!("ONBUILD {}", expression)).await
            }
            Instruction::Run {
                command,
                shell_form,
                build_args,
            } => self.dispatch_run(state, command, *shell_form, build_args).await,
            Instruction::Copy {
                sources,
                dest,
                chown,
            } => self.dispatch_copy(state, "COPY", sources, dest, chown, false).await,
            Instruction::Add {
                sources,
                dest,
                chown,
            } => self.dispatch_copy(state, "ADD", sources, dest, chown, true).await,
        }
    }

    async fn dispatch_from(&mut self, state: &mut DispatchState, reference: &str) -> StrataResult<()> {
        let image = self.store.lookup(reference).await?;
        let platform = image.platform();

        if let Some(wanted) = &self.platform {
            if wanted.os != platform.os || wanted.architecture != platform.architecture {
                let warning = format!(
                    "The requested image's platform ({}) does not match the build platform ({})",
                    platform, wanted
                );
                warn!("{}", warning);
                self.progress.warning(&warning);
            }
        }
        if !image.config.config.on_build.is_empty() {
            warn!(
                "Base image {} has {} ONBUILD trigger(s), which are not executed",
                image.id.short(),
                image.config.config.on_build.len()
            );
        }

        debug!("Base image {} for {}", image.id.short(), reference);
        *state = DispatchState {
            image_id: Some(image.id.clone()),
            run_config: image.config.config.clone(),
            maintainer: String::new(),
            operating_system: image.config.os.clone(),
            platform: Some(platform),
            cmd_set: false,
        };
        Ok(())
    }

    async fn dispatch_workdir(&mut self, state: &mut DispatchState, path: &str) -> StrataResult<()> {
        state.run_config.working_dir = resolve_workdir(&state.run_config.working_dir, path);
        if self.options.disable_commit {
            return Ok(());
        }

        let comment = format!("WORKDIR {}", state.run_config.working_dir);
        let candidate = derive(
            &state.run_config,
            &[Modifier::comment_string(comment, &state.operating_system)],
        );
        let Some(container_id) = self.probe_and_create(state, &candidate).await? else {
            return Ok(());
        };
        self.containers
            .create_workdir(&container_id, &state.run_config.working_dir)
            .await?;
        self.commit_container(state, &container_id, candidate).await
    }

    async fn dispatch_run(
        &mut self,
        state: &mut DispatchState,
        command: &[String],
        shell_form: bool,
        build_args: &[String],
    ) -> StrataResult<()> {
        if !state.has_from_image() {
            return Err(StrataError::NoBaseImage);
        }
        let os = state.operating_system.clone();
        let cmd_from_args = command_line(command, shell_form, &state.run_config, &os);
        let args_escaped = shell_form && os.eq_ignore_ascii_case("windows");

        let mut build_args = build_args.to_vec();
        for arg in &build_args {
            parse_key_value(arg)?;
        }
        build_args.sort();

        let save_cmd = if build_args.is_empty() {
            cmd_from_args.clone()
        } else {
            prepend_env_on_cmd(&build_args, &cmd_from_args)
        };

        let probe_config = derive(
            &state.run_config,
            &[
                Modifier::SetCommand(save_cmd.clone()),
                Modifier::SetArgsEscaped(args_escaped),
                Modifier::EntrypointIfCommand {
                    cmd: save_cmd.clone(),
                    entrypoint: None,
                },
            ],
        );
        if self.probe_cache(state, &probe_config).await? {
            return Ok(());
        }

        let mut env = state.run_config.env.clone();
        env.extend(build_args);
        let run_config = derive(
            &state.run_config,
            &[
                Modifier::SetCommand(cmd_from_args),
                Modifier::SetArgsEscaped(args_escaped),
                Modifier::SetEnv(env),
                Modifier::EntrypointIfCommand {
                    cmd: save_cmd,
                    entrypoint: Some(vec![String::new()]),
                },
                Modifier::DisableHealthcheck,
            ],
        );

        let container_id = self.create(state, &run_config).await?;
        self.containers.run(&container_id).await?;
        self.commit_container(state, &container_id, probe_config).await
    }

    async fn dispatch_copy(
        &mut self,
        state: &mut DispatchState,
        cmd_name: &str,
        sources: &[String],
        dest: &str,
        chown: &str,
        decompress: bool,
    ) -> StrataResult<()> {
        let infos = self.context.resolve(sources, decompress)?;
        let instruction = CopyInstruction {
            cmd_name: cmd_name.to_string(),
            infos,
            dest: dest.to_string(),
            chown: chown.to_string(),
            allow_local_decompression: decompress,
            preserve_ownership: false,
        };
        self.perform_copy(state, instruction).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_parses_typed_steps() {
        let plan = Plan::parse(
            r#"
            [[step]]
            instruction = "from"
            image = "base"

            [[step]]
            instruction = "run"
            command = ["make", "install"]

            [[step]]
            instruction = "copy"
            sources = ["a.txt", "b.txt"]
            dest = "/app/"
            chown = "app:staff"

            [[step]]
            instruction = "cmd"
            args = ["./app"]
            "#,
            Path::new("plan.toml"),
        )
        .unwrap();

        assert_eq!(plan.steps.len(), 4);
        assert_eq!(plan.steps[0].to_string(), "FROM base");
        assert_eq!(plan.steps[1].to_string(), "RUN make install");
        assert_eq!(plan.steps[2].to_string(), "COPY --chown=app:staff a.txt b.txt /app/");
        assert_eq!(plan.steps[3].to_string(), "CMD [\"./app\"]");
    }

    #[test]
    fn unknown_instructions_are_rejected_with_path() {
        let err = Plan::parse(
            "[[step]]\ninstruction = \"stopsignal\"\n",
            Path::new("/tmp/plan.toml"),
        )
        .unwrap_err();
        match err {
            StrataError::PlanInvalid { path, .. } => assert_eq!(path, Path::new("/tmp/plan.toml")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn workdir_resolution() {
        assert_eq!(resolve_workdir("", "app"), "/app");
        assert_eq!(resolve_workdir("/app", "src/../lib"), "/app/lib");
        assert_eq!(resolve_workdir("/app", "/opt"), "/opt");
    }

    #[test]
    fn build_args_are_prefixed_with_their_count() {
        let cmd = vec!["/bin/sh".to_string(), "-c".to_string(), "make".to_string()];
        let args = vec!["A=1".to_string()];
        assert_eq!(
            prepend_env_on_cmd(&args, &cmd),
            vec!["|1", "A=1", "/bin/sh", "-c", "make"]
        );
    }

    #[test]
    fn shell_form_uses_configured_shell() {
        let config = RunConfig {
            shell: vec!["/bin/bash".into(), "-c".into()],
            ..RunConfig::default()
        };
        assert_eq!(
            command_line(&["echo".into(), "hi".into()], true, &config, "linux"),
            vec!["/bin/bash", "-c", "echo hi"]
        );
        assert_eq!(
            command_line(&["a".into()], true, &RunConfig::default(), "windows"),
            vec!["cmd", "/S", "/C", "a"]
        );
    }

    #[test]
    fn malformed_pairs_are_invalid() {
        assert!(parse_key_value("NOVALUE").unwrap_err().is_invalid_parameter());
        assert_eq!(parse_key_value("A=b=c").unwrap(), ("A", "b=c"));
    }
}
