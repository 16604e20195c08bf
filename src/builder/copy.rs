//! COPY and ADD

use super::dispatch::DispatchState;
use super::Builder;
use crate::copy::{
    copy_comment, copy_for_info, normalize_dest, parse_chown_flag, source_hash, CopyFileOptions,
    CopyInstruction, DestInfo,
};
use crate::error::{StrataError, StrataResult};
use crate::runconfig::{derive, Modifier};
use tracing::debug;

const CHOWN_MAPPING_FAILED: &str = "unable to convert uid/gid chown string to host mapping";
const CHOWN_SID_FAILED: &str = "unable to map container user account name to SID";

impl Builder {
    /// Materialize the sources of a copy instruction as a new image.
    ///
    /// The cache is probed before any layer is mounted or ownership looked
    /// up; a hit does no filesystem work at all.
    pub(crate) async fn perform_copy(
        &mut self,
        state: &mut DispatchState,
        instruction: CopyInstruction,
    ) -> StrataResult<()> {
        let src_hash = source_hash(&instruction.infos);
        let comment = copy_comment(&instruction, &src_hash);
        let candidate = derive(
            &state.run_config,
            &[Modifier::comment_string(comment, &state.operating_system)],
        );
        if self.probe_cache(state, &candidate).await? {
            return Ok(());
        }

        let image_id = state.image_id.clone().ok_or(StrataError::NoBaseImage)?;
        let parent = self
            .sources
            .get(&image_id)
            .await
            .map_err(|e| StrataError::DestinationImage {
                image: image_id.to_string(),
                source: Box::new(e),
            })?;

        // Released when dropped, so every early return below gives it back
        let layer = self.store.new_rw_layer(&image_id).await?;

        let dest = DestInfo {
            root: layer.root().to_path_buf(),
            path: normalize_dest(
                &instruction.cmd_name,
                &state.run_config.working_dir,
                &instruction.dest,
            )?,
        };

        let mut identity = self.id_mapping.root_pair();
        if !instruction.chown.is_empty() {
            let message = if self.platform(state).os.eq_ignore_ascii_case("windows") {
                CHOWN_SID_FAILED
            } else {
                CHOWN_MAPPING_FAILED
            };
            identity = parse_chown_flag(&instruction.chown, &dest.root, &self.id_mapping)
                .map_err(|e| StrataError::Ownership {
                    message,
                    reason: e.to_string(),
                })?;
        }

        let options = CopyFileOptions {
            decompress: instruction.allow_local_decompression,
            identity: (!instruction.preserve_ownership).then_some(identity),
        };
        for info in &instruction.infos {
            debug!("Copying {} into {}", info.path, dest.path);
            let (dest, info) = (dest.clone(), info.clone());
            tokio::task::spawn_blocking(move || copy_for_info(&dest, &info, &options))
                .await
                .map_err(|e| StrataError::Internal(format!("copy task failed: {}", e)))?
                .map_err(|e| StrataError::CopyFailed {
                    source: Box::new(e),
                })?;
            self.materialized += 1;
        }

        let exported = self.export_image(state, &layer, &parent, candidate).await;
        layer.release();
        exported
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use crate::builder::Instruction;
    use crate::config::schema::BuildConfig;
    use crate::error::ErrorKind;
    use crate::image::Platform;
    use crate::output::Progress;
    use crate::store::ImageStore;
    use std::fs;

    fn copy_with_chown(chown: &str) -> Vec<Instruction> {
        vec![
            Instruction::From {
                image: "base".into(),
            },
            Instruction::Copy {
                sources: vec!["a.txt".into()],
                dest: "/app/".into(),
                chown: chown.into(),
            },
        ]
    }

    #[tokio::test]
    async fn chown_failure_on_linux() {
        let env = TestEnv::new().await;
        fs::write(env.context.path().join("a.txt"), "one").unwrap();
        let err = env.builder().build(&copy_with_chown("nobody")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Ownership);
        assert!(err
            .to_string()
            .contains("unable to convert uid/gid chown string to host mapping"));
        assert_eq!(env.local.active_rw_layers(), 0);
    }

    #[tokio::test]
    async fn chown_failure_on_windows() {
        let env = TestEnv::with_platform(Platform::new("windows", "amd64")).await;
        fs::write(env.context.path().join("a.txt"), "one").unwrap();
        let err = env.builder().build(&copy_with_chown("nobody")).await.unwrap_err();
        assert!(err
            .to_string()
            .contains("unable to map container user account name to SID"));
    }

    #[tokio::test]
    async fn chown_is_part_of_the_cache_key() {
        let env = TestEnv::new().await;
        fs::write(env.context.path().join("a.txt"), "one").unwrap();
        let plain = env.builder().build(&copy_with_chown("")).await.unwrap();
        let owned = env.builder().build(&copy_with_chown("app")).await.unwrap();
        assert_ne!(plain.image_id, owned.image_id);
        assert_eq!(owned.cache_hits, 0);

        let record = env.store.get_image(&owned.image_id).await.unwrap();
        let cmd = record.config.container_config.cmd.last().cloned().unwrap();
        assert!(cmd.starts_with("#(nop) COPY --chown=app file:"));
        assert!(cmd.ends_with(" in /app/ "));
    }

    #[tokio::test]
    async fn multi_source_order_matters() {
        let env = TestEnv::new().await;
        fs::write(env.context.path().join("a.txt"), "one").unwrap();
        fs::write(env.context.path().join("b.txt"), "two").unwrap();
        let copy = |sources: &[&str]| {
            vec![
                Instruction::From {
                    image: "base".into(),
                },
                Instruction::Copy {
                    sources: sources.iter().map(|s| s.to_string()).collect(),
                    dest: "/app/".into(),
                    chown: String::new(),
                },
            ]
        };

        let ab = env.builder().build(&copy(&["a.txt", "b.txt"])).await.unwrap();
        let ba = env.builder().build(&copy(&["b.txt", "a.txt"])).await.unwrap();
        let ab_again = env.builder().build(&copy(&["a.txt", "b.txt"])).await.unwrap();
        assert_ne!(ab.image_id, ba.image_id);
        assert_eq!(ab.image_id, ab_again.image_id);
        assert_eq!(ab.materialized, 2);
        assert_eq!(ab_again.materialized, 0);
    }

    #[tokio::test]
    async fn failed_registration_leaves_layer_tracked() {
        let env = TestEnv::new().await;
        fs::write(env.context.path().join("a.txt"), "one").unwrap();
        let mut builder = env.builder_with(Progress::quiet(), BuildConfig::default());

        let mut state = Default::default();
        builder
            .dispatch(
                &mut state,
                &Instruction::From {
                    image: "base".into(),
                },
            )
            .await
            .unwrap();

        env.store.fail_create(true);
        let err = builder
            .dispatch(
                &mut state,
                &Instruction::Copy {
                    sources: vec!["a.txt".into()],
                    dest: "/app/".into(),
                    chown: String::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to export image"));
        assert_eq!(state.image_id.as_ref(), Some(&env.base.id));
        assert_eq!(env.local.active_rw_layers(), 0);

        let orphans: Vec<String> = builder
            .sources
            .orphaned_layers()
            .iter()
            .map(|l| l.diff_id.clone())
            .collect();
        assert_eq!(orphans.len(), 1);
        assert!(env.layer_exists(&orphans[0]));

        builder.sources.unmount_all().await.unwrap();
        assert!(!env.layer_exists(&orphans[0]));
    }
}
