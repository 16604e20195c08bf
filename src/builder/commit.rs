//! Cache probing, container commit and image export

use super::dispatch::DispatchState;
use super::Builder;
use crate::container::CommitConfig;
use crate::error::{StrataError, StrataResult};
use crate::image::{ChildConfig, ImageConfig, ImageRecord};
use crate::runconfig::{derive, Modifier, RunConfig};
use crate::store::{ImageMount, RwLayer};
use tracing::info;

impl Builder {
    /// Record a metadata-only change as a new image.
    ///
    /// The candidate command is a two-token no-op marker carrying `comment`.
    pub(crate) async fn commit(&mut self, state: &mut DispatchState, comment: &str) -> StrataResult<()> {
        if self.options.disable_commit {
            return Ok(());
        }
        if !state.has_from_image() {
            return Err(StrataError::NoBaseImage);
        }

        let candidate = derive(
            &state.run_config,
            &[Modifier::comment(comment, &state.operating_system)],
        );
        let Some(container_id) = self.probe_and_create(state, &candidate).await? else {
            return Ok(());
        };
        self.commit_container(state, &container_id, candidate).await
    }

    /// Commit a finished container as the child of the current image
    pub(crate) async fn commit_container(
        &mut self,
        state: &mut DispatchState,
        container_id: &str,
        candidate: RunConfig,
    ) -> StrataResult<()> {
        if self.options.disable_commit {
            return Ok(());
        }

        let commit = CommitConfig {
            author: state.maintainer.clone(),
            config: state.run_config.clone(),
            container_config: candidate,
            container_id: container_id.to_string(),
        };
        let image_id = self.containers.commit(commit).await?;
        state.image_id = Some(image_id);
        Ok(())
    }

    /// Turn a writable layer into a child image of `parent`.
    ///
    /// The committed layer is tracked before anything else can fail, so a
    /// failed registration still leaves it to be released with the build.
    pub(crate) async fn export_image(
        &mut self,
        state: &mut DispatchState,
        layer: &RwLayer,
        parent: &ImageRecord,
        candidate: RunConfig,
    ) -> StrataResult<()> {
        let committed = self.store.commit_rw_layer(layer).await?;
        self.sources.add(ImageMount::new(None, Some(committed.clone())));

        let config = ImageConfig::child(
            &parent.config,
            ChildConfig {
                author: state.maintainer.clone(),
                container_config: candidate,
                diff_id: committed.diff_id.clone(),
                empty_layer: committed.empty,
                config: state.run_config.clone(),
            },
            &parent.config.os,
        );
        let bytes = config.to_bytes()?;

        let exported = self
            .store
            .create_image(&bytes, Some(&parent.id), &committed.digest)
            .await
            .map_err(|e| StrataError::ExportImage {
                source: Box::new(e),
            })?;

        info!(
            "Exported layer {} as image {}",
            &committed.diff_id[..12.min(committed.diff_id.len())],
            exported.id.short()
        );
        state.image_id = Some(exported.id.clone());
        self.sources.add(ImageMount::new(Some(exported), Some(committed)));
        Ok(())
    }

    /// Look for a cached result of `candidate` on the current image.
    ///
    /// On a hit the state moves to the cached image.
    pub(crate) async fn probe_cache(
        &mut self,
        state: &mut DispatchState,
        candidate: &RunConfig,
    ) -> StrataResult<bool> {
        let Some(parent) = state.image_id.as_ref() else {
            return Ok(false);
        };
        let platform = self.platform(state);
        let cached = self.prober.probe(parent, candidate, &platform).await?;
        match cached {
            Some(cached) => {
                self.progress.using_cache();
                self.cache_hits += 1;
                state.image_id = Some(cached);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Probe, and on a miss create a container for `candidate`
    pub(crate) async fn probe_and_create(
        &mut self,
        state: &mut DispatchState,
        candidate: &RunConfig,
    ) -> StrataResult<Option<String>> {
        if self.probe_cache(state, candidate).await? {
            return Ok(None);
        }
        self.create(state, candidate).await.map(Some)
    }

    pub(crate) async fn create(
        &mut self,
        state: &DispatchState,
        config: &RunConfig,
    ) -> StrataResult<String> {
        let image = state.image_id.clone().ok_or(StrataError::NoBaseImage)?;
        let host = self.host_config(&state.operating_system);
        self.containers.create(&image, config, &host).await
    }
}
