//! Build execution
//!
//! A [`Builder`] runs a plan of typed instructions in order. Each step
//! derives its candidate configuration from the dispatch state, probes the
//! cache and only on a miss creates a container or materializes files.
//!
//! | Module     | Role                                          |
//! |------------|-----------------------------------------------|
//! | `dispatch` | Instruction types, plan files, per-step logic |
//! | `commit`   | Cache probing, container commit, image export |
//! | `copy`     | COPY and ADD into a writable layer            |

mod commit;
mod copy;
pub mod dispatch;
#[cfg(test)]
mod testutil;

pub use dispatch::{DispatchState, Instruction, Plan};

use crate::cache::{new_prober, ImageProber};
use crate::config::schema::BuildConfig;
use crate::container::{host_config_from_options, ContainerBackend, Containers, HostConfig};
use crate::context::BuildContext;
use crate::copy::IdentityMapping;
use crate::error::{StrataError, StrataResult};
use crate::image::{ImageId, Platform};
use crate::output::Progress;
use crate::store::{ImageSources, ImageStore};
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of a successful build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSummary {
    pub image_id: ImageId,
    pub steps: usize,
    pub cache_hits: usize,
    pub containers_created: usize,
    /// Copy sources written into writable layers
    pub materialized: usize,
}

/// Runs build plans against one store and container backend
pub struct Builder {
    store: Arc<dyn ImageStore>,
    prober: Box<dyn ImageProber>,
    containers: Containers,
    sources: ImageSources,
    context: BuildContext,
    options: BuildConfig,
    platform: Option<Platform>,
    id_mapping: IdentityMapping,
    host_config: Option<HostConfig>,
    progress: Progress,
    cache_hits: usize,
    materialized: usize,
}

impl Builder {
    pub fn new(
        store: Arc<dyn ImageStore>,
        backend: Arc<dyn ContainerBackend>,
        context: BuildContext,
        options: &BuildConfig,
        progress: Progress,
    ) -> StrataResult<Self> {
        let platform = options.platform.as_deref().map(Platform::parse).transpose()?;

        Ok(Self {
            prober: new_prober(store.clone(), options.no_cache),
            sources: ImageSources::new(store.clone()),
            containers: Containers::new(backend, progress.clone()),
            store,
            context,
            options: options.clone(),
            platform,
            id_mapping: IdentityMapping::new(options.uid_map.clone(), options.gid_map.clone()),
            host_config: None,
            progress,
            cache_hits: 0,
            materialized: 0,
        })
    }

    /// Run every instruction in order.
    ///
    /// Containers and mounts of the build are released whether or not it
    /// succeeds. Images committed before a failing step stay in the store.
    pub async fn build(&mut self, instructions: &[Instruction]) -> StrataResult<BuildSummary> {
        if instructions.is_empty() {
            return Err(StrataError::Precondition("build plan has no instructions".into()));
        }

        let mut state = DispatchState::default();
        let outcome = self.run_steps(&mut state, instructions).await;
        let cleanup = self.cleanup().await;
        outcome?;
        cleanup?;

        let image_id = state.image_id.ok_or(StrataError::NoBaseImage)?;
        info!("Successfully built {}", image_id.short());
        Ok(BuildSummary {
            image_id,
            steps: instructions.len(),
            cache_hits: self.cache_hits,
            containers_created: self.containers.created_count(),
            materialized: self.materialized,
        })
    }

    async fn run_steps(
        &mut self,
        state: &mut DispatchState,
        instructions: &[Instruction],
    ) -> StrataResult<()> {
        let total = instructions.len();
        for (index, instruction) in instructions.iter().enumerate() {
            self.progress.step(index + 1, total, &instruction.to_string());

            // Steps work on a copy so a failure leaves the state untouched
            let mut next = state.clone();
            if let Err(e) = self.dispatch(&mut next, instruction).await {
                let context = match &state.image_id {
                    Some(id) => format!("{} on {}", instruction.name(), id.short()),
                    None => instruction.name().to_string(),
                };
                return Err(e.in_step(context));
            }
            *state = next;

            if let Some(id) = &state.image_id {
                self.progress.image(id.as_str());
            }
        }
        Ok(())
    }

    async fn cleanup(&mut self) -> StrataResult<()> {
        let removed = self.containers.remove_all().await;
        let unmounted = self.sources.unmount_all().await;
        if let (Err(e), Err(_)) = (&removed, &unmounted) {
            warn!("Container cleanup failed: {}", e);
        }
        removed.and(unmounted)
    }

    /// Platform the cache is keyed on for the current step.
    ///
    /// Committed images inherit the platform of their base, so once a base
    /// image is set its platform wins over the build option. Stored children
    /// are keyed on the platform they carry, and the two must agree.
    pub(crate) fn platform(&self, state: &DispatchState) -> Platform {
        let mut platform = state
            .platform
            .clone()
            .or_else(|| self.platform.clone())
            .unwrap_or_else(Platform::host);
        if !state.operating_system.is_empty() {
            platform.os = state.operating_system.clone();
        }
        platform
    }

    /// Host configuration shared by every container of the build
    pub(crate) fn host_config(&mut self, os: &str) -> HostConfig {
        self.host_config
            .get_or_insert_with(|| host_config_from_options(&self.options, os))
            .clone()
    }
}
