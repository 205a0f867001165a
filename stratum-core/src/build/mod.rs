//! The build phase.
//!
//! Top-level orchestration of a build: walk every image's stages in order,
//! resolve each stage against the stages storage or build it atomically,
//! then assemble the final image report. Images proceed concurrently when
//! the conveyor enables parallel mode; stages within one image are strictly
//! sequential.

pub mod diagnostics;
pub mod report;

pub use report::{ImagesReport, ReportImageRecord};

use crate::conveyor::Conveyor;
use crate::digest::{self, PrevStageInputs, BUILD_CACHE_VERSION};
use crate::error::{Result, StratumError};
use crate::image::{Image, StageImage};
use crate::runtime::BuildOptions;
use crate::stage::iterator::{StageHandler, StagesIterator};
use crate::stage::Stage;
use crate::types::{
    parse_repository_and_tag, truncate_id, StageId, CACHE_VERSION_LABEL, IMAGE_LABEL,
    IMAGE_NAME_LABEL, PROJECT_LABEL, STAGE_CONTENT_DIGEST_LABEL, STAGE_DIGEST_LABEL, TOOL_VERSION,
    VERSION_LABEL,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Test race hooks: integer seconds slept before the container build and
/// before the publish window. Production behavior is unchanged when unset.
pub const SLEEP_BEFORE_STAGE_BUILD_ENV: &str =
    "WERF_TEST_ATOMIC_STAGE_BUILD__SLEEP_SECONDS_BEFORE_STAGE_BUILD";
pub const SLEEP_BEFORE_STAGE_SAVE_ENV: &str =
    "WERF_TEST_ATOMIC_STAGE_BUILD__SLEEP_SECONDS_BEFORE_STAGE_SAVE";

/// Report serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    #[default]
    Json,
}

/// A single `image/stage` pair selected for introspection. `*` matches any
/// image name.
#[derive(Debug, Clone)]
pub struct IntrospectTarget {
    pub image_name: String,
    pub stage_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct IntrospectOptions {
    pub targets: Vec<IntrospectTarget>,
}

impl IntrospectOptions {
    pub fn image_stage_should_be_introspected(&self, image_name: &str, stage_name: &str) -> bool {
        self.targets.iter().any(|t| {
            (t.image_name == "*" || t.image_name == image_name) && t.stage_name == stage_name
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildPhaseOptions {
    pub image_build_options: BuildOptions,
    pub introspect_options: IntrospectOptions,
    pub report_path: Option<PathBuf>,
    pub report_format: ReportFormat,
    /// Strict mode: a cache miss is a hard error instead of a build.
    pub should_be_built_mode: bool,
}

/// A phase of the build pipeline, driven by [`run_phase`].
///
/// `clone_phase` yields a shallow copy sharing the phase's cross-image state,
/// used to process images concurrently.
#[async_trait]
pub trait Phase: Send {
    fn name(&self) -> &'static str;

    async fn before_images(&mut self) -> Result<()>;

    async fn before_image_stages(&mut self, img: &Image) -> Result<()>;

    async fn on_image_stage(&mut self, img: &Image, stage: Arc<Stage>) -> Result<()>;

    async fn after_image_stages(&mut self, img: &Image) -> Result<()>;

    fn image_processing_should_be_stopped(&self, _img: &Image) -> bool {
        false
    }

    async fn after_images(&mut self) -> Result<()>;

    fn clone_phase(&self) -> Box<dyn Phase>;
}

/// Run a phase over every image of the conveyor, concurrently when parallel
/// mode is enabled.
pub async fn run_phase(conveyor: &Arc<Conveyor>, mut phase: Box<dyn Phase>) -> Result<()> {
    phase.before_images().await?;

    let images: Vec<Arc<Image>> = conveyor.images().to_vec();
    if conveyor.parallel() && images.len() > 1 {
        debug!(count = images.len(), phase = phase.name(), "processing images in parallel");

        let mut handles = Vec::new();
        for img in images {
            let mut phase_clone = phase.clone_phase();
            handles.push(tokio::spawn(async move {
                process_image(phase_clone.as_mut(), &img).await
            }));
        }
        for handle in handles {
            handle.await.map_err(|e| {
                StratumError::Internal(format!("parallel image task failed: {}", e))
            })??;
        }
    } else {
        for img in images {
            process_image(phase.as_mut(), &img).await?;
        }
    }

    phase.after_images().await
}

#[instrument(skip_all, fields(image = img.name()))]
async fn process_image(phase: &mut dyn Phase, img: &Image) -> Result<()> {
    if phase.image_processing_should_be_stopped(img) {
        return Ok(());
    }

    phase.before_image_stages(img).await?;
    for stage in img.stages() {
        phase.on_image_stage(img, Arc::clone(stage)).await?;
    }
    phase.after_image_stages(img).await
}

/// The build phase: per-image state (stages iterator) plus shared core.
pub struct BuildPhase {
    core: Arc<BuildPhaseCore>,
    stages_iterator: StagesIterator,
}

struct BuildPhaseCore {
    conveyor: Arc<Conveyor>,
    opts: BuildPhaseOptions,
    images_report: Arc<ImagesReport>,
    /// Set once any stage is newly built; images then get a managed-image
    /// record. Shared across the parallel phase clones.
    should_add_managed_image_record: AtomicBool,
}

impl BuildPhase {
    pub fn new(conveyor: Arc<Conveyor>, opts: BuildPhaseOptions) -> Self {
        Self {
            core: Arc::new(BuildPhaseCore {
                conveyor,
                opts,
                images_report: Arc::new(ImagesReport::new()),
                should_add_managed_image_record: AtomicBool::new(false),
            }),
            stages_iterator: StagesIterator::new(),
        }
    }

    /// Handle to the report being assembled, usable after the phase has been
    /// consumed by [`run_phase`].
    pub fn images_report(&self) -> Arc<ImagesReport> {
        Arc::clone(&self.core.images_report)
    }
}

#[async_trait]
impl Phase for BuildPhase {
    fn name(&self) -> &'static str {
        "build"
    }

    async fn before_images(&mut self) -> Result<()> {
        Ok(())
    }

    async fn before_image_stages(&mut self, img: &Image) -> Result<()> {
        self.stages_iterator = StagesIterator::new();
        img.setup_base_image(&self.core.conveyor);
        Ok(())
    }

    async fn on_image_stage(&mut self, img: &Image, stage: Arc<Stage>) -> Result<()> {
        let core = Arc::clone(&self.core);
        let conveyor = Arc::clone(&core.conveyor);
        self.stages_iterator.on_image_stage(&conveyor, img, stage, &*core).await
    }

    async fn after_image_stages(&mut self, img: &Image) -> Result<()> {
        let last_stage = self.stages_iterator.prev_non_empty_stage.clone().unwrap_or_else(|| {
            panic!("expected image {:?} to have at least one non-empty stage", img.name())
        });
        let content_digest = last_stage.content_digest().unwrap_or_else(|| {
            panic!(
                "expected stage {} content digest to be calculated",
                last_stage.log_detailed_name()
            )
        });

        img.set_last_non_empty_stage(last_stage);
        img.set_content_digest(content_digest);

        if img.is_artifact() {
            return Ok(());
        }

        self.core.add_managed_image(img).await?;
        self.core.publish_image_metadata(img).await?;

        Ok(())
    }

    async fn after_images(&mut self) -> Result<()> {
        self.core.create_report()
    }

    fn clone_phase(&self) -> Box<dyn Phase> {
        Box::new(BuildPhase {
            core: Arc::clone(&self.core),
            stages_iterator: StagesIterator::new(),
        })
    }
}

#[async_trait]
impl StageHandler for BuildPhaseCore {
    async fn handle_image_stage(
        &self,
        it: &StagesIterator,
        img: &Image,
        stage: Arc<Stage>,
        is_empty: bool,
    ) -> Result<()> {
        if is_empty {
            return Ok(());
        }

        stage.fetch_dependencies(&self.conveyor).await.map_err(|e| {
            StratumError::FetchDependencies {
                stage: stage.log_detailed_name().to_string(),
                reason: e.to_string(),
            }
        })?;

        if self.opts.should_be_built_mode {
            // Either the whole pipeline is in cache, or the build aborts.
            let _digest_guard = self.calculate_stage(it, img, &stage, true).await?;
            return Ok(());
        }

        if stage.name() != "from" && stage.name() != "dockerfile" {
            let prev_non_empty = it.prev_non_empty_stage.as_ref().unwrap_or_else(|| {
                panic!(
                    "expected prev_non_empty_stage to be set for image {:?} stage {}",
                    img.name(),
                    stage.name()
                )
            });
            let prev_built = it.prev_built_stage.as_ref().unwrap_or_else(|| {
                panic!(
                    "expected prev_built_stage to be set for image {:?} stage {}",
                    img.name(),
                    stage.name()
                )
            });
            if !Arc::ptr_eq(prev_non_empty, prev_built) {
                panic!(
                    "expected prev_built_stage ({:?}) to equal prev_non_empty_stage ({:?}) for image {:?} stage {}",
                    prev_built.log_detailed_name(),
                    prev_non_empty.log_detailed_name(),
                    img.name(),
                    stage.name()
                );
            }
        }

        let _digest_guard = self.calculate_stage(it, img, &stage, false).await?;

        // Stage is cached in the stages storage.
        if stage.image().map(|i| i.stage_description().is_some()).unwrap_or(false) {
            info!("Use cache image for {}", stage.log_detailed_name());
            self.log_image_info(it, &stage, true);

            if self
                .opts
                .introspect_options
                .image_stage_should_be_introspected(img.name(), stage.name())
            {
                self.introspect_stage(&stage).await?;
            }

            return Ok(());
        }

        self.fetch_base_image_for_stage(it, img, &stage).await?;
        self.prepare_stage_instructions(it, img, &stage).await?;
        self.build_stage(it, img, &stage).await?;

        if stage.image().and_then(|i| i.stage_description()).is_none() {
            panic!(
                "expected stage {} image {:?} built image info (image name = {:?}) to be set",
                stage.name(),
                img.name(),
                stage.image().map(|i| i.name())
            );
        }

        // At least one newly built stage: images get a managed-image record.
        self.should_add_managed_image_record.store(true, Ordering::Relaxed);

        Ok(())
    }
}

impl BuildPhaseCore {
    /// Compute and record the stage digest, take the per-digest in-process
    /// lock, and resolve the stage against the stages storage. On a cache
    /// hit the stage is bound to the stored entry; on a miss it gets a fresh
    /// placeholder image to build into. Returns the held digest lock.
    async fn calculate_stage(
        &self,
        it: &StagesIterator,
        img: &Image,
        stage: &Arc<Stage>,
        should_be_built_mode: bool,
    ) -> Result<tokio::sync::OwnedMutexGuard<()>> {
        let conveyor = &self.conveyor;
        let prev_image = it.get_prev_image(img, stage);
        let prev_built_image = it.get_prev_built_image(img, stage);

        let stage_dependencies = stage
            .dependencies(conveyor, prev_image.clone(), prev_built_image)
            .await
            .map_err(|e| StratumError::Calculate {
                stage: stage.log_detailed_name().to_string(),
                reason: e.to_string(),
            })?;

        let prev_inputs = match &it.prev_non_empty_stage {
            Some(prev) => {
                let prev_digest = prev.digest().unwrap_or_else(|| {
                    panic!(
                        "expected prev non-empty stage {} digest to be calculated",
                        prev.log_detailed_name()
                    )
                });
                let next_deps = prev.next_stage_dependencies(conveyor).await.map_err(|e| {
                    StratumError::Calculate {
                        stage: stage.log_detailed_name().to_string(),
                        reason: format!(
                            "unable to get prev stage {} dependencies: {}",
                            prev.name(),
                            e
                        ),
                    }
                })?;
                Some((prev_digest, next_deps))
            }
            None => None,
        };

        let stage_digest = digest::stage_digest(
            stage.name(),
            &stage_dependencies,
            prev_inputs.as_ref().map(|(digest, next_deps)| PrevStageInputs {
                digest,
                next_stage_dependencies: next_deps,
            }),
        );
        stage.set_digest(stage_digest.clone());

        debug!("Locking stage {} handling", stage.log_detailed_name());
        let digest_guard = conveyor.get_stage_digest_mutex(&stage_digest).lock_owned().await;

        let stages = conveyor
            .storage_manager()
            .get_stages_by_digest(stage.log_detailed_name(), &stage_digest)
            .await?;

        match conveyor.storage_manager().select_suitable_stage(stage, &stages) {
            Some(desc) => {
                let image = conveyor.get_or_create_stage_image(prev_image, &desc.info.name);
                image.set_stage_description(desc);
                stage.set_image(image);
            }
            None => {
                if should_be_built_mode {
                    diagnostics::print_should_be_built_error(img, stage);
                    return Err(StratumError::StagesRequired);
                }

                // Will build a new image under a placeholder name.
                let placeholder = Uuid::new_v4().to_string();
                let image = conveyor.get_or_create_stage_image(prev_image, &placeholder);
                stage.set_image(image);
            }
        }

        let next_deps =
            stage.next_stage_dependencies(conveyor).await.map_err(|e| StratumError::Calculate {
                stage: stage.log_detailed_name().to_string(),
                reason: e.to_string(),
            })?;
        let content_digest = digest::stage_digest(
            &digest::content_stage_name(stage.name()),
            "",
            Some(PrevStageInputs {
                digest: &stage_digest,
                next_stage_dependencies: &next_deps,
            }),
        );
        info!("Stage {} content digest: {}", stage.log_detailed_name(), content_digest);
        stage.set_content_digest(content_digest);

        Ok(digest_guard)
    }

    async fn fetch_base_image_for_stage(
        &self,
        it: &StagesIterator,
        img: &Image,
        stage: &Arc<Stage>,
    ) -> Result<()> {
        match stage.name() {
            "from" => {
                img.fetch_base_image(&self.conveyor).await.map_err(|e| {
                    StratumError::BaseImageFetch {
                        base: img.base_image().map(|b| b.name()).unwrap_or_default(),
                        stage: stage.log_detailed_name().to_string(),
                        reason: e.to_string(),
                    }
                })
            }
            "dockerfile" => Ok(()),
            _ => {
                let prev_built = it.prev_built_stage.as_ref().unwrap_or_else(|| {
                    panic!(
                        "expected prev_built_stage to be set for image {:?} stage {}",
                        img.name(),
                        stage.name()
                    )
                });
                self.conveyor
                    .storage_manager()
                    .fetch_stage(self.conveyor.backend().as_ref(), prev_built)
                    .await
            }
        }
    }

    /// Attach the service labels and SSH agent forwarding, then run the
    /// stage's own `prepare_image` hook.
    async fn prepare_stage_instructions(
        &self,
        it: &StagesIterator,
        img: &Image,
        stage: &Arc<Stage>,
    ) -> Result<()> {
        debug!("preparing stage {}", stage.log_detailed_name());

        let stage_image = stage.image().unwrap_or_else(|| {
            panic!("expected stage {} image to be set", stage.log_detailed_name())
        });

        let mut service_labels = HashMap::new();
        service_labels.insert(IMAGE_NAME_LABEL.to_string(), stage_image.name());
        service_labels.insert(PROJECT_LABEL.to_string(), self.conveyor.project_name().to_string());
        service_labels.insert(VERSION_LABEL.to_string(), TOOL_VERSION.to_string());
        service_labels.insert(CACHE_VERSION_LABEL.to_string(), BUILD_CACHE_VERSION.to_string());
        service_labels.insert(IMAGE_LABEL.to_string(), "false".to_string());
        service_labels.insert(STAGE_DIGEST_LABEL.to_string(), stage.digest().unwrap_or_default());
        service_labels
            .insert(STAGE_CONTENT_DIGEST_LABEL.to_string(), stage.content_digest().unwrap_or_default());

        if img.is_dockerfile_image() {
            stage_image.append_dockerfile_build_args(
                service_labels.iter().map(|(key, value)| format!("--label={}={}", key, value)),
            );
        } else {
            stage_image.add_service_labels(service_labels);

            if let Some(sock) = self.conveyor.ssh_auth_sock() {
                if cfg!(target_os = "macos") {
                    stage_image.add_run_volume(
                        "/run/host-services/ssh-auth.sock:/run/host-services/ssh-auth.sock",
                    );
                    stage_image.add_run_env("SSH_AUTH_SOCK", "/run/host-services/ssh-auth.sock");
                } else {
                    stage_image.add_run_volume(&format!("{}:/.stratum/tmp/ssh-auth-sock", sock));
                    stage_image.add_run_env("SSH_AUTH_SOCK", "/.stratum/tmp/ssh-auth-sock");
                }
            }
        }

        let prev_built_image = it.get_prev_built_image(img, stage);
        stage
            .prepare_image(&self.conveyor, prev_built_image, Arc::clone(&stage_image))
            .await
            .map_err(|e| StratumError::Prepare {
                stage: stage.name().to_string(),
                reason: e.to_string(),
            })
    }

    async fn build_stage(&self, it: &StagesIterator, img: &Image, stage: &Arc<Stage>) -> Result<()> {
        if !img.is_dockerfile_image() {
            self.conveyor.backend().get_or_create_service_container().await.map_err(|e| {
                StratumError::Internal(format!("get or create service container failed: {}", e))
            })?;
        }

        stage.pre_run_hook(&self.conveyor).await.map_err(|e| StratumError::PreRunHook {
            stage: stage.log_detailed_name().to_string(),
            reason: e.to_string(),
        })?;

        info!("Building stage {}", stage.log_detailed_name());
        self.atomic_build_stage_image(it, img, stage).await?;
        self.log_image_info(it, stage, false);

        if self
            .opts
            .introspect_options
            .image_stage_should_be_introspected(img.name(), stage.name())
        {
            self.introspect_stage(stage).await?;
        }

        Ok(())
    }

    /// Build the stage image, then publish it under the cross-process stage
    /// lock. Another builder may have published the same digest between our
    /// build and the lock acquisition; in that case the freshly built image
    /// is discarded and the stage rebinds to the winner's entry. At most one
    /// selected entry per digest ever becomes visible.
    async fn atomic_build_stage_image(
        &self,
        it: &StagesIterator,
        img: &Image,
        stage: &Arc<Stage>,
    ) -> Result<()> {
        let stage_image = stage.image().unwrap_or_else(|| {
            panic!("expected stage {} image to be set", stage.log_detailed_name())
        });
        let stage_digest = stage.digest().unwrap_or_else(|| {
            panic!("expected stage {} digest to be calculated", stage.log_detailed_name())
        });

        if let Some(seconds) = test_hook_sleep_seconds(SLEEP_BEFORE_STAGE_BUILD_ENV) {
            info!(
                "Sleeping {} seconds before building new image by digest {}",
                seconds, stage_digest
            );
            tokio::time::sleep(Duration::from_secs(seconds)).await;
        }

        let built = self
            .conveyor
            .backend()
            .build_stage_image(&stage_image, &self.opts.image_build_options)
            .await
            .map_err(|e| StratumError::Build {
                stage: stage.name().to_string(),
                digest: stage_digest.clone(),
                reason: e.to_string(),
            })?;
        stage_image.set_built_info(built);

        if let Some(seconds) = test_hook_sleep_seconds(SLEEP_BEFORE_STAGE_SAVE_ENV) {
            info!(
                "Sleeping {} seconds before saving newly built image {} into stages storage {} by digest {}",
                seconds,
                stage_image.name(),
                self.conveyor.storage_manager().stages_storage().address(),
                stage_digest
            );
            tokio::time::sleep(Duration::from_secs(seconds)).await;
        }

        let lock = self
            .conveyor
            .lock_manager()
            .lock_stage(self.conveyor.project_name(), &stage_digest)
            .await?;

        let result = self.store_stage_image(it, img, stage, &stage_image, &stage_digest).await;

        if let Err(e) = self.conveyor.lock_manager().unlock(lock).await {
            warn!("failed to unlock stage digest {}: {}", stage_digest, e);
        }

        result
    }

    /// The publish window, entered under the cross-process stage lock.
    async fn store_stage_image(
        &self,
        it: &StagesIterator,
        img: &Image,
        stage: &Arc<Stage>,
        stage_image: &Arc<StageImage>,
        stage_digest: &str,
    ) -> Result<()> {
        let conveyor = &self.conveyor;
        let storage_manager = conveyor.storage_manager();

        let stages = storage_manager
            .get_stages_by_digest_from_stages_storage(stage.log_detailed_name(), stage_digest)
            .await?;

        if let Some(desc) = storage_manager.select_suitable_stage(stage, &stages) {
            // Another builder won the race for this digest.
            info!(
                "Discarding newly built image for stage {} by digest {}: detected already existing image {} in the stages storage",
                stage.log_detailed_name(),
                stage_digest,
                desc.info.name
            );

            conveyor.unset_stage_image(&stage_image.name());

            let image = conveyor.get_or_create_stage_image(
                it.get_prev_image(img, stage),
                &desc.info.name,
            );
            image.set_stage_description(desc);
            stage.set_image(image);

            return Ok(());
        }

        // Use the newly built image: rename the placeholder to its final
        // storage name, store, and read back the authoritative metadata.
        let (new_name, unique_id) = storage_manager.generate_stage_unique_id(stage_digest, &stages);

        let image_obj = conveyor.get_stage_image(&stage_image.name()).unwrap_or_else(|| {
            panic!("stage image {:?} is not registered in the conveyor", stage_image.name())
        });
        conveyor.unset_stage_image(&image_obj.name());
        image_obj.set_name(&new_name);
        conveyor.set_stage_image(Arc::clone(&image_obj));

        let storage = storage_manager.stages_storage();
        info!("Storing stage {} into stages storage {}", stage.log_detailed_name(), storage.address());
        storage.store_image(conveyor.project_name(), &image_obj).await.map_err(|e| {
            StratumError::Store {
                stage: stage.log_detailed_name().to_string(),
                image: image_obj.name(),
                storage: storage.address(),
                reason: e.to_string(),
            }
        })?;

        let desc = storage
            .get_stage_description(conveyor.project_name(), stage_digest, unique_id)
            .await
            .map_err(|e| StratumError::StageDescription {
                stage: stage.log_detailed_name().to_string(),
                storage: storage.address(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| StratumError::StageDescription {
                stage: stage.log_detailed_name().to_string(),
                storage: storage.address(),
                reason: "stage description missing right after store".to_string(),
            })?;
        image_obj.set_stage_description(desc.clone());

        let mut stage_ids: Vec<StageId> =
            stages.iter().map(|existing| existing.stage_id.clone()).collect();
        stage_ids.push(desc.stage_id);

        storage_manager
            .atomic_store_stages_by_digest_to_cache(stage.name(), stage_digest, stage_ids)
            .await
    }

    async fn introspect_stage(&self, stage: &Arc<Stage>) -> Result<()> {
        info!("Introspecting stage {}", stage.name());
        let image = stage.image().unwrap_or_else(|| {
            panic!("expected stage {} image to be set", stage.log_detailed_name())
        });
        self.conveyor.backend().introspect_stage_image(&image).await
    }

    fn prev_non_empty_stage_image_size(&self, it: &StagesIterator) -> u64 {
        it.prev_non_empty_stage
            .as_ref()
            .and_then(|s| s.image())
            .and_then(|i| i.stage_description())
            .map(|desc| desc.info.size)
            .unwrap_or(0)
    }

    fn log_image_info(&self, it: &StagesIterator, stage: &Stage, using_cache: bool) {
        let Some(image) = stage.image() else { return };
        let Some(desc) = image.stage_description() else { return };

        let (repository, tag) = parse_repository_and_tag(&desc.info.name);
        info!("      name: {}:{}", repository, tag);
        info!("  image_id: {}", truncate_id(&desc.info.id));
        info!("   created: {}", desc.info.created_at);

        let prev_size = self.prev_non_empty_stage_image_size(it);
        if prev_size == 0 {
            info!("      size: {}", byte_count_binary(desc.info.size));
        } else {
            info!(
                "      size: {} (+{})",
                byte_count_binary(desc.info.size),
                byte_count_binary(desc.info.size.saturating_sub(prev_size))
            );
        }

        if !using_cache {
            let changes = image.user_commit_changes();
            if !changes.is_empty() {
                info!("  instructions: {}", changes.join("\n"));
            }
            let commands = image.user_run_commands();
            if !commands.is_empty() {
                info!("  commands: {}", commands.join("\n"));
            }
        }
    }

    async fn add_managed_image(&self, img: &Image) -> Result<()> {
        if !self.should_add_managed_image_record.load(Ordering::Relaxed) {
            return Ok(());
        }

        let storage = self.conveyor.storage_manager().stages_storage();
        storage
            .add_managed_image(self.conveyor.project_name(), img.name())
            .await
            .map_err(|e| StratumError::ManagedImage {
                image: img.name().to_string(),
                project: self.conveyor.project_name().to_string(),
                reason: e.to_string(),
            })
    }

    /// Publish `(image, HEAD commit, stage id)` metadata, skipping pairs
    /// already present so re-runs stay idempotent.
    async fn publish_image_metadata(&self, img: &Image) -> Result<()> {
        let Some(git_repo) = self.conveyor.git_repo() else {
            return Ok(());
        };

        info!("Processing image {} git metadata", img.name());

        let head_commit =
            git_repo.head_commit().await.map_err(|e| StratumError::ImageMetadata {
                image: img.name().to_string(),
                reason: e.to_string(),
            })?;
        let stage_id = img.stage_id().unwrap_or_else(|| {
            panic!("expected image {:?} stage id to be set after build", img.name())
        });

        let storage = self.conveyor.storage_manager().stages_storage();
        let project = self.conveyor.project_name();

        let exists = storage
            .is_image_metadata_exist(project, img.name(), &head_commit, &stage_id)
            .await
            .map_err(|e| StratumError::ImageMetadata {
                image: img.name().to_string(),
                reason: e.to_string(),
            })?;
        if !exists {
            storage
                .put_image_metadata(project, img.name(), &head_commit, &stage_id)
                .await
                .map_err(|e| StratumError::ImageMetadata {
                    image: img.name().to_string(),
                    reason: e.to_string(),
                })?;
        }

        Ok(())
    }

    fn create_report(&self) -> Result<()> {
        for img in self.conveyor.images() {
            if img.is_artifact() {
                continue;
            }

            let desc = img
                .last_non_empty_stage()
                .and_then(|s| s.image())
                .and_then(|i| i.stage_description())
                .unwrap_or_else(|| {
                    panic!(
                        "expected image {:?} last non-empty stage description to be set",
                        img.name()
                    )
                });

            self.images_report.set_image_record(
                img.name(),
                ReportImageRecord {
                    werf_image_name: desc.info.name.clone(),
                    docker_repo: desc.info.repository.clone(),
                    docker_tag: desc.info.tag.clone(),
                    docker_image_id: desc.info.id.clone(),
                },
            );
        }

        let mut data = self.images_report.to_json()?;
        debug!("images report:\n{}", String::from_utf8_lossy(&data));

        if let Some(path) = &self.opts.report_path {
            if self.opts.report_format == ReportFormat::Json {
                data.push(b'\n');
                write_report(path, &data)?;
            }
        }

        Ok(())
    }
}

/// Parse a test-hook sleep duration from the environment.
fn test_hook_sleep_seconds(var: &str) -> Option<u64> {
    std::env::var(var).ok()?.trim().parse::<u64>().ok().filter(|&s| s > 0)
}

/// Write the report with write-then-rename so readers never observe a
/// partial file. Mode 0644.
fn write_report(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    fs::write(&tmp_path, data)
        .map_err(|e| StratumError::ReportWrite { path: tmp_path.clone(), source: e })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o644))
            .map_err(|e| StratumError::ReportWrite { path: tmp_path.clone(), source: e })?;
    }

    fs::rename(&tmp_path, path)
        .map_err(|e| StratumError::ReportWrite { path: path.to_path_buf(), source: e })
}

/// Human-readable binary byte count.
fn byte_count_binary(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }

    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }

    format!("{:.1} {}iB", bytes as f64 / div as f64, ['K', 'M', 'G', 'T', 'P', 'E'][exp])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_count_binary() {
        assert_eq!(byte_count_binary(0), "0 B");
        assert_eq!(byte_count_binary(1023), "1023 B");
        assert_eq!(byte_count_binary(1024), "1.0 KiB");
        assert_eq!(byte_count_binary(1536), "1.5 KiB");
        assert_eq!(byte_count_binary(5 * 1024 * 1024), "5.0 MiB");
        assert_eq!(byte_count_binary(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn test_introspect_target_matching() {
        let opts = IntrospectOptions {
            targets: vec![
                IntrospectTarget { image_name: "*".to_string(), stage_name: "from".to_string() },
                IntrospectTarget {
                    image_name: "backend".to_string(),
                    stage_name: "install".to_string(),
                },
            ],
        };

        assert!(opts.image_stage_should_be_introspected("anything", "from"));
        assert!(opts.image_stage_should_be_introspected("backend", "install"));
        assert!(!opts.image_stage_should_be_introspected("frontend", "install"));
        assert!(!opts.image_stage_should_be_introspected("backend", "setup"));
    }

    #[test]
    fn test_test_hook_sleep_parsing() {
        assert_eq!(test_hook_sleep_seconds("STRATUM_TEST_UNSET_HOOK_VAR"), None);
    }
}
