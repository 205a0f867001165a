//! Stages storage access.
//!
//! The stages storage is the shared key-value store mapping stage digests to
//! concrete image layers. The core consumes it through the narrow
//! [`StagesStorage`] trait; [`StorageManager`] layers candidate selection,
//! unique-id generation, and the digest → stage-ids cache on top.

pub mod local;
pub mod lock;

pub use local::LocalStagesStorage;
pub use lock::{FileLockManager, LockManager, StageDigestMutexMap, StageLock};

use crate::error::Result;
use crate::image::StageImage;
use crate::runtime::ContainerBackend;
use crate::stage::Stage;
use crate::types::{StageDescription, StageId};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Storage backend for stage layers and their metadata.
///
/// Implementations must be safe under concurrent access from multiple tasks
/// of this process, and `add_managed_image`/`put_image_metadata` must be
/// idempotent.
#[async_trait]
pub trait StagesStorage: Send + Sync {
    /// List every stored stage sharing `digest`.
    async fn get_stages_by_digest(
        &self,
        project: &str,
        digest: &str,
    ) -> Result<Vec<StageDescription>>;

    /// Persist a freshly built stage image under its final storage name.
    async fn store_image(&self, project: &str, image: &StageImage) -> Result<()>;

    /// Read back the authoritative metadata of a stored stage.
    async fn get_stage_description(
        &self,
        project: &str,
        digest: &str,
        unique_id: u64,
    ) -> Result<Option<StageDescription>>;

    /// Mark a logical image name as managed by this project.
    async fn add_managed_image(&self, project: &str, image_name: &str) -> Result<()>;

    /// Whether `(image, commit, stage_id)` metadata has been published.
    async fn is_image_metadata_exist(
        &self,
        project: &str,
        image_name: &str,
        commit: &str,
        stage_id: &StageId,
    ) -> Result<bool>;

    /// Publish `(image, commit, stage_id)` metadata.
    async fn put_image_metadata(
        &self,
        project: &str,
        image_name: &str,
        commit: &str,
        stage_id: &StageId,
    ) -> Result<()>;

    /// Human-readable storage identifier, used in error messages.
    fn address(&self) -> String;
}

/// Front door to the stages storage: candidate listing via the digest
/// cache, suitability selection, unique-id generation, and atomic cache
/// updates.
pub struct StorageManager {
    project_name: String,
    stages_storage: Arc<dyn StagesStorage>,
    /// digest → stage ids resolved so far. The last writer includes all
    /// prior ids plus its own, so the cache only grows.
    stage_ids_cache: tokio::sync::Mutex<HashMap<String, Vec<StageId>>>,
}

impl StorageManager {
    pub fn new(project_name: &str, stages_storage: Arc<dyn StagesStorage>) -> Self {
        Self {
            project_name: project_name.to_string(),
            stages_storage,
            stage_ids_cache: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn stages_storage(&self) -> &Arc<dyn StagesStorage> {
        &self.stages_storage
    }

    /// List stage candidates for `digest`, going through the stage-ids
    /// cache. Cached ids that no longer resolve are dropped silently (the
    /// cleanup subsystem may have removed them).
    pub async fn get_stages_by_digest(
        &self,
        log_name: &str,
        digest: &str,
    ) -> Result<Vec<StageDescription>> {
        let cached = self.stage_ids_cache.lock().await.get(digest).cloned();

        if let Some(stage_ids) = cached {
            debug!(stage = log_name, digest, "stage ids cache hit");
            let mut descriptions = Vec::with_capacity(stage_ids.len());
            for stage_id in stage_ids {
                if let Some(desc) = self
                    .stages_storage
                    .get_stage_description(&self.project_name, digest, stage_id.unique_id)
                    .await?
                {
                    descriptions.push(desc);
                }
            }
            return Ok(descriptions);
        }

        debug!(stage = log_name, digest, "stage ids cache miss, listing storage");
        let descriptions =
            self.stages_storage.get_stages_by_digest(&self.project_name, digest).await?;

        let stage_ids = descriptions.iter().map(|d| d.stage_id.clone()).collect();
        self.stage_ids_cache.lock().await.insert(digest.to_string(), stage_ids);

        Ok(descriptions)
    }

    /// List stage candidates for `digest` directly from the stages storage,
    /// refreshing the cache. The publish window must use this instead of
    /// [`get_stages_by_digest`](Self::get_stages_by_digest): the process-local
    /// cache cannot see another builder's concurrent publication.
    pub async fn get_stages_by_digest_from_stages_storage(
        &self,
        log_name: &str,
        digest: &str,
    ) -> Result<Vec<StageDescription>> {
        debug!(stage = log_name, digest, "listing stages storage");
        let descriptions =
            self.stages_storage.get_stages_by_digest(&self.project_name, digest).await?;

        let stage_ids = descriptions.iter().map(|d| d.stage_id.clone()).collect();
        self.stage_ids_cache.lock().await.insert(digest.to_string(), stage_ids);

        Ok(descriptions)
    }

    /// Apply the stage's suitability rules to the candidates and pick one
    /// or none.
    pub fn select_suitable_stage(
        &self,
        stage: &Stage,
        candidates: &[StageDescription],
    ) -> Option<StageDescription> {
        stage.select_suitable(candidates)
    }

    /// Make a cached stage's layer locally available.
    pub async fn fetch_stage(&self, backend: &dyn ContainerBackend, stage: &Stage) -> Result<()> {
        let image = stage.image().ok_or_else(|| crate::error::StratumError::Internal(format!(
            "stage {} has no image to fetch",
            stage.log_detailed_name()
        )))?;
        backend.fetch_stage_image(&image.name()).await
    }

    /// Produce a storage name and unique id for a newly built layer that
    /// does not collide with any existing entry of the same digest.
    pub fn generate_stage_unique_id(
        &self,
        digest: &str,
        existing: &[StageDescription],
    ) -> (String, u64) {
        let now = Utc::now().timestamp_millis() as u64;
        let max_existing =
            existing.iter().map(|desc| desc.stage_id.unique_id).max().unwrap_or(0);
        let unique_id = now.max(max_existing + 1);

        let name = format!("{}-stages:{}-{}", self.project_name, digest, unique_id);
        (name, unique_id)
    }

    /// Replace the digest's cached stage-id list. Called under the
    /// cross-process stage lock with the full list (every prior candidate
    /// plus the new entry), which makes the update a monotonic overwrite.
    pub async fn atomic_store_stages_by_digest_to_cache(
        &self,
        stage_name: &str,
        digest: &str,
        stage_ids: Vec<StageId>,
    ) -> Result<()> {
        info!(stage = stage_name, digest, count = stage_ids.len(), "storing stage ids cache");
        self.stage_ids_cache.lock().await.insert(digest.to_string(), stage_ids);
        Ok(())
    }
}
