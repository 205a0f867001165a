//! Build pipeline stages.
//!
//! A stage is one ordered step in an image's build pipeline. Stage kinds
//! form a closed set ("from", "dockerfile") plus user-defined names; the
//! per-kind behavior is supplied by the configuration loader through the
//! [`StageDriver`] seam so the orchestration core stays independent of how
//! stages compute their inputs.

pub mod iterator;

pub use iterator::{StageHandler, StagesIterator};

use crate::conveyor::Conveyor;
use crate::error::Result;
use crate::image::StageImage;
use crate::types::StageDescription;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// Stage kind: the closed set plus user-defined stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageKind {
    /// Base stage pulling the declared base image.
    From,
    /// Stage built from an external Dockerfile.
    Dockerfile,
    /// User-defined stage.
    User(String),
}

impl StageKind {
    pub fn name(&self) -> &str {
        match self {
            StageKind::From => "from",
            StageKind::Dockerfile => "dockerfile",
            StageKind::User(name) => name,
        }
    }
}

/// Per-kind stage behavior, implemented by the configuration loader.
///
/// Every hook receives the shared conveyor; long-running hooks must be
/// prompt to cancel. Defaults are no-ops so simple stages only implement
/// `dependencies`.
#[async_trait]
pub trait StageDriver: Send + Sync {
    /// Summary string of the stage's own inputs, hashed into its digest.
    async fn dependencies(
        &self,
        conveyor: &Conveyor,
        prev_image: Option<Arc<StageImage>>,
        prev_built_image: Option<Arc<StageImage>>,
    ) -> Result<String>;

    /// What this stage contributes to its successor's digest.
    async fn next_stage_dependencies(&self, _conveyor: &Conveyor) -> Result<String> {
        Ok(String::new())
    }

    /// Whether the stage produces no layer for the current configuration.
    async fn is_empty(
        &self,
        _conveyor: &Conveyor,
        _prev_built_image: Option<Arc<StageImage>>,
    ) -> Result<bool> {
        Ok(false)
    }

    /// Pull any external inputs the stage declares.
    async fn fetch_dependencies(&self, _conveyor: &Conveyor) -> Result<()> {
        Ok(())
    }

    /// Populate the stage image with the stage's own instructions.
    async fn prepare_image(
        &self,
        _conveyor: &Conveyor,
        _prev_built_image: Option<Arc<StageImage>>,
        _stage_image: Arc<StageImage>,
    ) -> Result<()> {
        Ok(())
    }

    /// Invoked right before the container build.
    async fn pre_run_hook(&self, _conveyor: &Conveyor) -> Result<()> {
        Ok(())
    }

    /// Pick a suitable cached stage among storage candidates sharing this
    /// stage's digest, or none. The default takes the oldest entry.
    fn select_suitable(&self, candidates: &[StageDescription]) -> Option<StageDescription> {
        candidates
            .iter()
            .min_by_key(|desc| (desc.info.created_at, desc.stage_id.unique_id))
            .cloned()
    }
}

#[derive(Debug, Default)]
struct StageState {
    digest: Option<String>,
    content_digest: Option<String>,
    image: Option<Arc<StageImage>>,
}

/// One pipeline step of a logical image.
///
/// The digest is assigned once during calculation and immutable thereafter;
/// the bound image handle is replaced only when a publish race rebinds the
/// stage to the winner's storage entry.
pub struct Stage {
    kind: StageKind,
    log_name: String,
    driver: Box<dyn StageDriver>,
    state: Mutex<StageState>,
}

impl Stage {
    pub fn new(kind: StageKind, image_name: &str, driver: Box<dyn StageDriver>) -> Arc<Self> {
        let log_name = format!("{}/{}", image_name, kind.name());
        Arc::new(Self { kind, log_name, driver, state: Mutex::new(StageState::default()) })
    }

    pub fn kind(&self) -> &StageKind {
        &self.kind
    }

    pub fn name(&self) -> &str {
        self.kind.name()
    }

    /// Qualified `image/stage` name used in logs and storage queries.
    pub fn log_detailed_name(&self) -> &str {
        &self.log_name
    }

    pub fn digest(&self) -> Option<String> {
        self.state.lock().unwrap().digest.clone()
    }

    pub fn set_digest(&self, digest: String) {
        self.state.lock().unwrap().digest = Some(digest);
    }

    pub fn content_digest(&self) -> Option<String> {
        self.state.lock().unwrap().content_digest.clone()
    }

    pub fn set_content_digest(&self, digest: String) {
        self.state.lock().unwrap().content_digest = Some(digest);
    }

    pub fn image(&self) -> Option<Arc<StageImage>> {
        self.state.lock().unwrap().image.clone()
    }

    pub fn set_image(&self, image: Arc<StageImage>) {
        self.state.lock().unwrap().image = Some(image);
    }

    // Driver delegation.

    pub async fn dependencies(
        &self,
        conveyor: &Conveyor,
        prev_image: Option<Arc<StageImage>>,
        prev_built_image: Option<Arc<StageImage>>,
    ) -> Result<String> {
        self.driver.dependencies(conveyor, prev_image, prev_built_image).await
    }

    pub async fn next_stage_dependencies(&self, conveyor: &Conveyor) -> Result<String> {
        self.driver.next_stage_dependencies(conveyor).await
    }

    pub async fn is_empty(
        &self,
        conveyor: &Conveyor,
        prev_built_image: Option<Arc<StageImage>>,
    ) -> Result<bool> {
        self.driver.is_empty(conveyor, prev_built_image).await
    }

    pub async fn fetch_dependencies(&self, conveyor: &Conveyor) -> Result<()> {
        self.driver.fetch_dependencies(conveyor).await
    }

    pub async fn prepare_image(
        &self,
        conveyor: &Conveyor,
        prev_built_image: Option<Arc<StageImage>>,
        stage_image: Arc<StageImage>,
    ) -> Result<()> {
        self.driver.prepare_image(conveyor, prev_built_image, stage_image).await
    }

    pub async fn pre_run_hook(&self, conveyor: &Conveyor) -> Result<()> {
        self.driver.pre_run_hook(conveyor).await
    }

    pub fn select_suitable(&self, candidates: &[StageDescription]) -> Option<StageDescription> {
        self.driver.select_suitable(candidates)
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("kind", &self.kind)
            .field("log_name", &self.log_name)
            .field("state", &self.state.lock().unwrap())
            .finish()
    }
}
