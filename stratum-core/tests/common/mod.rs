#![allow(dead_code)]

//! Shared fixtures for build phase integration tests.
//!
//! The container backend is scripted (no real container runtime) and the
//! stages storage / lock manager wrap the in-tree reference implementations
//! with event recording, so tests can assert on call ordering and counts.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stratum_core::{
    BuildOptions, BuiltImageInfo, ContainerBackend, Conveyor, ConveyorOptions, FileLockManager,
    GitRepo, Image, ImageOptions, LocalStagesStorage, LockManager, Result, Stage, StageDescription,
    StageDriver, StageId, StageImage, StageKind, StageLock, StagesStorage,
};

/// Shared, ordered log of backend / storage / lock events.
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn new_event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn events_with_prefix(events: &EventLog, prefix: &str) -> Vec<String> {
    events.lock().unwrap().iter().filter(|e| e.starts_with(prefix)).cloned().collect()
}

pub fn count_events(events: &EventLog, prefix: &str) -> usize {
    events_with_prefix(events, prefix).len()
}

/// Container backend that pretends to build: sleeps for the configured
/// delay, then reports a unique image id.
pub struct ScriptedBackend {
    pub events: EventLog,
    pub build_delay: Duration,
    pub builds: AtomicU64,
}

impl ScriptedBackend {
    pub fn new(events: EventLog) -> Arc<Self> {
        Self::with_delay(events, Duration::ZERO)
    }

    pub fn with_delay(events: EventLog, build_delay: Duration) -> Arc<Self> {
        Arc::new(Self { events, build_delay, builds: AtomicU64::new(0) })
    }

    pub fn build_count(&self) -> u64 {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerBackend for ScriptedBackend {
    async fn build_stage_image(
        &self,
        image: &StageImage,
        _opts: &BuildOptions,
    ) -> Result<BuiltImageInfo> {
        if !self.build_delay.is_zero() {
            tokio::time::sleep(self.build_delay).await;
        }

        let n = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
        self.events.lock().unwrap().push(format!("build:{}", image.name()));

        Ok(BuiltImageInfo {
            id: format!("sha256:{}", uuid::Uuid::new_v4().simple()),
            size: 1024 * n,
        })
    }

    async fn fetch_base_image(&self, name: &str) -> Result<()> {
        self.events.lock().unwrap().push(format!("fetch-base:{}", name));
        Ok(())
    }

    async fn fetch_stage_image(&self, name: &str) -> Result<()> {
        self.events.lock().unwrap().push(format!("fetch-stage:{}", name));
        Ok(())
    }
}

/// Stages storage wrapper recording every write-side call.
pub struct RecordingStorage {
    inner: LocalStagesStorage,
    events: EventLog,
}

impl RecordingStorage {
    pub fn new(root: &Path, events: EventLog) -> Arc<Self> {
        Arc::new(Self { inner: LocalStagesStorage::new(root), events })
    }
}

#[async_trait]
impl StagesStorage for RecordingStorage {
    async fn get_stages_by_digest(
        &self,
        project: &str,
        digest: &str,
    ) -> Result<Vec<StageDescription>> {
        self.inner.get_stages_by_digest(project, digest).await
    }

    async fn store_image(&self, project: &str, image: &StageImage) -> Result<()> {
        self.events.lock().unwrap().push(format!("store-image:{}", image.name()));
        self.inner.store_image(project, image).await
    }

    async fn get_stage_description(
        &self,
        project: &str,
        digest: &str,
        unique_id: u64,
    ) -> Result<Option<StageDescription>> {
        self.inner.get_stage_description(project, digest, unique_id).await
    }

    async fn add_managed_image(&self, project: &str, image_name: &str) -> Result<()> {
        self.events.lock().unwrap().push(format!("add-managed:{}", image_name));
        self.inner.add_managed_image(project, image_name).await
    }

    async fn is_image_metadata_exist(
        &self,
        project: &str,
        image_name: &str,
        commit: &str,
        stage_id: &StageId,
    ) -> Result<bool> {
        self.inner.is_image_metadata_exist(project, image_name, commit, stage_id).await
    }

    async fn put_image_metadata(
        &self,
        project: &str,
        image_name: &str,
        commit: &str,
        stage_id: &StageId,
    ) -> Result<()> {
        self.events.lock().unwrap().push(format!("put-metadata:{}:{}", image_name, commit));
        self.inner.put_image_metadata(project, image_name, commit, stage_id).await
    }

    fn address(&self) -> String {
        self.inner.address()
    }
}

/// Lock manager wrapper recording acquisition and release order.
pub struct RecordingLockManager {
    inner: FileLockManager,
    events: EventLog,
}

impl RecordingLockManager {
    pub fn new(locks_dir: &Path, events: EventLog) -> Arc<Self> {
        Arc::new(Self { inner: FileLockManager::new(locks_dir), events })
    }
}

#[async_trait]
impl LockManager for RecordingLockManager {
    async fn lock_stage(&self, project: &str, digest: &str) -> Result<StageLock> {
        let lock = self.inner.lock_stage(project, digest).await?;
        self.events.lock().unwrap().push(format!("lock:{}", digest));
        Ok(lock)
    }

    async fn unlock(&self, lock: StageLock) -> Result<()> {
        let digest = lock.digest.clone();
        let result = self.inner.unlock(lock).await;
        self.events.lock().unwrap().push(format!("unlock:{}", digest));
        result
    }
}

/// Fixed HEAD commit.
pub struct FixedGitRepo(pub String);

#[async_trait]
impl GitRepo for FixedGitRepo {
    async fn head_commit(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Stage driver returning fixed dependency strings.
pub struct FixedDriver {
    deps: String,
    next_deps: String,
}

impl FixedDriver {
    pub fn new(deps: &str) -> Box<Self> {
        Box::new(Self { deps: deps.to_string(), next_deps: String::new() })
    }
}

#[async_trait]
impl StageDriver for FixedDriver {
    async fn dependencies(
        &self,
        _conveyor: &Conveyor,
        _prev_image: Option<Arc<StageImage>>,
        _prev_built_image: Option<Arc<StageImage>>,
    ) -> Result<String> {
        Ok(self.deps.clone())
    }

    async fn next_stage_dependencies(&self, _conveyor: &Conveyor) -> Result<String> {
        Ok(self.next_deps.clone())
    }
}

/// A "from" + "build" two-stage image, the minimal realistic pipeline.
pub fn two_stage_image(name: &str, base_deps: &str, build_deps: &str) -> Arc<Image> {
    let from = Stage::new(StageKind::From, name, FixedDriver::new(base_deps));
    let build = Stage::new(StageKind::User("build".to_string()), name, FixedDriver::new(build_deps));

    Image::new(
        name,
        vec![from, build],
        ImageOptions { base_image_name: Some("ubuntu:22.04".to_string()), ..Default::default() },
    )
}

/// Assemble a conveyor over the shared test storage root.
pub struct ConveyorBuilder {
    pub images: Vec<Arc<Image>>,
    pub backend: Arc<ScriptedBackend>,
    pub git_repo: Option<Arc<dyn GitRepo>>,
    pub ssh_auth_sock: Option<String>,
    pub parallel: bool,
}

impl ConveyorBuilder {
    pub fn new(images: Vec<Arc<Image>>, backend: Arc<ScriptedBackend>) -> Self {
        Self { images, backend, git_repo: None, ssh_auth_sock: None, parallel: false }
    }

    pub fn build(self, root: &Path, events: &EventLog) -> Arc<Conveyor> {
        Conveyor::new(
            self.images,
            ConveyorOptions {
                project_name: "testproj".to_string(),
                stages_storage: RecordingStorage::new(&root.join("storage"), Arc::clone(events)),
                lock_manager: RecordingLockManager::new(&root.join("locks"), Arc::clone(events)),
                backend: self.backend,
                git_repo: self.git_repo,
                ssh_auth_sock: self.ssh_auth_sock,
                parallel: self.parallel,
            },
        )
    }
}
