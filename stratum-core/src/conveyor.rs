//! The conveyor: in-memory registry shared by every task of one build.
//!
//! Holds the logical images, the stage image registry (deduplicating stage
//! image objects by name), the per-digest mutex map, and handles to the
//! external collaborators. One conveyor per build invocation.

use crate::image::{Image, StageImage};
use crate::runtime::ContainerBackend;
use crate::storage::{LockManager, StageDigestMutexMap, StagesStorage, StorageManager};
use crate::vcs::GitRepo;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// External collaborators and build-wide settings for a conveyor.
pub struct ConveyorOptions {
    pub project_name: String,
    pub stages_storage: Arc<dyn StagesStorage>,
    pub lock_manager: Arc<dyn LockManager>,
    pub backend: Arc<dyn ContainerBackend>,
    pub git_repo: Option<Arc<dyn GitRepo>>,
    /// Host SSH agent socket path, forwarded into build containers.
    pub ssh_auth_sock: Option<String>,
    /// Build independent images concurrently.
    pub parallel: bool,
}

pub struct Conveyor {
    project_name: String,
    images: Vec<Arc<Image>>,
    storage_manager: StorageManager,
    lock_manager: Arc<dyn LockManager>,
    backend: Arc<dyn ContainerBackend>,
    git_repo: Option<Arc<dyn GitRepo>>,
    ssh_auth_sock: Option<String>,
    parallel: bool,
    stage_images: Mutex<HashMap<String, Arc<StageImage>>>,
    stage_digest_mutexes: StageDigestMutexMap,
}

impl Conveyor {
    pub fn new(images: Vec<Arc<Image>>, opts: ConveyorOptions) -> Arc<Self> {
        let storage_manager =
            StorageManager::new(&opts.project_name, Arc::clone(&opts.stages_storage));
        Arc::new(Self {
            project_name: opts.project_name,
            images,
            storage_manager,
            lock_manager: opts.lock_manager,
            backend: opts.backend,
            git_repo: opts.git_repo,
            ssh_auth_sock: opts.ssh_auth_sock,
            parallel: opts.parallel,
            stage_images: Mutex::new(HashMap::new()),
            stage_digest_mutexes: StageDigestMutexMap::new(),
        })
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    pub fn images(&self) -> &[Arc<Image>] {
        &self.images
    }

    pub fn storage_manager(&self) -> &StorageManager {
        &self.storage_manager
    }

    pub fn lock_manager(&self) -> &Arc<dyn LockManager> {
        &self.lock_manager
    }

    pub fn backend(&self) -> &Arc<dyn ContainerBackend> {
        &self.backend
    }

    pub fn git_repo(&self) -> Option<&Arc<dyn GitRepo>> {
        self.git_repo.as_ref()
    }

    pub fn ssh_auth_sock(&self) -> Option<&str> {
        self.ssh_auth_sock.as_deref()
    }

    pub fn parallel(&self) -> bool {
        self.parallel
    }

    /// The per-digest in-process mutex; the same digest always yields the
    /// same mutex within this build.
    pub fn get_stage_digest_mutex(&self, digest: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.stage_digest_mutexes.get(digest)
    }

    /// Fetch the stage image registered under `name`, creating it with the
    /// given parent if absent. Deduplicates by name: concurrent callers for
    /// the same name observe the same object.
    pub fn get_or_create_stage_image(
        &self,
        parent: Option<Arc<StageImage>>,
        name: &str,
    ) -> Arc<StageImage> {
        let mut registry = self.stage_images.lock().unwrap();
        Arc::clone(
            registry
                .entry(name.to_string())
                .or_insert_with(|| StageImage::new(name, parent)),
        )
    }

    pub fn get_stage_image(&self, name: &str) -> Option<Arc<StageImage>> {
        self.stage_images.lock().unwrap().get(name).cloned()
    }

    pub fn set_stage_image(&self, image: Arc<StageImage>) {
        self.stage_images.lock().unwrap().insert(image.name(), image);
    }

    pub fn unset_stage_image(&self, name: &str) {
        self.stage_images.lock().unwrap().remove(name);
    }
}
