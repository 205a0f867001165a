//! In-memory stage image objects.
//!
//! A `StageImage` represents one concrete layer, either hydrated from a
//! stages storage description or freshly built by the container backend.
//! Instances are created through the conveyor registry and shared between
//! tasks, so all mutable state sits behind an internal mutex.

use crate::types::StageDescription;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Options applied to the build container at run time.
#[derive(Debug, Clone, Default)]
pub struct ContainerRunOptions {
    pub volumes: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Commit-time changes applied to the resulting layer.
#[derive(Debug, Clone, Default)]
pub struct CommitChangeOptions {
    pub labels: HashMap<String, String>,
    pub changes: Vec<String>,
}

/// Container configuration accumulated while preparing a stage.
///
/// Service options are attached by the build phase itself; user options come
/// from the stage's own `prepare_image` hook and are what gets echoed back in
/// the build log.
#[derive(Debug, Clone, Default)]
pub struct StageContainer {
    pub run_options: ContainerRunOptions,
    pub service_commit_changes: CommitChangeOptions,
    pub user_commit_changes: Vec<String>,
    pub user_run_commands: Vec<String>,
}

/// Identity and size of a layer reported by the backend after a build.
#[derive(Debug, Clone)]
pub struct BuiltImageInfo {
    /// Content-addressed image id (`sha256:...`).
    pub id: String,
    /// Layer size in bytes.
    pub size: u64,
}

#[derive(Debug, Default)]
struct StageImageState {
    name: String,
    parent: Option<Arc<StageImage>>,
    stage_description: Option<StageDescription>,
    built_info: Option<BuiltImageInfo>,
    container: StageContainer,
    dockerfile_build_args: Vec<String>,
}

/// Runtime object representing a concrete layer.
///
/// The name is mutable: a freshly built image carries a UUID placeholder
/// until publication renames it to its final storage name. Renaming goes
/// through the conveyor registry (unset + set), which is the only legal
/// identity mutation.
#[derive(Debug, Default)]
pub struct StageImage {
    state: Mutex<StageImageState>,
}

impl StageImage {
    pub fn new(name: &str, parent: Option<Arc<StageImage>>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(StageImageState {
                name: name.to_string(),
                parent,
                ..Default::default()
            }),
        })
    }

    pub fn name(&self) -> String {
        self.state.lock().unwrap().name.clone()
    }

    pub fn set_name(&self, name: &str) {
        self.state.lock().unwrap().name = name.to_string();
    }

    pub fn parent(&self) -> Option<Arc<StageImage>> {
        self.state.lock().unwrap().parent.clone()
    }

    pub fn stage_description(&self) -> Option<StageDescription> {
        self.state.lock().unwrap().stage_description.clone()
    }

    pub fn set_stage_description(&self, desc: StageDescription) {
        self.state.lock().unwrap().stage_description = Some(desc);
    }

    pub fn built_info(&self) -> Option<BuiltImageInfo> {
        self.state.lock().unwrap().built_info.clone()
    }

    pub fn set_built_info(&self, info: BuiltImageInfo) {
        self.state.lock().unwrap().built_info = Some(info);
    }

    /// Image id: the built id for fresh layers, otherwise the id from the
    /// bound storage description.
    pub fn image_id(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .built_info
            .as_ref()
            .map(|i| i.id.clone())
            .or_else(|| state.stage_description.as_ref().map(|d| d.info.id.clone()))
    }

    pub fn add_service_labels(&self, labels: HashMap<String, String>) {
        let mut state = self.state.lock().unwrap();
        state.container.service_commit_changes.labels.extend(labels);
    }

    pub fn add_run_volume(&self, volume: &str) {
        self.state.lock().unwrap().container.run_options.volumes.push(volume.to_string());
    }

    pub fn add_run_env(&self, key: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .container
            .run_options
            .env
            .insert(key.to_string(), value.to_string());
    }

    pub fn add_user_commit_change(&self, change: &str) {
        self.state.lock().unwrap().container.user_commit_changes.push(change.to_string());
    }

    pub fn add_user_run_command(&self, command: &str) {
        self.state.lock().unwrap().container.user_run_commands.push(command.to_string());
    }

    pub fn user_commit_changes(&self) -> Vec<String> {
        self.state.lock().unwrap().container.user_commit_changes.clone()
    }

    pub fn user_run_commands(&self) -> Vec<String> {
        self.state.lock().unwrap().container.user_run_commands.clone()
    }

    /// Snapshot of the accumulated container configuration, for backends.
    pub fn container(&self) -> StageContainer {
        self.state.lock().unwrap().container.clone()
    }

    /// Extra arguments for dockerfile builds (service labels are passed as
    /// `--label=` build args instead of commit changes).
    pub fn append_dockerfile_build_args(&self, args: impl IntoIterator<Item = String>) {
        self.state.lock().unwrap().dockerfile_build_args.extend(args);
    }

    pub fn dockerfile_build_args(&self) -> Vec<String> {
        self.state.lock().unwrap().dockerfile_build_args.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rename_keeps_parent_and_options() {
        let parent = StageImage::new("base:latest", None);
        let image = StageImage::new("3f2c9e0a-uuid", Some(Arc::clone(&parent)));
        image.add_run_volume("/tmp/sock:/sock");

        image.set_name("project-stages:abc-123");

        assert_eq!(image.name(), "project-stages:abc-123");
        assert_eq!(image.parent().unwrap().name(), "base:latest");
        assert_eq!(image.container().run_options.volumes, vec!["/tmp/sock:/sock"]);
    }

    #[test]
    fn test_image_id_prefers_built_info() {
        let image = StageImage::new("x", None);
        assert_eq!(image.image_id(), None);

        image.set_built_info(BuiltImageInfo { id: "sha256:built".to_string(), size: 1 });
        assert_eq!(image.image_id().as_deref(), Some("sha256:built"));
    }
}
