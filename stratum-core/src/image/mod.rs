//! Logical images and their runtime stage image objects.

pub mod stage_image;

pub use stage_image::{
    BuiltImageInfo, CommitChangeOptions, ContainerRunOptions, StageContainer, StageImage,
};

use crate::conveyor::Conveyor;
use crate::error::{Result, StratumError};
use crate::stage::Stage;
use crate::types::StageId;
use std::sync::{Arc, Mutex};

/// Construction parameters for a logical image.
#[derive(Debug, Default)]
pub struct ImageOptions {
    /// Intermediate-only image: participates in builds, never reported.
    pub is_artifact: bool,
    /// Built from an external Dockerfile instead of the declarative builder.
    pub is_dockerfile_image: bool,
    /// Declared base image name, bound to a stage image by
    /// [`Image::setup_base_image`].
    pub base_image_name: Option<String>,
}

#[derive(Debug, Default)]
struct ImageState {
    base_image: Option<Arc<StageImage>>,
    last_non_empty_stage: Option<Arc<Stage>>,
    content_digest: Option<String>,
}

/// A named image in the user's build configuration, with its ordered stage
/// pipeline.
pub struct Image {
    name: String,
    is_artifact: bool,
    is_dockerfile_image: bool,
    base_image_name: Option<String>,
    stages: Vec<Arc<Stage>>,
    state: Mutex<ImageState>,
}

impl Image {
    pub fn new(name: &str, stages: Vec<Arc<Stage>>, opts: ImageOptions) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            is_artifact: opts.is_artifact,
            is_dockerfile_image: opts.is_dockerfile_image,
            base_image_name: opts.base_image_name,
            stages,
            state: Mutex::new(ImageState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_artifact(&self) -> bool {
        self.is_artifact
    }

    pub fn is_dockerfile_image(&self) -> bool {
        self.is_dockerfile_image
    }

    pub fn stages(&self) -> &[Arc<Stage>] {
        &self.stages
    }

    pub fn base_image_name(&self) -> Option<&str> {
        self.base_image_name.as_deref()
    }

    pub fn base_image(&self) -> Option<Arc<StageImage>> {
        self.state.lock().unwrap().base_image.clone()
    }

    /// Bind the declared base image to a stage image handle in the conveyor
    /// registry. Called once per image before its stages are walked.
    pub fn setup_base_image(&self, conveyor: &Conveyor) {
        if let Some(name) = &self.base_image_name {
            let image = conveyor.get_or_create_stage_image(None, name);
            self.state.lock().unwrap().base_image = Some(image);
        }
    }

    /// Pull the declared base image through the container backend. Only the
    /// "from" stage triggers this.
    pub async fn fetch_base_image(&self, conveyor: &Conveyor) -> Result<()> {
        let base = self.base_image().ok_or_else(|| StratumError::Internal(format!(
            "image {:?} has no base image to fetch",
            self.name
        )))?;
        conveyor.backend().fetch_base_image(&base.name()).await
    }

    pub fn last_non_empty_stage(&self) -> Option<Arc<Stage>> {
        self.state.lock().unwrap().last_non_empty_stage.clone()
    }

    pub fn set_last_non_empty_stage(&self, stage: Arc<Stage>) {
        self.state.lock().unwrap().last_non_empty_stage = Some(stage);
    }

    pub fn content_digest(&self) -> Option<String> {
        self.state.lock().unwrap().content_digest.clone()
    }

    pub fn set_content_digest(&self, digest: String) {
        self.state.lock().unwrap().content_digest = Some(digest);
    }

    /// Stage id of the image's last non-empty stage, available after the
    /// stage has been resolved or built.
    pub fn stage_id(&self) -> Option<StageId> {
        self.last_non_empty_stage()?
            .image()?
            .stage_description()
            .map(|desc| desc.stage_id)
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("name", &self.name)
            .field("is_artifact", &self.is_artifact)
            .field("is_dockerfile_image", &self.is_dockerfile_image)
            .field("stages", &self.stages.len())
            .finish()
    }
}
