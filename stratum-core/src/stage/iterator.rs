//! Stage iteration within one image.
//!
//! The iterator walks an image's stages in dependency order and tracks three
//! pointers across calls: the previous stage, the previous non-empty stage,
//! and the previous built stage. Successor stages chain their digests off the
//! previous non-empty stage and mount their filesystems off the previous
//! built stage; the build phase relies on both being materialized before a
//! successor runs.

use crate::conveyor::Conveyor;
use crate::error::Result;
use crate::image::{Image, StageImage};
use crate::stage::Stage;
use async_trait::async_trait;
use std::sync::Arc;

/// Callback invoked by the iterator for every stage of an image.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn handle_image_stage(
        &self,
        iterator: &StagesIterator,
        img: &Image,
        stage: Arc<Stage>,
        is_empty: bool,
    ) -> Result<()>;
}

/// Per-image stage walk state. One iterator instance per image per phase.
#[derive(Default)]
pub struct StagesIterator {
    pub prev_stage: Option<Arc<Stage>>,
    pub prev_non_empty_stage: Option<Arc<Stage>>,
    pub prev_built_stage: Option<Arc<Stage>>,
}

impl StagesIterator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Image the current stage is layered on: the image's base image for
    /// "from" stages, otherwise the previous stage's image.
    pub fn get_prev_image(&self, img: &Image, stage: &Stage) -> Option<Arc<StageImage>> {
        if stage.name() == "from" {
            img.base_image()
        } else {
            self.prev_stage.as_ref().and_then(|s| s.image())
        }
    }

    /// Like [`get_prev_image`](Self::get_prev_image) but resolving through
    /// the previous *built* stage.
    pub fn get_prev_built_image(&self, img: &Image, stage: &Stage) -> Option<Arc<StageImage>> {
        if stage.name() == "from" {
            img.base_image()
        } else {
            self.prev_built_stage.as_ref().and_then(|s| s.image())
        }
    }

    /// Run the handler for one stage, then roll the iterator pointers.
    ///
    /// After the handler returns, a non-empty stage becomes the new previous
    /// non-empty stage, and additionally the new previous built stage once
    /// its image carries a stage description (cache hit or fresh publish).
    pub async fn on_image_stage(
        &mut self,
        conveyor: &Conveyor,
        img: &Image,
        stage: Arc<Stage>,
        handler: &dyn StageHandler,
    ) -> Result<()> {
        let prev_built_image = self.get_prev_built_image(img, &stage);
        let is_empty = stage.is_empty(conveyor, prev_built_image).await?;

        handler.handle_image_stage(&*self, img, Arc::clone(&stage), is_empty).await?;

        self.prev_stage = Some(Arc::clone(&stage));
        if !is_empty {
            self.prev_non_empty_stage = Some(Arc::clone(&stage));
            if stage.image().map(|i| i.stage_description().is_some()).unwrap_or(false) {
                self.prev_built_stage = Some(stage);
            }
        }

        Ok(())
    }
}
