//! Filesystem-backed stages storage.
//!
//! Reference backend storing stage descriptions as JSON files under a shared
//! root, suitable for single-host setups and tests:
//!
//! ```text
//! <root>/<project>/stages/<digest>/<unique_id>.json
//! <root>/<project>/managed_images/<hex(image_name)>
//! <root>/<project>/metadata/<hex(image_name)>/<commit>-<stage_id>
//! ```
//!
//! Image names are hex-encoded in paths because they may contain path
//! separators.

use crate::error::{Result, StratumError};
use crate::image::StageImage;
use crate::storage::StagesStorage;
use crate::types::{parse_repository_and_tag, ImageInfo, StageDescription, StageId};
use async_trait::async_trait;
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};

/// Stages storage over a local directory.
#[derive(Debug)]
pub struct LocalStagesStorage {
    root: PathBuf,
}

impl LocalStagesStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn stages_dir(&self, project: &str, digest: &str) -> PathBuf {
        self.root.join(project).join("stages").join(digest)
    }

    fn managed_image_path(&self, project: &str, image_name: &str) -> PathBuf {
        self.root.join(project).join("managed_images").join(hex::encode(image_name))
    }

    fn metadata_path(
        &self,
        project: &str,
        image_name: &str,
        commit: &str,
        stage_id: &StageId,
    ) -> PathBuf {
        self.root
            .join(project)
            .join("metadata")
            .join(hex::encode(image_name))
            .join(format!("{}-{}", commit, stage_id))
    }

    fn io_err(path: &Path, source: std::io::Error) -> StratumError {
        StratumError::Io { path: path.to_path_buf(), source }
    }

    /// Derive `(digest, unique_id)` from a final storage name
    /// (`<project>-stages:<digest>-<uniqueId>`).
    fn parse_stage_name(name: &str) -> Result<StageId> {
        let (_, tag) = parse_repository_and_tag(name);
        let (digest, unique_id) = tag.rsplit_once('-').ok_or_else(|| {
            StratumError::Storage { reason: format!("malformed stage image name {:?}", name) }
        })?;

        if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StratumError::InvalidDigest { digest: digest.to_string() });
        }

        let unique_id = unique_id.parse::<u64>().map_err(|_| StratumError::Storage {
            reason: format!("malformed stage unique id in image name {:?}", name),
        })?;

        Ok(StageId::new(digest, unique_id))
    }
}

#[async_trait]
impl StagesStorage for LocalStagesStorage {
    async fn get_stages_by_digest(
        &self,
        project: &str,
        digest: &str,
    ) -> Result<Vec<StageDescription>> {
        let dir = self.stages_dir(project, digest);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut descriptions = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| Self::io_err(&dir, e))? {
            let entry = entry.map_err(|e| Self::io_err(&dir, e))?;
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                let data = fs::read_to_string(&path).map_err(|e| Self::io_err(&path, e))?;
                descriptions.push(serde_json::from_str(&data)?);
            }
        }

        Ok(descriptions)
    }

    async fn store_image(&self, project: &str, image: &StageImage) -> Result<()> {
        let name = image.name();
        let stage_id = Self::parse_stage_name(&name)?;

        let built = image.built_info().ok_or_else(|| StratumError::Storage {
            reason: format!("stage image {:?} has not been built", name),
        })?;

        let (repository, tag) = parse_repository_and_tag(&name);
        let parent_id =
            image.parent().and_then(|p| p.image_id()).unwrap_or_default();

        let description = StageDescription {
            stage_id: stage_id.clone(),
            info: ImageInfo {
                name,
                repository,
                tag,
                id: built.id,
                parent_id,
                size: built.size,
                created_at: Utc::now(),
            },
        };

        let dir = self.stages_dir(project, &stage_id.digest);
        fs::create_dir_all(&dir).map_err(|e| Self::io_err(&dir, e))?;

        // Write-then-rename so a crash mid-store never leaves a partial
        // description visible as a cache entry.
        let final_path = dir.join(format!("{}.json", stage_id.unique_id));
        let tmp_path = dir.join(format!("{}.json.tmp", stage_id.unique_id));
        fs::write(&tmp_path, serde_json::to_vec(&description)?)
            .map_err(|e| Self::io_err(&tmp_path, e))?;
        fs::rename(&tmp_path, &final_path).map_err(|e| Self::io_err(&final_path, e))?;

        Ok(())
    }

    async fn get_stage_description(
        &self,
        project: &str,
        digest: &str,
        unique_id: u64,
    ) -> Result<Option<StageDescription>> {
        let path = self.stages_dir(project, digest).join(format!("{}.json", unique_id));
        if !path.exists() {
            return Ok(None);
        }

        let data = fs::read_to_string(&path).map_err(|e| Self::io_err(&path, e))?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    async fn add_managed_image(&self, project: &str, image_name: &str) -> Result<()> {
        let path = self.managed_image_path(project, image_name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Self::io_err(parent, e))?;
        }
        if !path.exists() {
            fs::write(&path, image_name).map_err(|e| Self::io_err(&path, e))?;
        }
        Ok(())
    }

    async fn is_image_metadata_exist(
        &self,
        project: &str,
        image_name: &str,
        commit: &str,
        stage_id: &StageId,
    ) -> Result<bool> {
        Ok(self.metadata_path(project, image_name, commit, stage_id).exists())
    }

    async fn put_image_metadata(
        &self,
        project: &str,
        image_name: &str,
        commit: &str,
        stage_id: &StageId,
    ) -> Result<()> {
        let path = self.metadata_path(project, image_name, commit, stage_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Self::io_err(parent, e))?;
        }
        fs::write(&path, b"").map_err(|e| Self::io_err(&path, e))?;
        Ok(())
    }

    fn address(&self) -> String {
        format!("local[{}]", self.root.display())
    }
}
