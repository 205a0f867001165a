//! Persisted stage image metadata and service label names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Version of the running tool, applied as a service label to every built
/// stage.
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

// Service label names applied to every built stage image. These are stable
// wire identifiers shared with every other tool reading the stages storage;
// do not rename.
pub const PROJECT_LABEL: &str = "werf";
pub const VERSION_LABEL: &str = "werf-version";
pub const CACHE_VERSION_LABEL: &str = "werf-cache-version";
pub const IMAGE_LABEL: &str = "werf-image";
pub const STAGE_DIGEST_LABEL: &str = "werf-stage-digest";
pub const STAGE_CONTENT_DIGEST_LABEL: &str = "werf-stage-content-digest";
pub const IMAGE_NAME_LABEL: &str = "werf-docker-image-name";

/// Identity of a stored stage: its content digest plus a unique suffix
/// disambiguating colliding entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageId {
    pub digest: String,
    pub unique_id: u64,
}

impl StageId {
    pub fn new(digest: impl Into<String>, unique_id: u64) -> Self {
        Self { digest: digest.into(), unique_id }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.digest, self.unique_id)
    }
}

/// Image info as read back from the stages storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Full image name (`repo:tag`).
    pub name: String,
    pub repository: String,
    pub tag: String,
    /// Content-addressed image id (`sha256:...`).
    pub id: String,
    /// Image id of the parent layer, empty for base stages.
    #[serde(default)]
    pub parent_id: String,
    /// Layer size in bytes.
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// The persisted metadata of a stored stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDescription {
    pub stage_id: StageId,
    pub info: ImageInfo,
}

/// Split a full image name into repository and tag. Names without a tag get
/// `latest`.
pub fn parse_repository_and_tag(name: &str) -> (String, String) {
    // The tag separator is the last ':' after the final path component, so
    // registry ports ("host:5000/repo") are not mistaken for tags.
    let split_at = name.rfind(':').filter(|pos| !name[*pos..].contains('/'));
    match split_at {
        Some(pos) => (name[..pos].to_string(), name[pos + 1..].to_string()),
        None => (name.to_string(), "latest".to_string()),
    }
}

/// Shorten an image id for display: strip the algorithm prefix and keep the
/// leading 12 characters.
pub fn truncate_id(id: &str) -> &str {
    let id = id.strip_prefix("sha256:").unwrap_or(id);
    &id[..12.min(id.len())]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_id_display() {
        let id = StageId::new("abcdef", 1589714365467);
        assert_eq!(id.to_string(), "abcdef-1589714365467");
    }

    #[test]
    fn test_parse_repository_and_tag() {
        assert_eq!(
            parse_repository_and_tag("myproject-stages:abc-123"),
            ("myproject-stages".to_string(), "abc-123".to_string())
        );
        assert_eq!(
            parse_repository_and_tag("ubuntu"),
            ("ubuntu".to_string(), "latest".to_string())
        );
        assert_eq!(
            parse_repository_and_tag("registry:5000/app"),
            ("registry:5000/app".to_string(), "latest".to_string())
        );
    }

    #[test]
    fn test_truncate_id() {
        assert_eq!(truncate_id("sha256:0123456789abcdef0123"), "0123456789ab");
        assert_eq!(truncate_id("short"), "short");
    }

    #[test]
    fn test_stage_description_round_trips_through_json() {
        let desc = StageDescription {
            stage_id: StageId::new("aa11", 7),
            info: ImageInfo {
                name: "p-stages:aa11-7".to_string(),
                repository: "p-stages".to_string(),
                tag: "aa11-7".to_string(),
                id: "sha256:deadbeef".to_string(),
                parent_id: String::new(),
                size: 1024,
                created_at: Utc::now(),
            },
        };

        let json = serde_json::to_string(&desc).unwrap();
        let back: StageDescription = serde_json::from_str(&json).unwrap();
        assert_eq!(back.stage_id, desc.stage_id);
        assert_eq!(back.info.name, desc.info.name);
        assert_eq!(back.info.size, desc.info.size);
    }
}
