//! Shared value types of the build core.

pub mod image;

pub use image::{
    parse_repository_and_tag, truncate_id, ImageInfo, StageDescription, StageId,
    CACHE_VERSION_LABEL, IMAGE_LABEL, IMAGE_NAME_LABEL, PROJECT_LABEL, STAGE_CONTENT_DIGEST_LABEL,
    STAGE_DIGEST_LABEL, TOOL_VERSION, VERSION_LABEL,
};
