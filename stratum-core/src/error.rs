//! Error types for the stratum build core.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for build core operations.
pub type Result<T> = std::result::Result<T, StratumError>;

/// Main error type for the build core.
#[derive(Error, Debug)]
pub enum StratumError {
    // Stage handling errors
    #[error("unable to fetch dependencies for stage {stage}: {reason}")]
    FetchDependencies { stage: String, reason: String },

    #[error("unable to calculate stage {stage} digest: {reason}")]
    Calculate { stage: String, reason: String },

    /// Cache miss under `should_be_built_mode`. The detailed diagnostic is
    /// logged before this error is returned.
    #[error("stages required")]
    StagesRequired,

    #[error("unable to fetch base image {base} for stage {stage}: {reason}")]
    BaseImageFetch { base: String, stage: String, reason: String },

    #[error("error preparing stage {stage}: {reason}")]
    Prepare { stage: String, reason: String },

    #[error("{stage} preRunHook failed: {reason}")]
    PreRunHook { stage: String, reason: String },

    #[error("failed to build image for stage {stage} with digest {digest}: {reason}")]
    Build { stage: String, digest: String, reason: String },

    // Locking errors
    #[error("unable to lock project {project} digest {digest}: {reason}")]
    Lock { project: String, digest: String, reason: String },

    // Storage errors
    #[error("unable to store stage {stage} image {image} into stages storage {storage}: {reason}")]
    Store {
        stage: String,
        image: String,
        storage: String,
        reason: String,
    },

    #[error("unable to get stage {stage} description from stages storage {storage}: {reason}")]
    StageDescription {
        stage: String,
        storage: String,
        reason: String,
    },

    #[error("invalid stage digest: {digest}")]
    InvalidDigest { digest: String },

    /// Generic stages storage backend failure.
    #[error("stages storage error: {reason}")]
    Storage { reason: String },

    /// Generic container backend failure.
    #[error("container backend error: {reason}")]
    Backend { reason: String },

    // Image metadata errors
    #[error("unable to add image {image} to the managed images of project {project}: {reason}")]
    ManagedImage {
        image: String,
        project: String,
        reason: String,
    },

    #[error("unable to process image {image} git metadata: {reason}")]
    ImageMetadata { image: String, reason: String },

    // Report errors
    #[error("unable to prepare report json: {0}")]
    ReportJson(#[source] serde_json::Error),

    #[error("unable to write report to {path:?}: {source}")]
    ReportWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StratumError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }
}
