//! Stratum build core.
//!
//! Build orchestration for a container-image build tool: turns a declarative
//! multi-image configuration into content-addressed, cached image layers in
//! a shared stages storage. For every stage of every image the build phase
//! computes a deterministic digest, reuses an equivalent pre-built layer when
//! one exists, and otherwise builds and publishes the layer atomically under
//! per-digest locks so concurrent builds never publish duplicates.

pub mod build;
pub mod conveyor;
pub mod digest;
pub mod error;
pub mod image;
pub mod runtime;
pub mod stage;
pub mod storage;
pub mod types;
pub mod vcs;

// Re-export commonly used items
pub use build::{
    run_phase, BuildPhase, BuildPhaseOptions, ImagesReport, IntrospectOptions, IntrospectTarget,
    Phase, ReportFormat, ReportImageRecord,
};
pub use conveyor::{Conveyor, ConveyorOptions};
pub use digest::BUILD_CACHE_VERSION;
pub use error::{Result, StratumError};
pub use image::{BuiltImageInfo, Image, ImageOptions, StageImage};
pub use runtime::{BuildOptions, ContainerBackend};
pub use stage::{Stage, StageDriver, StageKind, StagesIterator};
pub use storage::{
    FileLockManager, LocalStagesStorage, LockManager, StageLock, StagesStorage, StorageManager,
};
pub use types::{ImageInfo, StageDescription, StageId};
pub use vcs::GitRepo;
