//! Container backend seam.
//!
//! The core never talks to a container runtime directly: it prepares stage
//! images and hands them to a [`ContainerBackend`], which executes the build,
//! commits the layer, and reports the resulting image id. Backends must be
//! safe for concurrent use from multiple tasks.

pub mod retry;

pub use retry::{is_retryable_message, pull_retry, push_retry, with_retry, RetryConfig};

use crate::error::Result;
use crate::image::{BuiltImageInfo, StageImage};
use async_trait::async_trait;

/// Options threaded into every stage image build.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Drop into the build container when the build fails.
    pub introspect_before_error: bool,
    /// Drop into the committed image when the build fails.
    pub introspect_after_error: bool,
}

/// Environment variable consulted by dockerfile stage builds; BuildKit is
/// off unless it is set to a truthy value.
pub const DOCKER_BUILDKIT_ENV: &str = "DOCKER_BUILDKIT";

/// Whether dockerfile builds should go through BuildKit.
pub fn buildkit_enabled() -> bool {
    matches!(
        std::env::var(DOCKER_BUILDKIT_ENV).as_deref(),
        Ok("1") | Ok("true")
    )
}

/// Driver for the concrete container runtime.
///
/// `build_stage_image` runs the prepared instructions in a container and
/// commits it; implementations own their layer lifecycle, including
/// reclaiming layers discarded after a lost publish race. Pull and push
/// paths are expected to wrap their I/O with [`with_retry`] and the
/// [`pull_retry`]/[`push_retry`] policies.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Execute the stage's build and return the committed layer's identity.
    async fn build_stage_image(
        &self,
        image: &StageImage,
        opts: &BuildOptions,
    ) -> Result<BuiltImageInfo>;

    /// Pull a declared base image so a "from" stage can layer on it.
    async fn fetch_base_image(&self, name: &str) -> Result<()>;

    /// Make a stored stage layer locally available.
    async fn fetch_stage_image(&self, name: &str) -> Result<()>;

    /// Open an interactive shell in the stage image, for introspection.
    async fn introspect_stage_image(&self, _image: &StageImage) -> Result<()> {
        Ok(())
    }

    /// Ensure the service tooling container backing non-dockerfile builds
    /// exists. Invoked once per built stage; must be idempotent.
    async fn get_or_create_service_container(&self) -> Result<()> {
        Ok(())
    }
}
