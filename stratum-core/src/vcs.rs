//! Version control seam.

use crate::error::Result;
use async_trait::async_trait;

/// Narrow view of the local source repository. Used only to stamp built
/// images with the commit they were built from.
#[async_trait]
pub trait GitRepo: Send + Sync {
    /// Commit hash of the current HEAD.
    async fn head_commit(&self) -> Result<String>;
}
