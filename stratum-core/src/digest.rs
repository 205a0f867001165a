//! Stage digest computation.
//!
//! A stage digest is a SHA3-224 hash over the stage's declared inputs and its
//! predecessor's digest, so any upstream change invalidates all downstream
//! cache entries. Digests are content addresses into the stages storage and
//! must be byte-identical across independent builds on independent machines.

use sha3::{Digest, Sha3_224};
use tracing::debug;

/// Global build cache version. Bumping it invalidates every cached stage of
/// every project at once.
pub const BUILD_CACHE_VERSION: &str = "1.1";

/// Separator between hash arguments. Part of the digest wire contract.
const CHECKSUM_SEPARATOR: &str = ":::";

/// Predecessor inputs chained into a stage digest: the previous non-empty
/// stage's digest and its dependencies for the next stage.
#[derive(Debug, Clone, Copy)]
pub struct PrevStageInputs<'a> {
    pub digest: &'a str,
    pub next_stage_dependencies: &'a str,
}

/// Compute SHA3-224 over the given arguments joined with the checksum
/// separator, hex-encoded lowercase.
fn sha3_224_hash(args: &[&str]) -> String {
    let mut hasher = Sha3_224::new();
    hasher.update(args.join(CHECKSUM_SEPARATOR).as_bytes());
    hex::encode(hasher.finalize())
}

/// Compute the digest of a stage.
///
/// Hash inputs, in fixed order: the global build cache version, the stage
/// name, the stage's own dependency summary, and (when a previous non-empty
/// stage exists) that stage's digest followed by its next-stage dependencies.
///
/// `next_stage_dependencies` is queried on the predecessor rather than the
/// current stage: it models what the predecessor contributes to its
/// successor, e.g. files staged for copying forward.
pub fn stage_digest(
    stage_name: &str,
    stage_dependencies: &str,
    prev: Option<PrevStageInputs<'_>>,
) -> String {
    let mut args: Vec<&str> = vec![BUILD_CACHE_VERSION, stage_name, stage_dependencies];
    if let Some(prev) = prev {
        args.push(prev.digest);
        args.push(prev.next_stage_dependencies);
    }

    let digest = sha3_224_hash(&args);
    debug!(
        stage = stage_name,
        digest = %digest,
        "stage digest: cache_version={:?} dependencies={:?} prev={:?}",
        BUILD_CACHE_VERSION,
        stage_dependencies,
        prev.map(|p| p.digest),
    );
    digest
}

/// Stage name used for the content digest of `name`.
///
/// The content digest chains the stage's own digest and next-stage
/// dependencies under a derived name, giving a cross-reference hash distinct
/// from the stage digest itself.
pub fn content_stage_name(name: &str) -> String {
    format!("{}-content", name)
}
