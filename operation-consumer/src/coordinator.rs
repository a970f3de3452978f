use async_trait::async_trait;

use crate::error::CommitError;
use crate::types::ProgressRecord;

/// The consumer-group side the core talks to: it persists watermarks.
///
/// Partition assignment, membership and retries of failed commits all live
/// behind this seam.
#[async_trait]
pub trait GroupCoordinator: Send + Sync {
    /// Durably persist `progress`. Resolves once the offset store acknowledged it.
    async fn commit_offset(&self, progress: ProgressRecord) -> Result<(), CommitError>;
}
