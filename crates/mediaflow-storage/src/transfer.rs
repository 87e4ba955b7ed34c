//! Storage transfer collaborator.

use std::path::Path;

use async_trait::async_trait;

use crate::error::StorageResult;

/// Blocking copy between a locator and the local filesystem.
///
/// Both calls return once the transfer completed or failed.
#[async_trait]
pub trait StorageTransfer: Send + Sync {
    /// Fetch `src` (`s3://`, `gs://` or a local path) into `local`.
    async fn download(&self, src: &str, local: &Path) -> StorageResult<()>;

    /// Push `local` to `dest`.
    async fn upload(&self, local: &Path, dest: &str) -> StorageResult<()>;
}
