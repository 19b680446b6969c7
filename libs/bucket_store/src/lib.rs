//! A generic object store abstraction for components that keep their state in
//! a multi-tenant bucket.
//!
//! [`ObjectStore`] is a minimal CRUD-like trait over string-keyed blobs. The
//! only implementation shipped here is [`LocalFs`], which maps keys onto a
//! local directory tree: it backs tests and single-node deployments. Cloud
//! backends implement the same trait from the embedding binary.
#![deny(unsafe_code)]

mod local_fs;

use async_trait::async_trait;
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use tokio_util::sync::CancellationToken;

pub use local_fs::LocalFs;

/// Path of an object in the bucket, relative to the bucket root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RemotePath(Utf8PathBuf);

impl std::fmt::Display for RemotePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl RemotePath {
    pub fn new(relative_path: &Utf8Path) -> anyhow::Result<Self> {
        anyhow::ensure!(
            relative_path.is_relative(),
            "Path {relative_path:?} is not relative"
        );
        Ok(Self(relative_path.to_path_buf()))
    }

    pub fn from_string(relative_path: &str) -> anyhow::Result<Self> {
        Self::new(Utf8Path::new(relative_path))
    }

    pub fn with_base(&self, base_path: &Utf8Path) -> Utf8PathBuf {
        base_path.join(&self.0)
    }

    /// Last path segment, i.e. the object (or pseudo-directory) name itself.
    pub fn object_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    pub fn join(&self, path: impl AsRef<Utf8Path>) -> Self {
        Self(self.0.join(path))
    }

    pub fn get_path(&self) -> &Utf8PathBuf {
        &self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BucketError {
    /// The requested object does not exist.
    #[error("No such object")]
    NotFound,
    /// The operation was interrupted by the provided cancellation token. Never
    /// reported as a bucket failure by callers that retain state: the caller
    /// is going away.
    #[error("Operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BucketError {
    /// True if `err` is, or was caused by, a cancelled bucket operation.
    /// Walks the whole `anyhow` context chain, like the cancellation probes
    /// on download errors elsewhere in the stack.
    pub fn caused_by_cancel(err: &anyhow::Error) -> bool {
        err.chain()
            .any(|e| matches!(e.downcast_ref::<BucketError>(), Some(BucketError::Cancelled)))
    }
}

/// Storage (potentially remote) API to manage bucket contents.
/// The trait is unaware of any block/tenant semantics layered on top of it,
/// providing basic CRUD operations on opaque keys.
///
/// All operations observe the passed cancellation token at their I/O
/// boundaries and fail with [`BucketError::Cancelled`] once it fires.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// List the immediate children of a prefix, with semantics matching a
    /// delimited S3 ListObjectsV2: one entry per object or pseudo-directory
    /// directly under `prefix`. `None` lists the bucket root. A prefix with
    /// no children yields an empty listing, not an error.
    async fn iter(
        &self,
        prefix: Option<&RemotePath>,
        cancel: &CancellationToken,
    ) -> Result<Vec<RemotePath>, BucketError>;

    /// Check whether an object exists, without fetching it.
    async fn exists(
        &self,
        path: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<bool, BucketError>;

    /// Fetch the full contents of an object.
    async fn get(&self, path: &RemotePath, cancel: &CancellationToken)
        -> Result<Bytes, BucketError>;

    /// Store an object, replacing any previous contents atomically: a reader
    /// must observe either the old or the new blob, never a partial write.
    async fn upload(
        &self,
        path: &RemotePath,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<(), BucketError>;

    /// Delete an object. Deleting a missing object succeeds, so that retries
    /// after an ambiguous failure are safe.
    async fn delete(&self, path: &RemotePath, cancel: &CancellationToken)
        -> Result<(), BucketError>;
}
