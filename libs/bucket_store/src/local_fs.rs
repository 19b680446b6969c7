//! Local filesystem backend: keys are mapped onto files under a root
//! directory, pseudo-directories onto real ones.

use std::io::ErrorKind;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{BucketError, ObjectStore, RemotePath};

const TEMP_UPLOAD_SUFFIX: &str = "___temp";

#[derive(Debug, Clone)]
pub struct LocalFs {
    storage_root: Utf8PathBuf,
}

impl LocalFs {
    /// Attempts to create local FS storage, along with its root directory.
    pub fn new(storage_root: Utf8PathBuf) -> anyhow::Result<Self> {
        if !storage_root.exists() {
            std::fs::create_dir_all(&storage_root)
                .with_context(|| format!("Failed to create root directory {storage_root:?}"))?;
        }
        Ok(Self { storage_root })
    }

    fn resolve(&self, path: &RemotePath) -> Utf8PathBuf {
        path.with_base(&self.storage_root)
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<(), BucketError> {
    if cancel.is_cancelled() {
        return Err(BucketError::Cancelled);
    }
    Ok(())
}

async fn fsync_path(path: &Utf8Path) -> std::io::Result<()> {
    tokio::fs::File::open(path).await?.sync_all().await
}

#[async_trait]
impl ObjectStore for LocalFs {
    async fn iter(
        &self,
        prefix: Option<&RemotePath>,
        cancel: &CancellationToken,
    ) -> Result<Vec<RemotePath>, BucketError> {
        ensure_not_cancelled(cancel)?;

        let dir = match prefix {
            Some(prefix) => self.resolve(prefix),
            None => self.storage_root.clone(),
        };
        let mut dir_entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            // An empty prefix is not an error in the bucket model.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to list directory {dir:?}"))
                    .into())
            }
        };

        let mut children = Vec::new();
        loop {
            ensure_not_cancelled(cancel)?;
            let entry = dir_entries
                .next_entry()
                .await
                .with_context(|| format!("Failed to list directory {dir:?}"))?;
            let Some(entry) = entry else { break };
            let name = entry.file_name();
            let name = name
                .to_str()
                .with_context(|| format!("Non-utf8 entry under {dir:?}"))?;
            // Skip in-flight uploads: they are not objects yet.
            if name.ends_with(TEMP_UPLOAD_SUFFIX) {
                continue;
            }
            children.push(match prefix {
                Some(prefix) => prefix.join(name),
                None => RemotePath::from_string(name)?,
            });
        }
        Ok(children)
    }

    async fn exists(
        &self,
        path: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<bool, BucketError> {
        ensure_not_cancelled(cancel)?;
        match tokio::fs::metadata(self.resolve(path)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("Failed to stat object {path}"))
                .into()),
        }
    }

    async fn get(
        &self,
        path: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<Bytes, BucketError> {
        ensure_not_cancelled(cancel)?;
        let file_path = self.resolve(path);
        match tokio::fs::read(&file_path).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(BucketError::NotFound),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("Failed to read object {path}"))
                .into()),
        }
    }

    async fn upload(
        &self,
        path: &RemotePath,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<(), BucketError> {
        ensure_not_cancelled(cancel)?;
        let target = self.resolve(path);
        let parent = target
            .parent()
            .with_context(|| format!("Object {path} has no parent directory"))?
            .to_path_buf();
        tokio::fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("Failed to create directories for object {path}"))?;

        // Write into a temporary sibling first, so that a crashed upload is
        // never visible as a (truncated) object.
        let temp_path = Utf8PathBuf::from(format!("{target}.{TEMP_UPLOAD_SUFFIX}"));
        let result = async {
            tokio::fs::write(&temp_path, &data)
                .await
                .with_context(|| format!("Failed to write object {path}"))?;
            fsync_path(&temp_path)
                .await
                .with_context(|| format!("Failed to fsync object {path}"))?;
            tokio::fs::rename(&temp_path, &target)
                .await
                .with_context(|| format!("Failed to commit object {path}"))?;
            fsync_path(&parent)
                .await
                .with_context(|| format!("Failed to fsync directory of object {path}"))?;
            anyhow::Ok(())
        }
        .await;

        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(&temp_path).await {
                if e.kind() != ErrorKind::NotFound {
                    debug!("Failed to remove temp upload file {temp_path:?}: {e}");
                }
            }
        }
        result.map_err(BucketError::Other)
    }

    async fn delete(
        &self,
        path: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<(), BucketError> {
        ensure_not_cancelled(cancel)?;
        match tokio::fs::remove_file(self.resolve(path)).await {
            Ok(()) => Ok(()),
            // Idempotent: deleting a missing object is a no-op.
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("Failed to delete object {path}"))
                .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn test_storage() -> (camino_tempfile::Utf8TempDir, LocalFs) {
        let dir = camino_tempfile::tempdir().unwrap();
        let storage = LocalFs::new(dir.path().to_path_buf()).unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn upload_get_roundtrip() -> anyhow::Result<()> {
        let (_dir, storage) = test_storage();
        let cancel = CancellationToken::new();

        let path = RemotePath::from_string("tenant-1/object")?;
        let body = Bytes::from_static(b"remote blob data here");
        storage.upload(&path, body.clone(), &cancel).await?;

        assert!(storage.exists(&path, &cancel).await?);
        assert_eq!(storage.get(&path, &cancel).await?, body);

        let missing = RemotePath::from_string("tenant-1/nothing-there")?;
        assert!(!storage.exists(&missing, &cancel).await?);
        assert!(matches!(
            storage.get(&missing, &cancel).await,
            Err(BucketError::NotFound)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn iter_lists_immediate_children() -> anyhow::Result<()> {
        let (_dir, storage) = test_storage();
        let cancel = CancellationToken::new();

        for key in ["a/1", "a/2", "b/nested/deep", "top"] {
            storage
                .upload(
                    &RemotePath::from_string(key)?,
                    Bytes::from_static(b"x"),
                    &cancel,
                )
                .await?;
        }

        let root: HashSet<_> = storage
            .iter(None, &cancel)
            .await?
            .into_iter()
            .map(|p| p.to_string())
            .collect();
        assert_eq!(
            root,
            HashSet::from(["a".to_string(), "b".to_string(), "top".to_string()])
        );

        let under_a: HashSet<_> = storage
            .iter(Some(&RemotePath::from_string("a")?), &cancel)
            .await?
            .into_iter()
            .map(|p| p.to_string())
            .collect();
        assert_eq!(under_a, HashSet::from(["a/1".to_string(), "a/2".to_string()]));

        let empty = storage
            .iter(Some(&RemotePath::from_string("no/such/prefix")?), &cancel)
            .await?;
        assert!(empty.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn delete_missing_object_succeeds() -> anyhow::Result<()> {
        let (_dir, storage) = test_storage();
        let cancel = CancellationToken::new();

        let path = RemotePath::from_string("gone")?;
        storage.delete(&path, &cancel).await?;

        storage
            .upload(&path, Bytes::from_static(b"x"), &cancel)
            .await?;
        storage.delete(&path, &cancel).await?;
        assert!(!storage.exists(&path, &cancel).await?);
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_token_fails_operations() -> anyhow::Result<()> {
        let (_dir, storage) = test_storage();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let path = RemotePath::from_string("object")?;
        assert!(matches!(
            storage.get(&path, &cancel).await,
            Err(BucketError::Cancelled)
        ));
        assert!(matches!(
            storage.iter(None, &cancel).await,
            Err(BucketError::Cancelled)
        ));
        Ok(())
    }
}
