//! On-disk cache of block metadata blobs.
//!
//! Block metadata is immutable, so a blob fetched once never has to be
//! fetched again: repeat scans (and scans after a process restart) are served
//! from disk. The layout is one subdirectory per tenant with one file per
//! block, named by the block id and holding the verbatim `meta.json` bytes.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;

use anyhow::Context;
use bucket_store::{ObjectStore, RemotePath};
use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use ulid::Ulid;

use crate::block::{block_meta_path, BlockMeta};

const TEMP_FILE_SUFFIX: &str = "tmp";

/// Cache survivors of one completed scan, used by [`MetaCache::gc`]: tenants
/// mapped to `Some(ids)` finished a scan and only those ids are live; tenants
/// mapped to `None` failed their scan this round and are left untouched;
/// tenants absent from the map left the bucket and their cache goes away.
pub(crate) type GcPlan = HashMap<String, Option<HashSet<Ulid>>>;

#[derive(Debug)]
pub struct MetaCache {
    cache_root: Utf8PathBuf,
}

impl MetaCache {
    pub fn new(cache_root: Utf8PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&cache_root)
            .with_context(|| format!("Failed to create metadata cache directory {cache_root:?}"))?;
        Ok(Self { cache_root })
    }

    fn tenant_dir(&self, tenant: &str) -> Utf8PathBuf {
        self.cache_root.join(tenant)
    }

    fn block_file(&self, tenant: &str, block_id: Ulid) -> Utf8PathBuf {
        self.tenant_dir(tenant).join(block_id.to_string())
    }

    /// Returns the metadata of one block and whether it was served from the
    /// cache. A readable, parseable cache file short-circuits the bucket
    /// entirely; anything else falls through to a bucket fetch whose bytes
    /// are committed to the cache (atomically) before returning.
    pub async fn get_or_fetch(
        &self,
        storage: &dyn ObjectStore,
        tenant_prefix: &RemotePath,
        tenant: &str,
        block_id: Ulid,
        cancel: &CancellationToken,
    ) -> anyhow::Result<(BlockMeta, bool)> {
        let cache_file = self.block_file(tenant, block_id);
        match tokio::fs::read(&cache_file).await {
            Ok(bytes) => match BlockMeta::from_slice(&bytes) {
                Ok(meta) => return Ok((meta, true)),
                // A corrupt entry (e.g. torn by an unclean shutdown predating
                // this cache's atomic writes) is overwritten by the refetch.
                Err(e) => warn!(
                    "Corrupt cached metadata of block {block_id} of tenant {tenant}, refetching: {e:#}"
                ),
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to read cached metadata of block {block_id} of tenant {tenant}, refetching: {e}"
            ),
        }

        let bytes = storage
            .get(&block_meta_path(tenant_prefix, block_id), cancel)
            .await
            .with_context(|| format!("Failed to fetch metadata of block {block_id}"))?;
        let meta = BlockMeta::from_slice(&bytes)
            .with_context(|| format!("Block {block_id} of tenant {tenant}"))?;
        self.write_atomic(&cache_file, &bytes)
            .await
            .with_context(|| format!("Failed to cache metadata of block {block_id}"))?;
        Ok((meta, false))
    }

    /// Tempfile-then-rename, with the file and its directory fsynced: a crash
    /// mid-write must never leave a half-written file under the final name.
    async fn write_atomic(&self, target: &Utf8Path, bytes: &[u8]) -> anyhow::Result<()> {
        let dir = target
            .parent()
            .with_context(|| format!("Cache file {target:?} has no parent directory"))?;
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create cache directory {dir:?}"))?;

        let temp_path = Utf8PathBuf::from(format!("{target}.{TEMP_FILE_SUFFIX}"));
        let mut temp_file = tokio::fs::File::create(&temp_path)
            .await
            .with_context(|| format!("Failed to create temp cache file {temp_path:?}"))?;
        temp_file
            .write_all(bytes)
            .await
            .with_context(|| format!("Failed to write temp cache file {temp_path:?}"))?;
        temp_file
            .sync_all()
            .await
            .with_context(|| format!("Failed to fsync temp cache file {temp_path:?}"))?;
        drop(temp_file);
        tokio::fs::rename(&temp_path, target)
            .await
            .with_context(|| format!("Failed to rename temp cache file into {target:?}"))?;
        tokio::fs::File::open(dir)
            .await?
            .sync_all()
            .await
            .with_context(|| format!("Failed to fsync cache directory {dir:?}"))?;
        Ok(())
    }

    /// Lazy garbage collection, run at the end of each scan. Only removes
    /// entries; every error is logged and swallowed, the next scan retries.
    pub(crate) async fn gc(&self, plan: &GcPlan) {
        let mut tenant_dirs = match tokio::fs::read_dir(&self.cache_root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to list metadata cache root {:?}: {e}", self.cache_root);
                return;
            }
        };
        loop {
            let entry = match tenant_dirs.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to list metadata cache root {:?}: {e}", self.cache_root);
                    return;
                }
            };
            let name = entry.file_name();
            let Some(tenant) = name.to_str() else {
                continue;
            };
            match plan.get(tenant) {
                // The tenant left the bucket (or got a deletion marker).
                None => {
                    let dir = self.tenant_dir(tenant);
                    if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                        warn!("Failed to remove cache of deleted tenant {tenant}: {e}");
                    }
                }
                // Scan failed this round: keep everything, GC next time.
                Some(None) => {}
                Some(Some(live)) => self.gc_tenant(tenant, live).await,
            }
        }
    }

    async fn gc_tenant(&self, tenant: &str, live: &HashSet<Ulid>) {
        let dir = self.tenant_dir(tenant);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return,
            Err(e) => {
                warn!("Failed to list cache directory of tenant {tenant}: {e}");
                return;
            }
        };
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to list cache directory of tenant {tenant}: {e}");
                    return;
                }
            };
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // Entries that are not ULIDs are stale temp files or junk; those
            // go away together with the blocks the bucket no longer has.
            let keep = name
                .parse::<Ulid>()
                .map(|id| live.contains(&id))
                .unwrap_or(false);
            if !keep {
                let path = dir.join(name);
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!("Failed to remove stale cache file {path:?}: {e}");
                }
            }
        }
    }
}
