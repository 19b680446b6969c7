//! Bucket-side discovery: which tenants exist, and what blocks each of them
//! has.

use std::collections::HashMap;
use std::time::SystemTime;

use anyhow::Context;
use bucket_store::{BucketError, ObjectStore, RemotePath};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use ulid::Ulid;

use crate::block::{block_deletion_mark_path, tenant_deletion_mark_path, DeletionMark};
use crate::cache::MetaCache;
use crate::index::TenantIndex;

/// List the tenants present in the bucket, excluding the ones carrying a
/// tenant deletion marker. Any listing or marker-existence error fails the
/// scan: a partial tenant set must not masquerade as the whole bucket.
pub(crate) async fn list_tenants(
    storage: &dyn ObjectStore,
    cancel: &CancellationToken,
) -> anyhow::Result<Vec<String>> {
    let children = storage
        .iter(None, cancel)
        .await
        .context("Failed to list tenants in the bucket")?;

    let mut tenants = Vec::with_capacity(children.len());
    for child in children {
        let Some(name) = child.object_name() else {
            continue;
        };
        let deleted = storage
            .exists(&tenant_deletion_mark_path(&child), cancel)
            .await
            .with_context(|| format!("Failed to check the deletion marker of tenant {name}"))?;
        if deleted {
            debug!("Tenant {name} is marked for deletion, skipping");
            continue;
        }
        tenants.push(name.to_string());
    }
    Ok(tenants)
}

/// Scan one tenant: discover its block ids, fetch each block's metadata
/// (through the cache) and deletion mark, and assemble a fresh index.
///
/// Fetches run concurrently, bounded by `metas_concurrency`. The first
/// failure wins: it is returned, and dropping the fetch stream cancels the
/// in-flight siblings at their next I/O boundary.
pub(crate) async fn scan_tenant(
    storage: &dyn ObjectStore,
    cache: &MetaCache,
    tenant: &str,
    previous: Option<&TenantIndex>,
    metas_concurrency: usize,
    cancel: &CancellationToken,
) -> anyhow::Result<TenantIndex> {
    let tenant_prefix = RemotePath::from_string(tenant)?;
    let children = storage
        .iter(Some(&tenant_prefix), cancel)
        .await
        .with_context(|| format!("Failed to list blocks of tenant {tenant}"))?;

    let mut block_ids = Vec::with_capacity(children.len());
    for child in children {
        let Some(name) = child.object_name() else {
            continue;
        };
        match name.parse::<Ulid>() {
            Ok(id) => block_ids.push(id),
            // Tenant-level objects (e.g. the tenant deletion marker) live
            // next to the block directories; whatever is not a ULID is not a
            // block.
            Err(_) => debug!("Skipping non-block entry {child} of tenant {tenant}"),
        }
    }

    let now = SystemTime::now();
    let tenant_prefix = &tenant_prefix;
    let mut fetches = futures::stream::iter(block_ids.into_iter().map(|id| async move {
        let (meta, _cache_hit) = cache
            .get_or_fetch(storage, tenant_prefix, tenant, id, cancel)
            .await?;
        let mark = fetch_deletion_mark(storage, tenant_prefix, id, cancel).await?;
        anyhow::Ok((meta, mark))
    }))
    .buffer_unordered(metas_concurrency);

    let mut blocks = Vec::new();
    let mut marks = HashMap::new();
    while let Some(fetched) = fetches.next().await {
        let (mut meta, mark) = fetched?;
        // First-observation time survives across scans; only genuinely new
        // blocks get stamped with the current wall clock.
        meta.uploaded_at = previous
            .and_then(|prev| prev.block(meta.id))
            .map(|prev_block| prev_block.uploaded_at)
            .unwrap_or(now);
        if let Some(mark) = mark {
            marks.insert(meta.id, mark);
        }
        blocks.push(meta);
    }
    Ok(TenantIndex::new(blocks, marks))
}

async fn fetch_deletion_mark(
    storage: &dyn ObjectStore,
    tenant_prefix: &RemotePath,
    block_id: Ulid,
    cancel: &CancellationToken,
) -> anyhow::Result<Option<DeletionMark>> {
    let mark_path = block_deletion_mark_path(tenant_prefix, block_id);
    let exists = storage
        .exists(&mark_path, cancel)
        .await
        .with_context(|| format!("Failed to check the deletion mark of block {block_id}"))?;
    if !exists {
        return Ok(None);
    }
    match storage.get(&mark_path, cancel).await {
        Ok(bytes) => Ok(Some(
            DeletionMark::from_slice(&bytes)
                .with_context(|| format!("Block {block_id} deletion mark"))?,
        )),
        // Deleted between the existence check and the fetch: same as absent.
        Err(BucketError::NotFound) => Ok(None),
        Err(e) => Err(anyhow::Error::new(e)
            .context(format!("Failed to fetch the deletion mark of block {block_id}"))),
    }
}
