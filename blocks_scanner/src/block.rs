//! Block metadata and deletion-mark blobs, plus the key layout under which
//! they live in the bucket.
//!
//! Bucket layout, per tenant:
//!
//! ```text
//! <tenant>/tenant-deletion-mark.json     tenant is being deleted
//! <tenant>/<block ulid>/meta.json        block metadata
//! <tenant>/<block ulid>/deletion-mark.json
//! ```
//!
//! The blobs are JSON written by the compactor/ingester side; the scanner only
//! ever reads them. Metadata blobs may carry fields this scanner does not
//! interpret, so they are cached as verbatim bytes and never re-serialized.

use std::time::SystemTime;

use anyhow::Context;
use bucket_store::RemotePath;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub const BLOCK_META_FILE: &str = "meta.json";
pub const BLOCK_DELETION_MARK_FILE: &str = "deletion-mark.json";
pub const TENANT_DELETION_MARK_FILE: &str = "tenant-deletion-mark.json";

/// The only deletion-mark format version this scanner understands.
pub const DELETION_MARK_VERSION: u64 = 1;

/// Descriptor of one immutable block, as observed in the bucket.
///
/// `min_time`/`max_time` bound the covered data as a half-open
/// `[min_time, max_time)` interval of millisecond timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub version: u64,
    #[serde(rename = "ulid")]
    pub id: Ulid,
    #[serde(rename = "minTime")]
    pub min_time: i64,
    #[serde(rename = "maxTime")]
    pub max_time: i64,
    #[serde(default)]
    pub compaction: BlockCompaction,
    /// Wall-clock time at which this scanner first observed the block. Not
    /// part of the blob: set on first observation and carried forward across
    /// scans, so that it stays stable for the block's lifetime.
    #[serde(skip, default = "unix_epoch")]
    pub uploaded_at: SystemTime,
}

fn unix_epoch() -> SystemTime {
    SystemTime::UNIX_EPOCH
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCompaction {
    #[serde(default)]
    pub level: u64,
    #[serde(default)]
    pub sources: Vec<Ulid>,
}

impl BlockMeta {
    pub fn from_slice(bytes: &[u8]) -> anyhow::Result<Self> {
        let meta: BlockMeta =
            serde_json::from_slice(bytes).context("Malformed block metadata")?;
        anyhow::ensure!(
            meta.min_time < meta.max_time,
            "Block {} has an empty time range: minTime {} >= maxTime {}",
            meta.id,
            meta.min_time,
            meta.max_time
        );
        Ok(meta)
    }

    /// Overlap of this block's half-open `[min_time, max_time)` interval with
    /// the closed query window `[min_t, max_t]`. A block ending exactly at
    /// `min_t` holds no sample inside the window; a block starting exactly at
    /// `max_t` does.
    pub fn overlaps(&self, min_t: i64, max_t: i64) -> bool {
        self.min_time <= max_t && self.max_time > min_t
    }
}

/// Presence of a mark means the block is scheduled for deletion. The scanner
/// reports every mark it sees; whether a marked block is still visible to
/// queries (the `IgnoreDeletionMarksDelay` grace period) is the consumer's
/// decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionMark {
    pub id: Ulid,
    /// Unix seconds at which the mark was written.
    pub deletion_time: i64,
    pub version: u64,
}

impl DeletionMark {
    pub fn from_slice(bytes: &[u8]) -> anyhow::Result<Self> {
        let mark: DeletionMark =
            serde_json::from_slice(bytes).context("Malformed deletion mark")?;
        anyhow::ensure!(
            mark.version == DELETION_MARK_VERSION,
            "Unsupported deletion mark version {} for block {}",
            mark.version,
            mark.id
        );
        Ok(mark)
    }
}

pub fn tenant_deletion_mark_path(tenant_prefix: &RemotePath) -> RemotePath {
    tenant_prefix.join(TENANT_DELETION_MARK_FILE)
}

pub fn block_meta_path(tenant_prefix: &RemotePath, block_id: Ulid) -> RemotePath {
    tenant_prefix.join(block_id.to_string()).join(BLOCK_META_FILE)
}

pub fn block_deletion_mark_path(tenant_prefix: &RemotePath, block_id: Ulid) -> RemotePath {
    tenant_prefix
        .join(block_id.to_string())
        .join(BLOCK_DELETION_MARK_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_block_meta() {
        let blob = r#"{
            "version": 1,
            "ulid": "01H5VXKZP3Q4WERTYASDFGHJ2K",
            "minTime": 1000,
            "maxTime": 2000,
            "compaction": {"level": 2, "sources": ["01H5VXKZP3Q4WERTYASDFGHJ2K"]},
            "thanos": {"some": "field the scanner does not know about"}
        }"#;
        let meta = BlockMeta::from_slice(blob.as_bytes()).unwrap();
        assert_eq!(meta.id.to_string(), "01H5VXKZP3Q4WERTYASDFGHJ2K");
        assert_eq!(meta.min_time, 1000);
        assert_eq!(meta.max_time, 2000);
        assert_eq!(meta.compaction.level, 2);
        assert_eq!(meta.uploaded_at, SystemTime::UNIX_EPOCH);
    }

    #[test]
    fn reject_empty_time_range() {
        let blob = r#"{"version":1,"ulid":"01H5VXKZP3Q4WERTYASDFGHJ2K","minTime":2000,"maxTime":2000}"#;
        let err = BlockMeta::from_slice(blob.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("empty time range"), "{err}");
    }

    #[test]
    fn parse_deletion_mark() {
        let blob = r#"{"id":"01H5VXKZP3Q4WERTYASDFGHJ2K","deletion_time":1690000000,"version":1}"#;
        let mark = DeletionMark::from_slice(blob.as_bytes()).unwrap();
        assert_eq!(mark.deletion_time, 1_690_000_000);
    }

    #[test]
    fn reject_unknown_deletion_mark_version() {
        let blob = r#"{"id":"01H5VXKZP3Q4WERTYASDFGHJ2K","deletion_time":1690000000,"version":2}"#;
        let err = DeletionMark::from_slice(blob.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("Unsupported deletion mark version"), "{err}");
    }

    #[test]
    fn key_layout() {
        let tenant = RemotePath::from_string("user-1").unwrap();
        let id: Ulid = "01H5VXKZP3Q4WERTYASDFGHJ2K".parse().unwrap();
        assert_eq!(
            block_meta_path(&tenant, id).to_string(),
            "user-1/01H5VXKZP3Q4WERTYASDFGHJ2K/meta.json"
        );
        assert_eq!(
            block_deletion_mark_path(&tenant, id).to_string(),
            "user-1/01H5VXKZP3Q4WERTYASDFGHJ2K/deletion-mark.json"
        );
        assert_eq!(
            tenant_deletion_mark_path(&tenant).to_string(),
            "user-1/tenant-deletion-mark.json"
        );
    }
}
