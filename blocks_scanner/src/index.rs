//! Per-tenant, time-sorted index of block metadata.
//!
//! A [`TenantIndex`] is immutable once built: each scan builds fresh indexes
//! and the scanner publishes them wholesale, so query paths read a consistent
//! snapshot without locking.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ulid::Ulid;

use crate::block::{BlockMeta, DeletionMark};

#[derive(Debug, Default)]
pub struct TenantIndex {
    /// Sorted by `max_time` descending, ties broken by `id` descending.
    blocks: Vec<BlockMeta>,
    /// Keyed by block id; only ever references ids present in `blocks`.
    marks: HashMap<Ulid, DeletionMark>,
}

impl TenantIndex {
    pub fn new(mut blocks: Vec<BlockMeta>, mut marks: HashMap<Ulid, DeletionMark>) -> Self {
        blocks.sort_unstable_by(|a, b| {
            b.max_time
                .cmp(&a.max_time)
                .then_with(|| b.id.cmp(&a.id))
        });
        // Marks pointing at blocks we did not observe are stale leftovers.
        marks.retain(|id, _| blocks.iter().any(|b| b.id == *id));
        Self { blocks, marks }
    }

    pub fn blocks(&self) -> &[BlockMeta] {
        &self.blocks
    }

    pub fn block(&self, id: Ulid) -> Option<&BlockMeta> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn block_ids(&self) -> HashSet<Ulid> {
        self.blocks.iter().map(|b| b.id).collect()
    }

    /// Blocks overlapping the closed query window `[min_t, max_t]`, in index
    /// order, together with the deletion marks of the returned blocks. Block
    /// intervals themselves are half-open, see [`BlockMeta::overlaps`].
    pub fn query(&self, min_t: i64, max_t: i64) -> (Vec<BlockMeta>, HashMap<Ulid, DeletionMark>) {
        let mut blocks = Vec::new();
        for block in &self.blocks {
            // Sorted by max_time descending: everything from here on ends at
            // or before the window start.
            if block.max_time <= min_t {
                break;
            }
            if block.overlaps(min_t, max_t) {
                blocks.push(block.clone());
            }
        }
        let marks = blocks
            .iter()
            .filter_map(|b| self.marks.get(&b.id).map(|m| (b.id, m.clone())))
            .collect();
        (blocks, marks)
    }
}

/// All tenants known to the scanner. A tenant absent from the map has no
/// blocks. Replaced wholesale on each scan; entries are shared with readers
/// via `Arc`.
pub(crate) type TenantSet = HashMap<String, Arc<TenantIndex>>;

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::block::DELETION_MARK_VERSION;

    fn block(id: Ulid, min_time: i64, max_time: i64) -> BlockMeta {
        BlockMeta {
            version: 1,
            id,
            min_time,
            max_time,
            compaction: Default::default(),
            uploaded_at: SystemTime::UNIX_EPOCH,
        }
    }

    fn mark(id: Ulid) -> DeletionMark {
        DeletionMark {
            id,
            deletion_time: 1_690_000_000,
            version: DELETION_MARK_VERSION,
        }
    }

    fn ids(blocks: &[BlockMeta]) -> Vec<Ulid> {
        blocks.iter().map(|b| b.id).collect()
    }

    #[test]
    fn sorted_by_max_time_then_id_descending() {
        let id1 = Ulid::from_parts(1, 1);
        let id2 = Ulid::from_parts(2, 2);
        let id3 = Ulid::from_parts(3, 3);
        let index = TenantIndex::new(
            vec![block(id1, 0, 10), block(id2, 5, 20), block(id3, 0, 20)],
            HashMap::new(),
        );
        // id3 > id2, and both end after id1.
        assert_eq!(
            ids(index.blocks()),
            vec![id3, id2, id1],
        );
    }

    #[test]
    fn marks_for_unknown_blocks_are_dropped() {
        let known = Ulid::from_parts(1, 1);
        let unknown = Ulid::from_parts(2, 2);
        let index = TenantIndex::new(
            vec![block(known, 0, 10)],
            HashMap::from([(known, mark(known)), (unknown, mark(unknown))]),
        );
        let (blocks, marks) = index.query(i64::MIN, i64::MAX);
        assert_eq!(ids(&blocks), vec![known]);
        assert_eq!(marks.len(), 1);
        assert!(marks.contains_key(&known));
    }

    #[test]
    fn range_query_boundaries() {
        let b1 = Ulid::from_parts(1, 1);
        let b2 = Ulid::from_parts(2, 2);
        let b3 = Ulid::from_parts(3, 3);
        let b4 = Ulid::from_parts(4, 4);
        let index = TenantIndex::new(
            vec![
                block(b1, 10, 15),
                block(b2, 12, 20),
                block(b3, 20, 30),
                block(b4, 30, 40),
            ],
            HashMap::from([(b3, mark(b3))]),
        );

        // Entirely before / after every block.
        assert_eq!(ids(&index.query(0, 5).0), Vec::<Ulid>::new());
        assert_eq!(ids(&index.query(50, 60).0), Vec::<Ulid>::new());

        // A block whose max_time equals the window start does not overlap.
        let (blocks, marks) = index.query(30, 60);
        assert_eq!(ids(&blocks), vec![b4]);
        assert!(marks.is_empty());

        // A block starting exactly at the window end is included: the window
        // is closed on both sides.
        let (blocks, marks) = index.query(20, 30);
        assert_eq!(ids(&blocks), vec![b4, b3]);
        assert_eq!(marks.len(), 1);
        assert!(marks.contains_key(&b3));

        let (blocks, marks) = index.query(13, 16);
        assert_eq!(ids(&blocks), vec![b2, b1]);
        assert!(marks.is_empty());

        let (blocks, marks) = index.query(20, 29);
        assert_eq!(ids(&blocks), vec![b3]);
        assert!(marks.contains_key(&b3));
    }

    #[test]
    fn unknown_window_on_empty_index() {
        let index = TenantIndex::new(Vec::new(), HashMap::new());
        let (blocks, marks) = index.query(i64::MIN, i64::MAX);
        assert!(blocks.is_empty());
        assert!(marks.is_empty());
    }
}
