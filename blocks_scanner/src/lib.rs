//! Background scanner keeping an in-memory, queryable index of the immutable
//! time-series blocks stored in a multi-tenant object store.
//!
//! Queriers must, on every query, enumerate the blocks overlapping a time
//! window for one tenant, plus any deletion marks affecting their visibility.
//! Listing the bucket per query is far too slow, so [`BlocksScanner`]
//! periodically synchronizes block metadata from the bucket into a per-tenant,
//! time-sorted index, and [`BlocksScanner::get_blocks`] answers from memory.
//! Fetched metadata blobs are cached on disk, so repeat scans (and restarts)
//! only pay for listing and for genuinely new blocks.
#![deny(unsafe_code)]

pub mod block;
mod cache;
pub mod config;
mod fetch;
mod index;
mod metrics;
pub mod scanner;

pub use block::{BlockCompaction, BlockMeta, DeletionMark};
pub use config::ScannerConfig;
pub use scanner::{BlocksScanner, QueryError, ScannerState};
