//! The blocks scanner service: a long-lived owner of the per-tenant block
//! index, kept in sync with the bucket by periodic scans.
//!
//! Lifecycle: `New → Starting → Running → Stopping → Terminated`, with
//! `Failed` reached when the initial scan fails. The initial scan runs
//! synchronously inside [`BlocksScanner::start`], so a scanner that started
//! successfully always has a complete index to serve. Periodic scan failures
//! are logged and counted but never take the service down: queries keep being
//! answered from the snapshot of the last successful scan.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use bucket_store::{BucketError, ObjectStore};
use futures::StreamExt;
use prometheus::Registry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::block::{BlockMeta, DeletionMark};
use crate::cache::{GcPlan, MetaCache};
use crate::config::ScannerConfig;
use crate::fetch::{list_tenants, scan_tenant};
use crate::index::{TenantIndex, TenantSet};
use crate::metrics::ScannerMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerState {
    New,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("blocks scanner is not running")]
    ScannerNotRunning,
}

/// One scan attempt either succeeds, fails, or is interrupted by shutdown.
/// The distinction matters for metrics: an interrupted scan is not a failure.
#[derive(Debug, thiserror::Error)]
enum ScanError {
    #[error("blocks scan cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(anyhow::Error),
}

impl ScanError {
    fn classify(err: anyhow::Error) -> Self {
        if BucketError::caused_by_cancel(&err) {
            Self::Cancelled
        } else {
            Self::Other(err)
        }
    }
}

pub struct BlocksScanner {
    inner: Arc<ScannerInner>,
    scan_loop: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

struct ScannerInner {
    conf: ScannerConfig,
    storage: Arc<dyn ObjectStore>,
    cache: MetaCache,
    metrics: ScannerMetrics,
    /// Published snapshot: replaced wholesale at the end of each scan, so
    /// queries never observe a partially built index.
    tenants: ArcSwap<TenantSet>,
    state: Mutex<ScannerState>,
    cancel: CancellationToken,
}

impl BlocksScanner {
    pub fn new(
        conf: ScannerConfig,
        storage: Arc<dyn ObjectStore>,
        registry: &Registry,
    ) -> anyhow::Result<Self> {
        let cache = MetaCache::new(conf.cache_dir.clone())?;
        let metrics = ScannerMetrics::new(registry)?;
        metrics
            .consistency_delay
            .set(conf.consistency_delay.as_secs_f64());

        Ok(Self {
            inner: Arc::new(ScannerInner {
                conf,
                storage,
                cache,
                metrics,
                tenants: ArcSwap::from_pointee(TenantSet::new()),
                state: Mutex::new(ScannerState::New),
                cancel: CancellationToken::new(),
            }),
            scan_loop: tokio::sync::Mutex::new(None),
        })
    }

    /// Run the initial scan and, on success, spawn the periodic scan loop.
    /// If the initial scan fails the service lands in [`ScannerState::Failed`]
    /// and never serves queries.
    pub async fn start(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.inner
                .transition(ScannerState::New, ScannerState::Starting),
            "Blocks scanner already started"
        );

        info!("Running the initial blocks scan");
        match self.inner.scan_once().await {
            Ok(()) => {
                anyhow::ensure!(
                    self.inner
                        .transition(ScannerState::Starting, ScannerState::Running),
                    "Blocks scanner stopped during startup"
                );
                let inner = Arc::clone(&self.inner);
                *self.scan_loop.lock().await = Some(tokio::spawn(scan_loop(inner)));
                Ok(())
            }
            Err(ScanError::Cancelled) => {
                self.inner
                    .transition(ScannerState::Starting, ScannerState::Failed);
                anyhow::bail!("Blocks scanner stopped during the initial scan")
            }
            Err(ScanError::Other(e)) => {
                self.inner
                    .transition(ScannerState::Starting, ScannerState::Failed);
                Err(e.context("Initial blocks scan failed"))
            }
        }
    }

    /// Stop the service. Returns once the scan loop has exited; a scan in
    /// flight is cancelled, not awaited to completion.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state == ScannerState::Terminated {
                return;
            }
            *state = ScannerState::Stopping;
        }
        self.inner.cancel.cancel();
        if let Some(task) = self.scan_loop.lock().await.take() {
            if let Err(e) = task.await {
                warn!("Blocks scan loop task failed: {e}");
            }
        }
        *self.inner.state.lock().unwrap() = ScannerState::Terminated;
        info!("Blocks scanner stopped");
    }

    pub fn state(&self) -> ScannerState {
        *self.inner.state.lock().unwrap()
    }

    /// All blocks of `tenant` overlapping the closed window `[min_t, max_t]`
    /// (milliseconds), sorted by `max_time` descending then id descending,
    /// plus the deletion marks of the returned blocks. A tenant unknown to
    /// the index simply has no blocks. The result is a point-in-time
    /// snapshot: concurrent scans never tear it.
    pub fn get_blocks(
        &self,
        tenant: &str,
        min_t: i64,
        max_t: i64,
    ) -> Result<(Vec<BlockMeta>, HashMap<Ulid, DeletionMark>), QueryError> {
        if self.state() != ScannerState::Running {
            return Err(QueryError::ScannerNotRunning);
        }
        let tenants = self.inner.tenants.load();
        Ok(match tenants.get(tenant) {
            Some(index) => index.query(min_t, max_t),
            None => (Vec::new(), HashMap::new()),
        })
    }
}

async fn scan_loop(inner: Arc<ScannerInner>) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(inner.conf.scan_interval) => {}
        }
        match inner.scan_once().await {
            Ok(()) => {}
            Err(ScanError::Cancelled) => break,
            Err(ScanError::Other(e)) => {
                warn!("Periodic blocks scan failed, keeping the previous index: {e:#}");
            }
        }
    }
    debug!("Blocks scan loop stopped");
}

impl ScannerInner {
    fn transition(&self, from: ScannerState, to: ScannerState) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    /// One scan attempt, with the metric bookkeeping around it: every attempt
    /// bumps the sync counter, every failed attempt bumps the failure counter
    /// exactly once, and cancellation bumps neither failure nor timestamp.
    async fn scan_once(&self) -> Result<(), ScanError> {
        self.metrics.syncs.inc();
        let result = tokio::select! {
            // Racing the scan against the token guarantees a prompt stop even
            // where the storage backend does not observe cancellation itself.
            _ = self.cancel.cancelled() => Err(ScanError::Cancelled),
            result = self.scan() => result.map_err(ScanError::classify),
        };
        match &result {
            Ok(()) => {
                self.metrics
                    .last_successful_scan_timestamp
                    .set(unix_seconds_now());
            }
            Err(ScanError::Cancelled) => {}
            Err(ScanError::Other(_)) => self.metrics.sync_failures.inc(),
        }
        result
    }

    /// One full pass over the bucket. Tenants that scanned successfully get a
    /// fresh index, tenants whose scan failed keep their previous one, and
    /// tenants gone from the bucket are dropped; the new set is published
    /// atomically. Returns the first per-tenant error, if any.
    async fn scan(&self) -> anyhow::Result<()> {
        let started = Instant::now();
        let tenants = list_tenants(self.storage.as_ref(), &self.cancel).await?;
        debug!("Scanning {} tenants", tenants.len());
        let previous = self.tenants.load_full();

        let storage = self.storage.as_ref();
        let cache = &self.cache;
        let cancel = &self.cancel;
        let previous_ref = &previous;
        let metas_concurrency = self.conf.metas_concurrency.get();
        let results: Vec<(String, anyhow::Result<TenantIndex>)> =
            futures::stream::iter(tenants.into_iter().map(|tenant| async move {
                let prev = previous_ref.get(&tenant).map(|index| index.as_ref());
                let result =
                    scan_tenant(storage, cache, &tenant, prev, metas_concurrency, cancel).await;
                (tenant, result)
            }))
            .buffer_unordered(self.conf.tenants_concurrency.get())
            .collect()
            .await;

        let mut first_err = None;
        let mut new_set = TenantSet::with_capacity(results.len());
        let mut gc_plan = GcPlan::with_capacity(results.len());
        for (tenant, result) in results {
            match result {
                Ok(index) => {
                    gc_plan.insert(tenant.clone(), Some(index.block_ids()));
                    new_set.insert(tenant, Arc::new(index));
                }
                // Shutting down: abandon the pass, publish nothing.
                Err(e) if BucketError::caused_by_cancel(&e) => return Err(e),
                Err(e) => {
                    warn!("Failed to scan tenant {tenant}, keeping its previous blocks: {e:#}");
                    if let Some(prev) = previous.get(&tenant) {
                        new_set.insert(tenant.clone(), Arc::clone(prev));
                    }
                    // Previous index or not, the tenant is still in the
                    // bucket: its cache must survive the failed attempt.
                    gc_plan.insert(tenant, None);
                    first_err.get_or_insert(e);
                }
            }
        }

        self.tenants.store(Arc::new(new_set));
        self.cache.gc(&gc_plan).await;

        match first_err {
            None => {
                debug!("Blocks scan completed in {:?}", started.elapsed());
                Ok(())
            }
            Some(e) => Err(e),
        }
    }
}

fn unix_seconds_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
