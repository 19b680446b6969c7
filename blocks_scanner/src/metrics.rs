//! Prometheus metrics of the blocks scanner.
//!
//! Registered into a caller-supplied registry: the scanner is an embedded
//! component, and the embedding process owns the registry (and may run more
//! than one scanner, e.g. in tests).

use anyhow::Context;
use prometheus::{Gauge, GaugeVec, IntCounter, IntCounterVec, Opts, Registry};

/// Label value identifying this component in the shared metric families.
const COMPONENT: &str = "querier";

#[derive(Debug)]
pub(crate) struct ScannerMetrics {
    /// Incremented once per scan attempt.
    pub syncs: IntCounter,
    /// Incremented once per scan attempt that returned an error, in lockstep
    /// with `syncs`: never more than once per attempt, regardless of how many
    /// tenants or blocks failed inside it.
    pub sync_failures: IntCounter,
    pub consistency_delay: Gauge,
    /// Unix seconds of the last successful scan; 0 until the first success.
    pub last_successful_scan_timestamp: Gauge,
}

impl ScannerMetrics {
    pub fn new(registry: &Registry) -> anyhow::Result<Self> {
        let syncs = register_counter(
            registry,
            "blocks_meta_syncs_total",
            "Total blocks metadata synchronization attempts",
        )?;
        let sync_failures = register_counter(
            registry,
            "blocks_meta_sync_failures_total",
            "Total blocks metadata synchronization attempts that failed",
        )?;
        let consistency_delay = register_gauge(
            registry,
            "blocks_meta_sync_consistency_delay_seconds",
            "Configured consistency delay in seconds",
        )?;

        let last_successful_scan_timestamp = Gauge::new(
            "querier_blocks_last_successful_scan_timestamp_seconds",
            "Unix timestamp of the last successful blocks scan",
        )
        .context("failed to define a metric")?;
        registry
            .register(Box::new(last_successful_scan_timestamp.clone()))
            .context("failed to register a metric")?;

        Ok(Self {
            syncs,
            sync_failures,
            consistency_delay,
            last_successful_scan_timestamp,
        })
    }
}

fn register_counter(registry: &Registry, name: &str, help: &str) -> anyhow::Result<IntCounter> {
    let vec = IntCounterVec::new(Opts::new(name, help), &["component"])
        .context("failed to define a metric")?;
    registry
        .register(Box::new(vec.clone()))
        .context("failed to register a metric")?;
    Ok(vec.with_label_values(&[COMPONENT]))
}

fn register_gauge(registry: &Registry, name: &str, help: &str) -> anyhow::Result<Gauge> {
    let vec =
        GaugeVec::new(Opts::new(name, help), &["component"]).context("failed to define a metric")?;
    registry
        .register(Box::new(vec.clone()))
        .context("failed to register a metric")?;
    Ok(vec.with_label_values(&[COMPONENT]))
}
