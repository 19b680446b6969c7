//! Blocks scanner configuration.

use std::num::NonZeroUsize;
use std::time::Duration;

use anyhow::Context;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Wall-clock period between periodic scans.
    #[serde(with = "humantime_serde", default = "default_scan_interval")]
    pub scan_interval: Duration,
    /// Max tenants scanned in parallel.
    #[serde(default = "default_tenants_concurrency")]
    pub tenants_concurrency: NonZeroUsize,
    /// Max block metadata fetches in flight within one tenant scan.
    #[serde(default = "default_metas_concurrency")]
    pub metas_concurrency: NonZeroUsize,
    /// Grace period before a block deletion mark should be applied by
    /// consumers. The scanner itself reports all marks regardless.
    #[serde(
        with = "humantime_serde",
        default = "default_ignore_deletion_marks_delay"
    )]
    pub ignore_deletion_marks_delay: Duration,
    /// Root of the on-disk metadata cache.
    pub cache_dir: Utf8PathBuf,
    /// How long after a bucket mutation it is considered safely observable.
    /// Surfaced as a gauge, not applied by the scanner.
    #[serde(with = "humantime_serde", default)]
    pub consistency_delay: Duration,
}

fn default_scan_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_tenants_concurrency() -> NonZeroUsize {
    NonZeroUsize::new(10).unwrap()
}

fn default_metas_concurrency() -> NonZeroUsize {
    NonZeroUsize::new(32).unwrap()
}

fn default_ignore_deletion_marks_delay() -> Duration {
    Duration::from_secs(60 * 60)
}

impl ScannerConfig {
    /// All defaults except the (mandatory) cache directory.
    pub fn with_cache_dir(cache_dir: Utf8PathBuf) -> Self {
        Self {
            scan_interval: default_scan_interval(),
            tenants_concurrency: default_tenants_concurrency(),
            metas_concurrency: default_metas_concurrency(),
            ignore_deletion_marks_delay: default_ignore_deletion_marks_delay(),
            cache_dir,
            consistency_delay: Duration::ZERO,
        }
    }

    /// Parse out of a sub-node of a larger TOML document, so the scanner
    /// section can be embedded in the host process config.
    pub fn from_toml(toml: &toml_edit::Item) -> anyhow::Result<Self> {
        let document: toml_edit::DocumentMut = match toml {
            toml_edit::Item::Table(table) => table.clone().into(),
            toml_edit::Item::Value(toml_edit::Value::InlineTable(table)) => {
                table.clone().into_table().into()
            }
            _ => anyhow::bail!("toml not a table or inline table"),
        };
        toml_edit::de::from_document(document).context("Failed to parse blocks scanner config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> anyhow::Result<ScannerConfig> {
        let toml = input.parse::<toml_edit::DocumentMut>().unwrap();
        ScannerConfig::from_toml(toml.as_item())
    }

    #[test]
    fn parse_full_config() {
        let input = "\
scan_interval = '30s'
tenants_concurrency = 4
metas_concurrency = 16
ignore_deletion_marks_delay = '2h'
cache_dir = '/var/cache/blocks-scanner'
consistency_delay = '5m'
";
        let config = parse(input).unwrap();
        assert_eq!(
            config,
            ScannerConfig {
                scan_interval: Duration::from_secs(30),
                tenants_concurrency: NonZeroUsize::new(4).unwrap(),
                metas_concurrency: NonZeroUsize::new(16).unwrap(),
                ignore_deletion_marks_delay: Duration::from_secs(2 * 60 * 60),
                cache_dir: Utf8PathBuf::from("/var/cache/blocks-scanner"),
                consistency_delay: Duration::from_secs(5 * 60),
            }
        );
    }

    #[test]
    fn parse_nested_table() {
        let input = "\
[blocks_scanner]
scan_interval = '45s'
cache_dir = '/cache'
";
        let toml = input.parse::<toml_edit::DocumentMut>().unwrap();
        let config = ScannerConfig::from_toml(&toml["blocks_scanner"]).unwrap();
        assert_eq!(config.scan_interval, Duration::from_secs(45));
        assert_eq!(config.cache_dir, Utf8PathBuf::from("/cache"));
    }

    #[test]
    fn defaults_apply_when_omitted() {
        let config = parse("cache_dir = '.'").unwrap();
        assert_eq!(config, ScannerConfig::with_cache_dir(Utf8PathBuf::from(".")));
    }

    #[test]
    fn cache_dir_is_mandatory() {
        assert!(parse("scan_interval = '1m'").is_err());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(parse("cache_dir = '.'\ntenants_concurrency = 0").is_err());
    }
}
