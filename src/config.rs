//! Configuration for image-feed.
//!
//! Two layers feed the pipeline:
//! - [`PipelineConfig`], a serde type that can be loaded from a JSON file
//! - [`Cli`], command-line arguments and `IMAGE_FEED_` environment
//!   variables, applied on top of the JSON file
//!
//! # Example
//!
//! ```ignore
//! use image_feed::config::PipelineConfig;
//!
//! let config: PipelineConfig = serde_json::from_str(r#"{
//!     "max_cache_bytes": "1GiB",
//!     "pools": [{ "name": "interaction", "max_concurrency": 8 }],
//!     "retriable_error_classes": ["network", "timeout"]
//! }"#)?;
//! config.validate()?;
//! ```
//!
//! # Environment Variables
//!
//! - `IMAGE_FEED_CONFIG` - JSON config file
//! - `IMAGE_FEED_POOL` - Pool used for the requested loads (default: interaction)
//! - `IMAGE_FEED_MAX_CACHE` - Cache budget, e.g. `512MB` (default: 512MiB)
//! - `IMAGE_FEED_POOL_SIZES` - Comma-separated `NAME=MAX` pool sizes
//! - `IMAGE_FEED_RETRY_LIMIT` - Retries for transient failures (default: 1)
//! - `IMAGE_FEED_RETRIABLE` - Comma-separated retriable error classes
//! - `IMAGE_FEED_LOAD_TIMEOUT_MS` - Per-attempt loader timeout
//! - `IMAGE_FEED_CACHE_DISCARDED` - Cache results nobody waits for anymore
//! - `IMAGE_FEED_FILE_ROOT` - Directory `file:` locators are relative to
//! - `IMAGE_FEED_S3_BUCKET` - Enables the `s3:` loader
//! - `IMAGE_FEED_S3_PREFIX`, `IMAGE_FEED_S3_ENDPOINT`, `IMAGE_FEED_S3_REGION`

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Deserializer, Serialize};

use crate::cache::DEFAULT_MAX_CACHE_BYTES;
use crate::error::{ConfigError, ErrorClass};
use crate::identity::ImageId;
use crate::scheduler::{
    default_retriable_classes, Priority, SchedulerPolicy, DEFAULT_RETRY_LIMIT, INTERACTION_POOL,
    PREFETCH_POOL, THUMBNAIL_POOL,
};

// =============================================================================
// Default Values
// =============================================================================

/// Default AWS region.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default concurrency of the interaction pool.
pub const DEFAULT_INTERACTION_CONCURRENCY: usize = 6;

/// Default concurrency of the thumbnail pool.
pub const DEFAULT_THUMBNAIL_CONCURRENCY: usize = 4;

/// Default concurrency of the prefetch pool.
pub const DEFAULT_PREFETCH_CONCURRENCY: usize = 2;

// =============================================================================
// Pipeline Configuration
// =============================================================================

/// One named request pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    pub name: String,
    #[serde(alias = "maxConcurrency")]
    pub max_concurrency: usize,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>, max_concurrency: usize) -> Self {
        Self {
            name: name.into(),
            max_concurrency,
        }
    }
}

/// Budget, pools and retry policy of an [`ImagePipeline`](crate::ImagePipeline).
///
/// Every field has a default, so a JSON file only needs the fields it
/// changes. `max_cache_bytes` accepts either a number or a size string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(alias = "maxCacheBytes", deserialize_with = "deserialize_size")]
    pub max_cache_bytes: usize,

    pub pools: Vec<PoolConfig>,

    #[serde(alias = "retryLimit")]
    pub retry_limit: u32,

    #[serde(alias = "retriableErrorClasses")]
    pub retriable_error_classes: HashSet<ErrorClass>,

    /// Keep the result of a load whose waiters all cancelled while it ran
    #[serde(alias = "cacheDiscardedResults")]
    pub cache_discarded_results: bool,

    #[serde(alias = "loadTimeoutMs")]
    pub load_timeout_ms: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_cache_bytes: DEFAULT_MAX_CACHE_BYTES,
            pools: vec![
                PoolConfig::new(INTERACTION_POOL, DEFAULT_INTERACTION_CONCURRENCY),
                PoolConfig::new(THUMBNAIL_POOL, DEFAULT_THUMBNAIL_CONCURRENCY),
                PoolConfig::new(PREFETCH_POOL, DEFAULT_PREFETCH_CONCURRENCY),
            ],
            retry_limit: DEFAULT_RETRY_LIMIT,
            retriable_error_classes: default_retriable_classes(),
            cache_discarded_results: false,
            load_timeout_ms: None,
        }
    }
}

impl PipelineConfig {
    /// Read a JSON config file. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let unreadable = |reason: String| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason,
        };

        let text = std::fs::read_to_string(path).map_err(|e| unreadable(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| unreadable(e.to_string()))
    }

    /// Check the configuration before anything is built from it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_cache_bytes == 0 {
            return Err(ConfigError::ZeroBudget);
        }

        let mut seen = HashSet::new();
        for pool in &self.pools {
            if pool.name.is_empty() {
                return Err(ConfigError::EmptyPoolName);
            }
            if pool.max_concurrency == 0 {
                return Err(ConfigError::ZeroConcurrency {
                    pool: pool.name.clone(),
                });
            }
            if !seen.insert(pool.name.as_str()) {
                return Err(ConfigError::DuplicatePool(pool.name.clone()));
            }
        }

        Ok(())
    }

    /// Add `pool`, or resize the pool of the same name.
    pub fn set_pool(&mut self, pool: PoolConfig) {
        match self.pools.iter_mut().find(|p| p.name == pool.name) {
            Some(existing) => existing.max_concurrency = pool.max_concurrency,
            None => self.pools.push(pool),
        }
    }

    pub fn load_timeout(&self) -> Option<Duration> {
        self.load_timeout_ms.map(Duration::from_millis)
    }

    pub fn scheduler_policy(&self) -> SchedulerPolicy {
        SchedulerPolicy {
            retry_limit: self.retry_limit,
            retriable: self.retriable_error_classes.clone(),
            load_timeout: self.load_timeout(),
            cache_discarded_results: self.cache_discarded_results,
        }
    }
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Bytes(usize),
        Text(String),
    }

    match Size::deserialize(deserializer)? {
        Size::Bytes(n) => Ok(n),
        Size::Text(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

// =============================================================================
// Parsers
// =============================================================================

/// Parse a human-readable byte size.
///
/// Accepts a plain byte count (`4096`) or a number followed by a unit.
/// Units are case-insensitive and binary: `K`, `KB` and `KiB` all mean
/// 1024 bytes, and likewise for `M` and `G`. Fractions are allowed with
/// a unit (`1.5GB`).
pub fn parse_size(input: &str) -> Result<usize, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidSize {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    if number.is_empty() {
        return Err(invalid("missing number"));
    }

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024 * 1024,
        "g" | "gb" | "gib" => 1024 * 1024 * 1024,
        _ => return Err(invalid("unknown unit")),
    };

    if let Ok(whole) = number.parse::<u64>() {
        return whole
            .checked_mul(multiplier)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| invalid("too large"));
    }

    let value: f64 = number.parse().map_err(|_| invalid("not a number"))?;
    if multiplier == 1 {
        return Err(invalid("fractional byte count"));
    }
    let bytes = (value * multiplier as f64).round();
    if !bytes.is_finite() || bytes > usize::MAX as f64 {
        return Err(invalid("too large"));
    }
    Ok(bytes as usize)
}

/// Parse a `NAME=MAX_CONCURRENCY` pool definition.
pub fn parse_pool_spec(input: &str) -> Result<PoolConfig, ConfigError> {
    let (name, max) = input
        .split_once('=')
        .ok_or_else(|| ConfigError::InvalidPoolSpec(input.to_string()))?;
    let max_concurrency = max
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidPoolSpec(input.to_string()))?;
    Ok(PoolConfig::new(name.trim(), max_concurrency))
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// image-feed - prioritized, memory-bounded image loading.
#[derive(Parser, Debug, Clone)]
#[command(name = "image-feed")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Load identities through the pipeline and report what happened.
    Load(LoadArgs),
}

#[derive(Args, Debug, Clone)]
pub struct LoadArgs {
    /// Identities to load, e.g. `file:scans/ct-001.raw` or `s3:studies/1/volume.bin`.
    #[arg(required = true)]
    pub ids: Vec<String>,

    /// Pool the loads are queued in.
    #[arg(long, default_value = INTERACTION_POOL, env = "IMAGE_FEED_POOL")]
    pub pool: String,

    /// Priority of the loads within the pool (higher first).
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub priority: Priority,

    /// Treat the identities as volumes, loaded through the volume loaders.
    #[arg(long, default_value_t = false)]
    pub volume: bool,

    /// Hand results back without caching them.
    #[arg(long, default_value_t = false)]
    pub no_cache: bool,

    /// JSON file with a pipeline configuration. Flags override it.
    #[arg(long, env = "IMAGE_FEED_CONFIG")]
    pub config: Option<PathBuf>,

    // =========================================================================
    // Pipeline Overrides
    // =========================================================================
    /// Cache budget (e.g. "512MB", "1GiB", "4096").
    #[arg(long, env = "IMAGE_FEED_MAX_CACHE", value_parser = parse_size)]
    pub max_cache: Option<usize>,

    /// Pool size as NAME=MAX_CONCURRENCY. Repeatable.
    #[arg(
        long = "pool-size",
        env = "IMAGE_FEED_POOL_SIZES",
        value_parser = parse_pool_spec,
        value_delimiter = ','
    )]
    pub pool_sizes: Vec<PoolConfig>,

    /// Retries allowed for transient failures.
    #[arg(long, env = "IMAGE_FEED_RETRY_LIMIT")]
    pub retry_limit: Option<u32>,

    /// Error classes worth retrying (comma-separated).
    #[arg(long, env = "IMAGE_FEED_RETRIABLE", value_enum, value_delimiter = ',')]
    pub retriable: Option<Vec<ErrorClass>>,

    /// Per-attempt loader timeout in milliseconds.
    #[arg(long, env = "IMAGE_FEED_LOAD_TIMEOUT_MS")]
    pub load_timeout_ms: Option<u64>,

    /// Cache results of loads whose callers all went away.
    #[arg(long, default_value_t = false, env = "IMAGE_FEED_CACHE_DISCARDED")]
    pub cache_discarded: bool,

    // =========================================================================
    // Loader Configuration
    // =========================================================================
    /// Directory that relative `file:` locators resolve against.
    #[arg(long, env = "IMAGE_FEED_FILE_ROOT")]
    pub file_root: Option<PathBuf>,

    /// S3 bucket for `s3:` identities. The S3 loader is only registered
    /// when this is set.
    #[arg(long, env = "IMAGE_FEED_S3_BUCKET")]
    pub s3_bucket: Option<String>,

    /// Key prefix prepended to `s3:` locators.
    #[arg(long, env = "IMAGE_FEED_S3_PREFIX")]
    pub s3_prefix: Option<String>,

    /// Custom S3 endpoint URL for S3-compatible services (MinIO, etc.).
    #[arg(long, env = "IMAGE_FEED_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// AWS region for S3.
    #[arg(long, default_value = DEFAULT_REGION, env = "IMAGE_FEED_S3_REGION")]
    pub s3_region: String,

    // =========================================================================
    // Logging Configuration
    // =========================================================================
    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl LoadArgs {
    /// The pipeline configuration: the JSON file if given, then flags.
    pub fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_json_file(path)?,
            None => PipelineConfig::default(),
        };

        if let Some(max_cache) = self.max_cache {
            config.max_cache_bytes = max_cache;
        }
        for pool in &self.pool_sizes {
            config.set_pool(pool.clone());
        }
        if let Some(retry_limit) = self.retry_limit {
            config.retry_limit = retry_limit;
        }
        if let Some(ref classes) = self.retriable {
            config.retriable_error_classes = classes.iter().copied().collect();
        }
        if self.load_timeout_ms.is_some() {
            config.load_timeout_ms = self.load_timeout_ms;
        }
        if self.cache_discarded {
            config.cache_discarded_results = true;
        }

        config.validate()?;
        Ok(config)
    }

    /// Requested identities, in order, without repeats.
    pub fn image_ids(&self) -> Vec<ImageId> {
        let mut seen = HashSet::new();
        self.ids
            .iter()
            .filter(|raw| seen.insert(raw.as_str()))
            .map(|raw| {
                if self.volume {
                    ImageId::volume(raw.as_str())
                } else {
                    ImageId::new(raw.as_str())
                }
            })
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
