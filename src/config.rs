use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::id_index::MAX_BUCKETS;
use crate::shard::{BloomParams, ShardLimits};

/// Export tuning. Every section is optional in the TOML file; an absent
/// file means [`Config::default`].
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub bloom: BloomConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub writer: WriterConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_records")]
    pub max_records_per_shard: usize,
    #[serde(default = "default_max_shard_bytes")]
    pub max_shard_bytes: u64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_records_per_shard: default_max_records(),
            max_shard_bytes: default_max_shard_bytes(),
        }
    }
}

fn default_max_records() -> usize {
    2000
}
fn default_max_shard_bytes() -> u64 {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct BloomConfig {
    #[serde(default = "default_text_bits")]
    pub text_bits: usize,
    #[serde(default = "default_text_hashes")]
    pub text_hashes: u32,
    #[serde(default = "default_sender_bits")]
    pub sender_bits: usize,
    #[serde(default = "default_sender_hashes")]
    pub sender_hashes: u32,
    #[serde(default = "default_max_chars")]
    pub max_chars_per_record: usize,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            text_bits: default_text_bits(),
            text_hashes: default_text_hashes(),
            sender_bits: default_sender_bits(),
            sender_hashes: default_sender_hashes(),
            max_chars_per_record: default_max_chars(),
        }
    }
}

fn default_text_bits() -> usize {
    65_536
}
fn default_text_hashes() -> u32 {
    4
}
fn default_sender_bits() -> usize {
    2048
}
fn default_sender_hashes() -> u32 {
    3
}
fn default_max_chars() -> usize {
    8192
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_bucket_count")]
    pub bucket_count: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            bucket_count: default_bucket_count(),
        }
    }
}

fn default_bucket_count() -> u32 {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct WriterConfig {
    #[serde(default = "default_batch_bytes")]
    pub batch_bytes: usize,
    #[serde(default = "default_index_batch_bytes")]
    pub index_batch_bytes: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_bytes: default_batch_bytes(),
            index_batch_bytes: default_index_batch_bytes(),
        }
    }
}

fn default_batch_bytes() -> usize {
    crate::writer::DEFAULT_BATCH_BYTES
}
fn default_index_batch_bytes() -> usize {
    16 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResourcesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Directories searched by file name when a reference's location does
    /// not resolve directly.
    #[serde(default)]
    pub roots: Vec<PathBuf>,
    /// Copies in flight. Unset means available parallelism; always clamped
    /// to 2..=8.
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            roots: Vec::new(),
            concurrency: None,
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_cache_ttl_secs() -> u64 {
    300
}

/// Which records of the source are exported. Records outside the window
/// are read and dropped; they are not counted as exported.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct FilterConfig {
    /// Earliest timestamp kept, inclusive (Unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    /// Latest timestamp kept, inclusive (Unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    /// Stop after this many records have been exported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<u64>,
}

impl FilterConfig {
    pub fn admits(&self, timestamp: i64) -> bool {
        self.since.map_or(true, |since| timestamp >= since)
            && self.until.map_or(true, |until| timestamp <= until)
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LogConfig {
    /// Default tracing level when `--log-level` is not given.
    #[serde(default)]
    pub level: Option<String>,
}

impl Config {
    pub fn shard_limits(&self) -> ShardLimits {
        ShardLimits {
            max_records: self.chunking.max_records_per_shard,
            max_bytes: self.chunking.max_shard_bytes,
        }
    }

    pub fn bloom_params(&self) -> BloomParams {
        BloomParams {
            text_bits: self.bloom.text_bits,
            text_hashes: self.bloom.text_hashes,
            sender_bits: self.bloom.sender_bits,
            sender_hashes: self.bloom.sender_hashes,
            max_chars_per_record: self.bloom.max_chars_per_record,
        }
    }

    pub fn resource_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.resources.cache_ttl_secs)
    }

    /// Reject values the exporter cannot honour. Run again after CLI
    /// overrides are applied.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_records_per_shard == 0 {
            anyhow::bail!("chunking.max_records_per_shard must be > 0");
        }
        if self.chunking.max_shard_bytes == 0 {
            anyhow::bail!("chunking.max_shard_bytes must be > 0");
        }

        for (name, bits) in [
            ("bloom.text_bits", self.bloom.text_bits),
            ("bloom.sender_bits", self.bloom.sender_bits),
        ] {
            if bits < 8 || bits % 8 != 0 {
                anyhow::bail!("{} must be a positive multiple of 8 (got {})", name, bits);
            }
        }
        if self.bloom.text_hashes == 0 || self.bloom.sender_hashes == 0 {
            anyhow::bail!("bloom.text_hashes and bloom.sender_hashes must be >= 1");
        }

        if !(1..=MAX_BUCKETS).contains(&self.index.bucket_count) {
            anyhow::bail!("index.bucket_count must be in [1, {}]", MAX_BUCKETS);
        }

        if self.writer.batch_bytes == 0 || self.writer.index_batch_bytes == 0 {
            anyhow::bail!("writer.batch_bytes and writer.index_batch_bytes must be > 0");
        }

        if self.resources.concurrency == Some(0) {
            anyhow::bail!("resources.concurrency must be > 0 when set");
        }

        if let (Some(since), Some(until)) = (self.filter.since, self.filter.until) {
            if since > until {
                anyhow::bail!("filter.since must be <= filter.until");
            }
        }
        if self.filter.max_count == Some(0) {
            anyhow::bail!("filter.max_count must be > 0 when set");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}
