//! Manifest assembly.
//!
//! The assembler sees every record once and keeps only aggregates: counts,
//! the timestamp span, one tally per distinct sender and one entry per
//! finalized shard. Nothing here grows with the number of records.
//!
//! The manifest is written only after every shard is finalized, every
//! index bucket is closed and every resource copy has settled. Its JSON
//! file is the last thing renamed into place, so a bundle with
//! `data/manifest.json` is complete by construction.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::bloom::{filter_bits, HASH_SCHEME, NGRAM_SIZES};
use crate::bundle::{write_atomic, BundleLayout, MANIFEST_GLOBAL};
use crate::config::FilterConfig;
use crate::error::{ExportError, Result};
use crate::id_index::bucket_prefix;
use crate::models::ChatInfo;
use crate::resources::ResourceStats;
use crate::shard::{BloomParams, ShardLimits, ShardMeta};

pub const FORMAT_VERSION: u32 = 1;
pub const GENERATOR: &str = concat!("chatshard ", env!("CARGO_PKG_VERSION"));
pub const ID_HASH: &str = "fnv1a32";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub generator: String,
    pub export_id: String,
    /// RFC 3339.
    pub exported_at: String,
    pub complete: bool,
    pub chat: ChatInfo,
    pub stats: ExportStats,
    pub chunking: ChunkingParams,
    pub bloom: BloomManifest,
    pub id_index: IdIndexManifest,
    /// Present only when the export was restricted.
    #[serde(default, skip_serializing_if = "FilterConfig::is_empty")]
    pub filter: FilterConfig,
    pub senders: Vec<SenderSummary>,
    pub shards: Vec<ShardMeta>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportStats {
    pub records: u64,
    /// Source records dropped by the time window.
    #[serde(default)]
    pub filtered_out: u64,
    pub indexed_ids: u64,
    pub total_bytes: u64,
    pub first_timestamp: Option<i64>,
    pub last_timestamp: Option<i64>,
    pub shard_count: usize,
    pub resources: ResourceStats,
    pub faults: FaultCounters,
}

/// Recovered problems. None of these fails an export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultCounters {
    pub resource_faults: u64,
    pub oversized_text_records: u64,
    pub malformed_identifiers: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkingParams {
    pub max_records_per_shard: usize,
    pub max_shard_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloomManifest {
    pub hash: String,
    pub ngram_sizes: Vec<usize>,
    pub text_bits: usize,
    pub text_hashes: u32,
    pub sender_bits: usize,
    pub sender_hashes: u32,
    pub max_chars_per_record: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdIndexManifest {
    pub bucket_count: u32,
    pub hash: String,
    /// Hex digits in a bucket file name.
    pub prefix_width: usize,
    pub dir: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderSummary {
    pub sender_id: String,
    pub display_name: String,
    pub aliases: Vec<String>,
    pub message_count: u64,
}

struct SenderTally {
    display_name: String,
    aliases: BTreeSet<String>,
    message_count: u64,
}

pub struct ManifestAssembler {
    chat: ChatInfo,
    limits: ShardLimits,
    bloom: BloomParams,
    bucket_count: u32,
    filter: FilterConfig,
    records: u64,
    filtered_out: u64,
    indexed_ids: u64,
    total_bytes: u64,
    first_timestamp: Option<i64>,
    last_timestamp: Option<i64>,
    senders: HashMap<String, SenderTally>,
    shards: Vec<ShardMeta>,
    faults: FaultCounters,
}

impl ManifestAssembler {
    pub fn new(chat: ChatInfo, limits: ShardLimits, bloom: BloomParams, bucket_count: u32) -> Self {
        Self {
            chat,
            limits,
            bloom,
            bucket_count,
            filter: FilterConfig::default(),
            records: 0,
            filtered_out: 0,
            indexed_ids: 0,
            total_bytes: 0,
            first_timestamp: None,
            last_timestamp: None,
            senders: HashMap::new(),
            shards: Vec::new(),
            faults: FaultCounters::default(),
        }
    }

    pub fn with_filter(mut self, filter: FilterConfig) -> Self {
        self.filter = filter;
        self
    }

    /// Account for one source record outside the export window.
    pub fn filtered_out(&mut self) {
        self.filtered_out += 1;
    }

    /// Account for one written record.
    pub fn record(&mut self, sender_id: &str, sender_name: &str, timestamp: i64) {
        self.records += 1;
        self.first_timestamp = Some(self.first_timestamp.map_or(timestamp, |t| t.min(timestamp)));
        self.last_timestamp = Some(self.last_timestamp.map_or(timestamp, |t| t.max(timestamp)));

        let tally = self
            .senders
            .entry(sender_id.to_string())
            .or_insert_with(|| SenderTally {
                display_name: String::new(),
                aliases: BTreeSet::new(),
                message_count: 0,
            });
        tally.message_count += 1;

        // The latest name wins; earlier ones become aliases.
        let name = sender_name.trim();
        if !name.is_empty() && name != tally.display_name {
            let previous = std::mem::replace(&mut tally.display_name, name.to_string());
            if !previous.is_empty() {
                tally.aliases.insert(previous);
            }
            tally.aliases.remove(name);
        }
    }

    pub fn id_indexed(&mut self) {
        self.indexed_ids += 1;
    }

    pub fn malformed_identifier(&mut self) {
        self.faults.malformed_identifiers += 1;
    }

    pub fn oversized_text(&mut self) {
        self.faults.oversized_text_records += 1;
    }

    pub fn add_shard(&mut self, meta: ShardMeta) {
        self.total_bytes += meta.byte_size;
        self.shards.push(meta);
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Freeze the aggregates. Call only once every shard, bucket and
    /// resource copy has settled.
    pub fn finish(self, resources: ResourceStats) -> Manifest {
        let mut senders: Vec<SenderSummary> = self
            .senders
            .into_iter()
            .map(|(sender_id, tally)| SenderSummary {
                display_name: if tally.display_name.is_empty() {
                    sender_id.clone()
                } else {
                    tally.display_name
                },
                sender_id,
                aliases: tally.aliases.into_iter().collect(),
                message_count: tally.message_count,
            })
            .collect();
        senders.sort_by(|a, b| {
            b.message_count
                .cmp(&a.message_count)
                .then_with(|| a.sender_id.cmp(&b.sender_id))
        });

        let mut faults = self.faults;
        faults.resource_faults = resources.faults;

        Manifest {
            format_version: FORMAT_VERSION,
            generator: GENERATOR.to_string(),
            export_id: uuid::Uuid::new_v4().to_string(),
            exported_at: chrono::Utc::now().to_rfc3339(),
            complete: true,
            chat: self.chat,
            stats: ExportStats {
                records: self.records,
                filtered_out: self.filtered_out,
                indexed_ids: self.indexed_ids,
                total_bytes: self.total_bytes,
                first_timestamp: self.first_timestamp,
                last_timestamp: self.last_timestamp,
                shard_count: self.shards.len(),
                resources,
                faults,
            },
            chunking: ChunkingParams {
                max_records_per_shard: self.limits.max_records,
                max_shard_bytes: self.limits.max_bytes,
            },
            bloom: BloomManifest {
                hash: HASH_SCHEME.to_string(),
                ngram_sizes: NGRAM_SIZES.to_vec(),
                text_bits: filter_bits(self.bloom.text_bits),
                text_hashes: self.bloom.text_hashes.max(1),
                sender_bits: filter_bits(self.bloom.sender_bits),
                sender_hashes: self.bloom.sender_hashes.max(1),
                max_chars_per_record: self.bloom.max_chars_per_record,
            },
            id_index: IdIndexManifest {
                bucket_count: self.bucket_count,
                hash: ID_HASH.to_string(),
                prefix_width: bucket_prefix(0, self.bucket_count).len(),
                dir: "data/index".to_string(),
            },
            filter: self.filter,
            senders,
            shards: self.shards,
        }
    }
}

impl Manifest {
    pub fn title(&self) -> String {
        match &self.chat.name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => format!("{:?} chat {}", self.chat.chat_type, self.chat.chat_id),
        }
    }

    /// Write `manifest.js`, the entry document, then `manifest.json`.
    pub async fn write(&self, layout: &BundleLayout) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let js = format!("{} = {};\n", MANIFEST_GLOBAL, json);

        write_atomic(&layout.manifest_js(), js.as_bytes()).await?;
        layout.write_index_html(&self.title()).await?;
        write_atomic(&layout.manifest_json(), json.as_bytes()).await?;

        tracing::debug!(path = %layout.manifest_json().display(), "wrote manifest");
        Ok(())
    }

    pub async fn read(layout: &BundleLayout) -> Result<Self> {
        let path = layout.manifest_json();
        let body = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ExportError::io(&path, e))?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatType;
    use tempfile::TempDir;

    fn assembler() -> ManifestAssembler {
        ManifestAssembler::new(
            ChatInfo {
                chat_type: ChatType::Group,
                chat_id: "42".to_string(),
                name: Some("Team".to_string()),
            },
            ShardLimits {
                max_records: 10,
                max_bytes: 1000,
            },
            BloomParams {
                text_bits: 1024,
                text_hashes: 4,
                sender_bits: 256,
                sender_hashes: 3,
                max_chars_per_record: 100,
            },
            256,
        )
    }

    #[test]
    fn sender_rollup_tracks_latest_name_and_aliases() {
        let mut a = assembler();
        a.record("u1", "Ann", 30);
        a.record("u2", "Bob", 10);
        a.record("u1", "Annie", 20);
        a.record("u1", "Ann", 40);
        a.record("u3", "", 50);
        a.record("u2", "Bob", 5);

        let m = a.finish(ResourceStats::default());
        let ids: Vec<&str> = m.senders.iter().map(|s| s.sender_id.as_str()).collect();
        assert_eq!(ids, vec!["u1", "u2", "u3"]);

        assert_eq!(m.senders[0].display_name, "Ann");
        assert_eq!(m.senders[0].aliases, vec!["Annie".to_string()]);
        assert_eq!(m.senders[0].message_count, 3);
        assert!(m.senders[1].aliases.is_empty());
        assert_eq!(m.senders[2].display_name, "u3");

        assert_eq!(m.stats.records, 6);
        assert_eq!(m.stats.first_timestamp, Some(5));
        assert_eq!(m.stats.last_timestamp, Some(50));
    }

    #[test]
    fn faults_and_parameters_are_recorded() {
        let mut a = assembler();
        a.record("u1", "Ann", 1);
        a.malformed_identifier();
        a.oversized_text();
        a.oversized_text();
        let m = a.finish(ResourceStats {
            faults: 3,
            ..Default::default()
        });

        assert_eq!(
            m.stats.faults,
            FaultCounters {
                resource_faults: 3,
                oversized_text_records: 2,
                malformed_identifiers: 1,
            }
        );
        assert_eq!(m.bloom.hash, "fnv1a32+djb2/double");
        assert_eq!(m.bloom.ngram_sizes, vec![2, 3]);
        assert_eq!(m.id_index.hash, "fnv1a32");
        assert_eq!(m.id_index.prefix_width, 2);
        assert!(m.complete);
        assert!(uuid::Uuid::parse_str(&m.export_id).is_ok());
        assert!(chrono::DateTime::parse_from_rfc3339(&m.exported_at).is_ok());
    }

    #[test]
    fn records_effective_bloom_sizes_and_filter() {
        let a = ManifestAssembler::new(
            ChatInfo {
                chat_type: ChatType::Friend,
                chat_id: "7".to_string(),
                name: None,
            },
            ShardLimits {
                max_records: 10,
                max_bytes: 1000,
            },
            BloomParams {
                text_bits: 100,
                text_hashes: 4,
                sender_bits: 13,
                sender_hashes: 0,
                max_chars_per_record: 100,
            },
            16,
        );
        let m = a.finish(ResourceStats::default());
        assert_eq!(m.bloom.text_bits, 104);
        assert_eq!(m.bloom.sender_bits, 16);
        assert_eq!(m.bloom.sender_hashes, 1);
        let json = serde_json::to_value(&m).unwrap();
        assert!(json.get("filter").is_none());

        let mut a = assembler().with_filter(FilterConfig {
            since: Some(100),
            until: None,
            max_count: Some(2),
        });
        a.filtered_out();
        a.record("u1", "Ann", 150);
        let m = a.finish(ResourceStats::default());
        assert_eq!(m.stats.filtered_out, 1);
        assert_eq!(m.stats.records, 1);
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["filter"]["since"], 100);
        assert!(json["filter"].get("until").is_none());
    }

    #[tokio::test]
    async fn write_produces_json_js_and_entry_page() {
        let tmp = TempDir::new().unwrap();
        let layout = BundleLayout::new(tmp.path());
        layout.prepare(false).await.unwrap();

        let mut a = assembler();
        a.record("u1", "Ann", 1);
        let m = a.finish(ResourceStats::default());
        m.write(&layout).await.unwrap();

        assert!(layout.is_finalized());
        let js = std::fs::read_to_string(layout.manifest_js()).unwrap();
        assert!(js.starts_with("window.__chatshardManifest = {"));
        assert!(js.trim_end().ends_with("};"));
        let html = std::fs::read_to_string(layout.index_html()).unwrap();
        assert!(html.contains("<title>Team</title>"));
        assert!(!layout.data_dir().join("manifest.json.tmp").exists());

        let back = Manifest::read(&layout).await.unwrap();
        assert_eq!(back.export_id, m.export_id);
        assert_eq!(back.stats, m.stats);
    }
}
