//! Shard writer and rotation state machine.
//!
//! Records are appended to the open shard in arrival order. A shard is
//! opened lazily when a record arrives, so the stream's end never leaves an
//! empty trailing shard behind.
//!
//! ```text
//! NoShardOpen ──record──▶ ShardOpen ──threshold──▶ (rotate) ──▶ NoShardOpen
//!                              │
//!                       stream end / finish()
//!                              ▼
//!                           Closed
//! ```
//!
//! Two checks keep shards bounded without ever splitting a record:
//!
//! - before writing, a non-empty shard that the record would push past
//!   `max_bytes` is rotated first;
//! - after writing, a shard at `max_records` or `max_bytes` is rotated.
//!
//! A lone record larger than `max_bytes` therefore lands in its own shard.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::fs::File;

use crate::bloom::{index_text, BloomFilter};
use crate::bundle::{BundleLayout, CHUNK_LOADER};
use crate::error::Result;
use crate::writer::BoundedWriter;

#[derive(Debug, Clone, Copy)]
pub struct ShardLimits {
    pub max_records: usize,
    pub max_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct BloomParams {
    pub text_bits: usize,
    pub text_hashes: u32,
    pub sender_bits: usize,
    pub sender_hashes: u32,
    pub max_chars_per_record: usize,
}

/// Finalized shard metadata, as listed in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShardMeta {
    pub shard_id: u32,
    pub file: String,
    pub record_count: usize,
    /// Encoded record payload bytes, excluding the loader wrapper.
    pub byte_size: u64,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    pub first_record_id: Option<String>,
    pub last_record_id: Option<String>,
    pub text_bloom: String,
    pub sender_bloom: String,
    pub text_bloom_incomplete: bool,
    /// SHA-256 of the complete shard file.
    pub sha256: String,
}

/// One record as the shard writer sees it.
#[derive(Debug, Clone, Copy)]
pub struct ShardEntry<'a> {
    pub id: Option<&'a str>,
    pub timestamp: i64,
    pub sender_id: &'a str,
    pub sender_name: &'a str,
    pub html: &'a str,
    pub plain_text: &'a str,
}

/// JSON shape of a record inside a shard file.
#[derive(Serialize)]
struct ChunkRecord<'a> {
    id: Option<&'a str>,
    ts: i64,
    sender_id: &'a str,
    sender: &'a str,
    html: &'a str,
}

/// Where a record ended up and which shards closed around it.
#[derive(Debug)]
pub struct Appended {
    pub shard_id: u32,
    pub text_truncated: bool,
    pub finalized: Vec<ShardMeta>,
}

struct OpenShard {
    id: u32,
    path: PathBuf,
    writer: BoundedWriter<File>,
    hasher: Sha256,
    record_count: usize,
    byte_size: u64,
    start_timestamp: i64,
    end_timestamp: i64,
    first_record_id: Option<String>,
    last_record_id: Option<String>,
    text_bloom: BloomFilter,
    sender_bloom: BloomFilter,
    text_bloom_incomplete: bool,
}

impl OpenShard {
    async fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        self.hasher.update(bytes);
        self.writer.write_bytes(bytes).await
    }
}

enum ShardState {
    NoShardOpen,
    ShardOpen(Box<OpenShard>),
    Closed,
}

pub struct ShardRotator {
    layout: BundleLayout,
    limits: ShardLimits,
    bloom: BloomParams,
    batch_bytes: usize,
    state: ShardState,
    next_id: u32,
}

impl ShardRotator {
    pub fn new(
        layout: BundleLayout,
        limits: ShardLimits,
        bloom: BloomParams,
        batch_bytes: usize,
    ) -> Self {
        Self {
            layout,
            limits: ShardLimits {
                max_records: limits.max_records.max(1),
                max_bytes: limits.max_bytes.max(1),
            },
            bloom,
            batch_bytes,
            state: ShardState::NoShardOpen,
            next_id: 1,
        }
    }

    /// Limits in effect, after clamping.
    pub fn limits(&self) -> ShardLimits {
        self.limits
    }

    /// Id of the shard the next record would join, if one is open.
    pub fn current_shard_id(&self) -> Option<u32> {
        match &self.state {
            ShardState::ShardOpen(shard) => Some(shard.id),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ShardState::Closed)
    }

    /// Append one record, rotating before and/or after as needed.
    pub async fn append(&mut self, entry: ShardEntry<'_>) -> Result<Appended> {
        let payload = serde_json::to_vec(&ChunkRecord {
            id: entry.id,
            ts: entry.timestamp,
            sender_id: entry.sender_id,
            sender: entry.sender_name,
            html: entry.html,
        })?;
        let mut finalized = Vec::new();

        let overflows = match &self.state {
            ShardState::ShardOpen(shard) => {
                shard.record_count > 0
                    && shard.byte_size + payload.len() as u64 > self.limits.max_bytes
            }
            _ => false,
        };
        if overflows {
            finalized.extend(self.rotate().await?);
        }

        if matches!(self.state, ShardState::NoShardOpen) {
            self.open_next().await?;
        }
        let ShardState::ShardOpen(shard) = &mut self.state else {
            return Err(closed_error());
        };

        if shard.record_count > 0 {
            shard.emit(b",\n").await?;
        }
        shard.emit(&payload).await?;

        shard.record_count += 1;
        shard.byte_size += payload.len() as u64;
        if shard.record_count == 1 {
            shard.start_timestamp = entry.timestamp;
            shard.end_timestamp = entry.timestamp;
        } else {
            shard.start_timestamp = shard.start_timestamp.min(entry.timestamp);
            shard.end_timestamp = shard.end_timestamp.max(entry.timestamp);
        }
        if let Some(id) = entry.id {
            if shard.first_record_id.is_none() {
                shard.first_record_id = Some(id.to_string());
            }
            shard.last_record_id = Some(id.to_string());
        }

        let outcome = index_text(
            &mut shard.text_bloom,
            entry.plain_text,
            self.bloom.max_chars_per_record,
        );
        if outcome.truncated {
            shard.text_bloom_incomplete = true;
        }
        if !entry.sender_id.is_empty() {
            shard.sender_bloom.add(entry.sender_id);
        }

        let shard_id = shard.id;
        if shard.record_count >= self.limits.max_records || shard.byte_size >= self.limits.max_bytes
        {
            finalized.extend(self.rotate().await?);
        }

        Ok(Appended {
            shard_id,
            text_truncated: outcome.truncated,
            finalized,
        })
    }

    /// Finalize the open shard, if any, and refuse further records.
    pub async fn finish(&mut self) -> Result<Option<ShardMeta>> {
        let meta = self.rotate().await?;
        self.state = ShardState::Closed;
        Ok(meta)
    }

    /// Close the open shard's writer without producing metadata. Used on
    /// abort and error paths; the partial shard is left on disk but is not
    /// part of any manifest.
    pub async fn close_on_error(&mut self) {
        let state = std::mem::replace(&mut self.state, ShardState::Closed);
        if let ShardState::ShardOpen(mut shard) = state {
            if let Err(e) = shard.writer.close().await {
                tracing::warn!(shard = shard.id, error = %e, "failed to close partial shard");
            }
        }
    }

    async fn open_next(&mut self) -> Result<()> {
        let id = self.next_id;
        let path = self.layout.chunk_file(id);
        let writer = BoundedWriter::create(&path, self.batch_bytes).await?;
        let mut shard = OpenShard {
            id,
            path,
            writer,
            hasher: Sha256::new(),
            record_count: 0,
            byte_size: 0,
            start_timestamp: 0,
            end_timestamp: 0,
            first_record_id: None,
            last_record_id: None,
            text_bloom: BloomFilter::new(self.bloom.text_bits, self.bloom.text_hashes),
            sender_bloom: BloomFilter::new(self.bloom.sender_bits, self.bloom.sender_hashes),
            text_bloom_incomplete: false,
        };
        shard
            .emit(format!("{}({},[\n", CHUNK_LOADER, id).as_bytes())
            .await?;

        self.next_id += 1;
        self.state = ShardState::ShardOpen(Box::new(shard));
        tracing::debug!(shard = id, "opened shard");
        Ok(())
    }

    /// ShardOpen -> NoShardOpen, returning the frozen metadata.
    async fn rotate(&mut self) -> Result<Option<ShardMeta>> {
        let state = std::mem::replace(&mut self.state, ShardState::NoShardOpen);
        let mut shard = match state {
            ShardState::ShardOpen(shard) => *shard,
            ShardState::Closed => {
                self.state = ShardState::Closed;
                return Ok(None);
            }
            ShardState::NoShardOpen => return Ok(None),
        };

        let closed = async {
            shard.emit(b"\n]);\n").await?;
            shard.writer.close().await
        }
        .await;
        if let Err(e) = closed {
            // The suffix write may have failed before close ran.
            let _ = shard.writer.close().await;
            self.state = ShardState::Closed;
            return Err(e);
        }

        let sha256 = format!("{:x}", shard.hasher.finalize());
        let meta = ShardMeta {
            shard_id: shard.id,
            file: BundleLayout::chunk_rel(shard.id),
            record_count: shard.record_count,
            byte_size: shard.byte_size,
            start_timestamp: shard.start_timestamp,
            end_timestamp: shard.end_timestamp,
            first_record_id: shard.first_record_id,
            last_record_id: shard.last_record_id,
            text_bloom: shard.text_bloom.digest(),
            sender_bloom: shard.sender_bloom.digest(),
            text_bloom_incomplete: shard.text_bloom_incomplete,
            sha256,
        };
        tracing::debug!(
            shard = meta.shard_id,
            records = meta.record_count,
            bytes = meta.byte_size,
            path = %shard.path.display(),
            text_bloom_fill = shard.text_bloom.ones() as f64 / shard.text_bloom.bit_len() as f64,
            "finalized shard"
        );
        Ok(Some(meta))
    }
}

fn closed_error() -> crate::error::ExportError {
    crate::error::ExportError::writer(
        "data/chunks",
        std::io::Error::new(std::io::ErrorKind::BrokenPipe, "shard rotator already closed"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bloom::BloomProbe;
    use crate::bundle::unwrap_loader;
    use tempfile::TempDir;

    const BLOOM: BloomParams = BloomParams {
        text_bits: 8192,
        text_hashes: 4,
        sender_bits: 512,
        sender_hashes: 3,
        max_chars_per_record: 64,
    };

    async fn rotator(tmp: &TempDir, max_records: usize, max_bytes: u64) -> ShardRotator {
        let layout = BundleLayout::new(tmp.path());
        layout.prepare(false).await.unwrap();
        ShardRotator::new(
            layout,
            ShardLimits {
                max_records,
                max_bytes,
            },
            BLOOM,
            256,
        )
    }

    fn entry<'a>(id: &'a str, ts: i64, html: &'a str) -> ShardEntry<'a> {
        ShardEntry {
            id: Some(id),
            timestamp: ts,
            sender_id: "u1",
            sender_name: "User One",
            html,
            plain_text: html,
        }
    }

    async fn run(r: &mut ShardRotator, entries: &[ShardEntry<'_>]) -> Vec<ShardMeta> {
        let mut metas = Vec::new();
        for e in entries {
            metas.extend(r.append(*e).await.unwrap().finalized);
        }
        metas.extend(r.finish().await.unwrap());
        metas
    }

    #[tokio::test]
    async fn rotates_on_record_count() {
        let tmp = TempDir::new().unwrap();
        let mut r = rotator(&tmp, 2, 1 << 20).await;
        let ids: Vec<String> = (0..5).map(|i| format!("m{}", i)).collect();
        let entries: Vec<_> = ids.iter().map(|id| entry(id, 1, "hello")).collect();

        let metas = run(&mut r, &entries).await;
        let counts: Vec<usize> = metas.iter().map(|m| m.record_count).collect();
        assert_eq!(counts, vec![2, 2, 1]);
        assert_eq!(metas[1].first_record_id.as_deref(), Some("m2"));
        assert_eq!(metas[1].last_record_id.as_deref(), Some("m3"));
        assert!(r.is_closed());
    }

    #[tokio::test]
    async fn exact_multiple_leaves_no_empty_shard() {
        let tmp = TempDir::new().unwrap();
        let mut r = rotator(&tmp, 2, 1 << 20).await;
        let entries = [entry("a", 1, "x"), entry("b", 2, "y")];
        let metas = run(&mut r, &entries).await;
        assert_eq!(metas.len(), 1);
        assert!(!tmp.path().join("data/chunks/2.js").exists());
    }

    #[tokio::test]
    async fn byte_limit_never_exceeded_by_multi_record_shards() {
        let tmp = TempDir::new().unwrap();
        let mut r = rotator(&tmp, 1000, 300).await;
        let body = "b".repeat(90);
        let ids: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        let entries: Vec<_> = ids.iter().map(|id| entry(id, 1, &body)).collect();

        let metas = run(&mut r, &entries).await;
        assert!(metas.len() > 1);
        for m in &metas {
            assert!(m.byte_size <= 300, "shard {} has {} bytes", m.shard_id, m.byte_size);
        }
        let total: usize = metas.iter().map(|m| m.record_count).sum();
        assert_eq!(total, 10);
    }

    #[tokio::test]
    async fn oversized_record_gets_its_own_shard() {
        let tmp = TempDir::new().unwrap();
        let mut r = rotator(&tmp, 1000, 500).await;
        let huge = "h".repeat(800);
        let entries = [
            entry("before", 1, "small"),
            entry("huge", 2, &huge),
            entry("after", 3, "small"),
        ];

        let metas = run(&mut r, &entries).await;
        assert_eq!(metas.len(), 3);
        assert_eq!(metas[1].record_count, 1);
        assert_eq!(metas[1].first_record_id.as_deref(), Some("huge"));
        assert!(metas[1].byte_size > 500);
        assert_eq!(metas[2].first_record_id.as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn shard_file_is_a_loader_call_with_all_records() {
        let tmp = TempDir::new().unwrap();
        let mut r = rotator(&tmp, 10, 1 << 20).await;
        let entries = [entry("a", 30, "first"), entry("b", 10, "second")];
        let metas = run(&mut r, &entries).await;

        let body = std::fs::read_to_string(tmp.path().join(&metas[0].file)).unwrap();
        let (arg, json) = unwrap_loader(&body, CHUNK_LOADER).unwrap();
        assert_eq!(arg, "1");
        let records: Vec<serde_json::Value> = serde_json::from_str(json).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["html"], "second");
        assert_eq!(records[0]["sender"], "User One");

        assert_eq!(metas[0].start_timestamp, 10);
        assert_eq!(metas[0].end_timestamp, 30);

        let expected = format!("{:x}", Sha256::digest(body.as_bytes()));
        assert_eq!(metas[0].sha256, expected);
    }

    #[tokio::test]
    async fn blooms_cover_text_and_senders() {
        let tmp = TempDir::new().unwrap();
        let mut r = rotator(&tmp, 10, 1 << 20).await;
        let long = "z".repeat(100);
        let entries = [entry("a", 1, "Greetings"), entry("b", 2, &long)];
        let metas = run(&mut r, &entries).await;

        let text = BloomProbe::from_digest(&metas[0].text_bloom, BLOOM.text_hashes).unwrap();
        assert!(text.might_contain_text("greet"));
        assert!(metas[0].text_bloom_incomplete);

        let senders =
            BloomProbe::from_digest(&metas[0].sender_bloom, BLOOM.sender_hashes).unwrap();
        assert!(senders.might_contain("u1"));
    }

    #[tokio::test]
    async fn append_after_finish_fails() {
        let tmp = TempDir::new().unwrap();
        let mut r = rotator(&tmp, 10, 1 << 20).await;
        r.finish().await.unwrap();
        assert!(r.append(entry("x", 1, "late")).await.is_err());
    }
}
