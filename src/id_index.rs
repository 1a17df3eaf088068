//! Cross-shard identifier index.
//!
//! Maps a record id to the shard holding it without a global in-memory
//! map: ids are hash-partitioned into `bucket_count` files and each
//! `(id, shard)` pair is appended to its bucket as the pass goes.
//!
//! `bucket = fnv1a32(utf8(id)) mod bucket_count` is part of the bundle
//! format. A viewer resolving "reply to X" computes the same bucket, loads
//! that one file, and scans it.

use std::path::PathBuf;
use tokio::fs::File;

use crate::bundle::{unwrap_loader, BundleLayout, INDEX_LOADER};
use crate::error::{ExportError, Result};
use crate::hash::fnv1a32;
use crate::writer::BoundedWriter;

pub const MAX_BUCKETS: u32 = 4096;

pub fn bucket_of(id: &str, bucket_count: u32) -> u32 {
    fnv1a32(id.as_bytes()) % bucket_count.max(1)
}

/// Lower-case hex bucket number, zero-padded to the width of the largest
/// bucket number (`0f` .. `ff` for 256 buckets).
pub fn bucket_prefix(bucket: u32, bucket_count: u32) -> String {
    let width = format!("{:x}", bucket_count.max(1) - 1).len();
    format!("{:0width$x}", bucket, width = width)
}

struct BucketSink {
    writer: BoundedWriter<File>,
    entries: u64,
}

pub struct IdIndexWriter {
    bucket_count: u32,
    buckets: Vec<BucketSink>,
    entries: u64,
}

impl IdIndexWriter {
    /// Open every bucket file up front and write its loader prefix.
    pub async fn open(layout: &BundleLayout, bucket_count: u32, batch_bytes: usize) -> Result<Self> {
        let bucket_count = bucket_count.clamp(1, MAX_BUCKETS);
        let mut index = Self {
            bucket_count,
            buckets: Vec::with_capacity(bucket_count as usize),
            entries: 0,
        };

        for bucket in 0..bucket_count {
            let path = layout.bucket_file(&bucket_prefix(bucket, bucket_count));
            let opened = async {
                let mut writer = BoundedWriter::create(&path, batch_bytes).await?;
                writer
                    .write(&format!("{}({},[\n", INDEX_LOADER, bucket))
                    .await?;
                Ok::<_, ExportError>(writer)
            }
            .await;
            match opened {
                Ok(writer) => index.buckets.push(BucketSink { writer, entries: 0 }),
                Err(e) => {
                    index.close_on_error().await;
                    return Err(e);
                }
            }
        }

        tracing::debug!(buckets = bucket_count, "opened identifier index");
        Ok(index)
    }

    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    /// Total pairs appended so far.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub async fn append(&mut self, id: &str, shard_id: u32) -> Result<()> {
        let bucket = bucket_of(id, self.bucket_count) as usize;
        let sink = &mut self.buckets[bucket];
        let pair = serde_json::to_string(&(id, shard_id))?;
        if sink.entries > 0 {
            sink.writer.write(",\n").await?;
        }
        sink.writer.write(&pair).await?;
        sink.entries += 1;
        self.entries += 1;
        Ok(())
    }

    /// Write every bucket's suffix and close it. All buckets are closed
    /// even when one fails; the first failure is returned.
    pub async fn close(&mut self) -> Result<()> {
        let mut first_err = None;
        for sink in &mut self.buckets {
            let result = async {
                sink.writer.write("\n]);\n").await?;
                sink.writer.close().await
            }
            .await;
            if let Err(e) = result {
                let _ = sink.writer.close().await;
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Close every bucket without finishing its payload.
    pub async fn close_on_error(&mut self) {
        for sink in &mut self.buckets {
            if let Err(e) = sink.writer.close().await {
                tracing::warn!(path = %sink.writer.path().display(), error = %e, "failed to close index bucket");
            }
        }
    }
}

/// Read all pairs from one bucket file.
pub async fn read_bucket(
    layout: &BundleLayout,
    bucket: u32,
    bucket_count: u32,
) -> Result<Vec<(String, u32)>> {
    let path = layout.bucket_file(&bucket_prefix(bucket, bucket_count));
    let body = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| ExportError::io(&path, e))?;
    let (_, json) = unwrap_loader(&body, INDEX_LOADER).ok_or_else(|| malformed(&path))?;
    Ok(serde_json::from_str(json)?)
}

/// Resolve a record id to the shard(s) that hold it by reading exactly one
/// bucket file.
pub async fn lookup(layout: &BundleLayout, id: &str, bucket_count: u32) -> Result<Vec<u32>> {
    let bucket = bucket_of(id, bucket_count);
    let pairs = read_bucket(layout, bucket, bucket_count).await?;
    Ok(pairs
        .into_iter()
        .filter(|(candidate, _)| candidate == id)
        .map(|(_, shard)| shard)
        .collect())
}

fn malformed(path: &std::path::Path) -> ExportError {
    ExportError::io(
        PathBuf::from(path),
        std::io::Error::new(std::io::ErrorKind::InvalidData, "not an index bucket file"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn prefix_width_follows_bucket_count() {
        assert_eq!(bucket_prefix(0, 256), "00");
        assert_eq!(bucket_prefix(255, 256), "ff");
        assert_eq!(bucket_prefix(5, 4096), "005");
        assert_eq!(bucket_prefix(0, 1), "0");
        assert_eq!(bucket_prefix(9, 10), "9");
    }

    #[test]
    fn bucket_matches_fnv_contract() {
        assert_eq!(bucket_of("a", 256), 0xe40c292c % 256);
        assert_eq!(bucket_of("foobar", 1000), 0xbf9cf968 % 1000);
        assert_eq!(bucket_of("anything", 1), 0);
    }

    #[tokio::test]
    async fn every_id_lands_in_its_bucket_once() {
        let tmp = TempDir::new().unwrap();
        let layout = BundleLayout::new(tmp.path());
        layout.prepare(false).await.unwrap();

        let mut index = IdIndexWriter::open(&layout, 16, 64).await.unwrap();
        for i in 0..200u32 {
            index.append(&format!("msg-{}", i), i / 50 + 1).await.unwrap();
        }
        index.close().await.unwrap();
        assert_eq!(index.entries(), 200);

        let mut seen = 0;
        for bucket in 0..16 {
            for (id, _) in read_bucket(&layout, bucket, 16).await.unwrap() {
                assert_eq!(bucket_of(&id, 16), bucket);
                seen += 1;
            }
        }
        assert_eq!(seen, 200);

        assert_eq!(lookup(&layout, "msg-120", 16).await.unwrap(), vec![3]);
        assert!(lookup(&layout, "msg-999", 16).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_buckets_are_valid_files() {
        let tmp = TempDir::new().unwrap();
        let layout = BundleLayout::new(tmp.path());
        layout.prepare(false).await.unwrap();

        let mut index = IdIndexWriter::open(&layout, 4, 64).await.unwrap();
        index.close().await.unwrap();
        for bucket in 0..4 {
            assert!(read_bucket(&layout, bucket, 4).await.unwrap().is_empty());
        }
    }
}
