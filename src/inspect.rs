//! Bundle inspection and identifier lookup.
//!
//! Reader-side tooling for a finalized bundle. `chatshard inspect` prints a
//! summary of the manifest; `chatshard lookup` resolves one record id to its
//! shard through the identifier index, reading exactly one bucket file.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::bundle::BundleLayout;
use crate::id_index;
use crate::manifest::Manifest;
use crate::progress::format_number;
use crate::shard::ShardMeta;

/// Senders listed by `inspect`.
const TOP_SENDERS: usize = 10;

async fn open_bundle(dir: &Path) -> Result<(BundleLayout, Manifest)> {
    let layout = BundleLayout::new(dir);
    if !layout.is_finalized() {
        bail!(
            "No finalized bundle at {} (data/manifest.json is missing)",
            dir.display()
        );
    }
    let manifest = Manifest::read(&layout)
        .await
        .with_context(|| format!("Failed to read manifest in {}", dir.display()))?;
    Ok((layout, manifest))
}

/// Print a summary of the bundle at `dir`. With `verify`, every shard file
/// is re-hashed and compared against the manifest.
pub async fn run_inspect(dir: &Path, verify: bool) -> Result<()> {
    let (layout, manifest) = open_bundle(dir).await?;
    let stats = &manifest.stats;

    println!("chatshard bundle: {}", manifest.title());
    println!("================================");
    println!();
    println!(
        "  Chat:        {:?} {}",
        manifest.chat.chat_type, manifest.chat.chat_id
    );
    println!("  Exported:    {} ({})", manifest.exported_at, manifest.generator);
    println!("  Export id:   {}", manifest.export_id);
    println!(
        "  Records:     {} ({} indexed)",
        format_number(stats.records),
        format_number(stats.indexed_ids)
    );
    if stats.filtered_out > 0 {
        println!("  Filtered:    {} outside the export window", format_number(stats.filtered_out));
    }
    println!(
        "  Payload:     {} in {} shards",
        format_bytes(stats.total_bytes),
        stats.shard_count
    );
    if let (Some(first), Some(last)) = (stats.first_timestamp, stats.last_timestamp) {
        println!(
            "  Time span:   {} .. {}",
            format_ts_iso(first),
            format_ts_iso(last)
        );
    }
    println!(
        "  Resources:   {} copied, {} already present, {} referenced",
        stats.resources.copied, stats.resources.skipped_existing, stats.resources.referenced
    );
    println!(
        "  Faults:      {} resource, {} oversized text, {} malformed ids",
        stats.faults.resource_faults,
        stats.faults.oversized_text_records,
        stats.faults.malformed_identifiers
    );
    println!(
        "  Index:       {} buckets ({})",
        manifest.id_index.bucket_count, manifest.id_index.hash
    );

    if !manifest.shards.is_empty() {
        println!();
        println!("  Shards:");
        println!(
            "  {:>6} {:>8} {:>10}   {:<16} {:<16} {}",
            "SHARD", "RECORDS", "SIZE", "FROM", "TO", "TEXT INDEX"
        );
        println!("  {}", "-".repeat(76));
        for shard in &manifest.shards {
            println!(
                "  {:>6} {:>8} {:>10}   {:<16} {:<16} {}",
                shard.shard_id,
                shard.record_count,
                format_bytes(shard.byte_size),
                format_ts_iso(shard.start_timestamp),
                format_ts_iso(shard.end_timestamp),
                if shard.text_bloom_incomplete {
                    "partial"
                } else {
                    "full"
                }
            );
        }
    }

    if !manifest.senders.is_empty() {
        println!();
        println!("  Top senders:");
        for sender in manifest.senders.iter().take(TOP_SENDERS) {
            let aliases = if sender.aliases.is_empty() {
                String::new()
            } else {
                format!("  (also: {})", sender.aliases.join(", "))
            };
            println!(
                "  {:>8}  {} [{}]{}",
                format_number(sender.message_count),
                sender.display_name,
                sender.sender_id,
                aliases
            );
        }
    }

    if verify {
        println!();
        let mismatched = verify_shards(&layout, &manifest).await?;
        if !mismatched.is_empty() {
            bail!(
                "{} shard(s) failed checksum verification: {:?}",
                mismatched.len(),
                mismatched
            );
        }
        println!("  Verified:    all {} shard checksums match", manifest.shards.len());
    }

    println!();
    Ok(())
}

/// Shard ids whose file is missing or whose SHA-256 differs from the
/// manifest.
pub async fn verify_shards(layout: &BundleLayout, manifest: &Manifest) -> Result<Vec<u32>> {
    let mut mismatched = Vec::new();
    for shard in &manifest.shards {
        let path = layout.root().join(&shard.file);
        let matches = match tokio::fs::read(&path).await {
            Ok(bytes) => format!("{:x}", Sha256::digest(&bytes)) == shard.sha256,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "shard file unreadable");
                false
            }
        };
        if !matches {
            mismatched.push(shard.shard_id);
        }
    }
    Ok(mismatched)
}

/// Shards holding `record_id`, resolved through the identifier index.
pub async fn lookup_record(dir: &Path, record_id: &str) -> Result<Vec<ShardMeta>> {
    let (layout, manifest) = open_bundle(dir).await?;
    let shard_ids = id_index::lookup(&layout, record_id, manifest.id_index.bucket_count)
        .await
        .context("Failed to read identifier index")?;
    Ok(manifest
        .shards
        .into_iter()
        .filter(|shard| shard_ids.contains(&shard.shard_id))
        .collect())
}

pub async fn run_lookup(dir: &Path, record_id: &str) -> Result<()> {
    let shards = lookup_record(dir, record_id).await?;
    if shards.is_empty() {
        bail!("Record id '{}' is not in the identifier index", record_id);
    }
    for shard in shards {
        println!("{}\t{}\t{}", record_id, shard.shard_id, shard.file);
    }
    Ok(())
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_human_readable() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(50 * 1024 * 1024), "50.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn timestamps_render_in_utc() {
        assert_eq!(format_ts_iso(0), "1970-01-01 00:00");
        assert_eq!(format_ts_iso(1_700_000_000), "2023-11-14 22:13");
    }

    #[tokio::test]
    async fn unfinalized_directory_is_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = run_inspect(tmp.path(), false).await.unwrap_err();
        assert!(err.to_string().contains("No finalized bundle"));
    }
}
