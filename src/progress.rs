//! Export progress reporting.
//!
//! The export pass calls an [`ExportProgress`] observer after every record
//! and whenever a shard is finalized. Observers never influence the export;
//! [`NoProgress`] is a valid choice. Output goes to **stderr** so stdout
//! stays parseable for scripts.

use std::io::Write;

/// Records between two human or JSON progress lines.
pub const REPORT_EVERY: u64 = 1000;

/// A single progress event for an export.
#[derive(Clone, Debug, PartialEq)]
pub enum ExportProgressEvent {
    /// A record was written. `shard_id` is the shard it landed in.
    Record { processed: u64, shard_id: u32 },
    ShardFinalized {
        shard_id: u32,
        record_count: usize,
        byte_size: u64,
    },
    Finished { records: u64, shards: usize },
}

/// Receives progress events. Called from the export loop.
pub trait ExportProgress: Send + Sync {
    fn report(&self, event: ExportProgressEvent);
}

fn due(event: &ExportProgressEvent) -> bool {
    match event {
        ExportProgressEvent::Record { processed, .. } => processed % REPORT_EVERY == 0,
        _ => true,
    }
}

/// Human-friendly progress on stderr: "export  12,000 records  shard 12".
pub struct StderrProgress;

impl ExportProgress for StderrProgress {
    fn report(&self, event: ExportProgressEvent) {
        if !due(&event) {
            return;
        }
        let line = match &event {
            ExportProgressEvent::Record {
                processed,
                shard_id,
            } => format!(
                "export  {} records  shard {}\n",
                format_number(*processed),
                shard_id
            ),
            ExportProgressEvent::ShardFinalized {
                shard_id,
                record_count,
                byte_size,
            } => format!(
                "export  shard {} closed  {} records  {} bytes\n",
                shard_id,
                format_number(*record_count as u64),
                format_number(*byte_size)
            ),
            ExportProgressEvent::Finished { records, shards } => format!(
                "export  done  {} records in {} shards\n",
                format_number(*records),
                shards
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ExportProgress for JsonProgress {
    fn report(&self, event: ExportProgressEvent) {
        if !due(&event) {
            return;
        }
        let obj = match &event {
            ExportProgressEvent::Record {
                processed,
                shard_id,
            } => serde_json::json!({
                "event": "progress",
                "records": processed,
                "shard": shard_id
            }),
            ExportProgressEvent::ShardFinalized {
                shard_id,
                record_count,
                byte_size,
            } => serde_json::json!({
                "event": "shard",
                "shard": shard_id,
                "records": record_count,
                "bytes": byte_size
            }),
            ExportProgressEvent::Finished { records, shards } => serde_json::json!({
                "event": "finished",
                "records": records,
                "shards": shards
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ExportProgress for NoProgress {
    fn report(&self, _event: ExportProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ExportProgress> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
