//! Error taxonomy for the export engine.
//!
//! Every variant here is fatal for the export pass: the pass unwinds, all
//! open writers are closed, and no manifest is written. Recoverable
//! conditions (missing resources, oversized text, records without an id)
//! never surface as errors; they are counted in the manifest instead.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExportError>;

#[derive(Error, Debug)]
pub enum ExportError {
    /// A shard or index sink could not accept data or could not be closed.
    #[error("write to {} failed: {source}", path.display())]
    Writer {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("record source failed: {0}")]
    Source(#[source] anyhow::Error),

    #[error("record source line {line}: {source}")]
    SourceLine {
        line: u64,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid export settings: {0:#}")]
    Config(#[source] anyhow::Error),

    #[error("export aborted")]
    Aborted,

    #[error("bundle already finalized at {} (use --force to replace it)", .0.display())]
    BundleExists(PathBuf),

    #[error("JSON encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ExportError {
    pub fn writer(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Writer {
            path: path.into(),
            source,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
