//! Record sources.
//!
//! The export pass pulls records one at a time from a [`RecordSource`]. A
//! source is finite and produced once: the engine never asks for
//! re-delivery, so the order a source yields is final.
//!
//! Shipped sources:
//!
//! | Source | Input |
//! |--------|-------|
//! | [`JsonlSource`] | one JSON [`Record`] per line, from a file or stdin |
//! | [`VecSource`] | an in-memory vector (tests, embedding callers) |
//! | [`StreamSource`] | any `futures::Stream` of records |

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};

use crate::error::{ExportError, Result};
use crate::models::Record;

/// A finite, non-restartable sequence of records.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use chatshard::error::Result;
/// use chatshard::models::Record;
/// use chatshard::source::RecordSource;
///
/// struct Countdown(i64);
///
/// #[async_trait]
/// impl RecordSource for Countdown {
///     async fn next_record(&mut self) -> Result<Option<Record>> {
///         if self.0 == 0 {
///             return Ok(None);
///         }
///         self.0 -= 1;
///         Ok(Some(Record {
///             id: Some(self.0.to_string()),
///             timestamp: self.0,
///             sender_id: "bot".into(),
///             sender_name: "Bot".into(),
///             elements: vec![],
///             rendered_body: None,
///         }))
///     }
/// }
/// ```
#[async_trait]
pub trait RecordSource: Send {
    /// Short label used in log lines.
    fn label(&self) -> &str {
        "records"
    }

    /// Yield the next record, or `None` once the source is exhausted.
    async fn next_record(&mut self) -> Result<Option<Record>>;
}

type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

/// JSON Lines reader. Blank lines are skipped; a line that does not parse
/// fails with its 1-based line number.
pub struct JsonlSource {
    label: String,
    lines: Lines<BufReader<BoxedReader>>,
    line_no: u64,
}

impl JsonlSource {
    /// Open a file, or stdin when `path` is `-`.
    pub async fn open(path: &Path) -> Result<Self> {
        if path.as_os_str() == "-" {
            return Ok(Self::from_reader("stdin", Box::new(tokio::io::stdin())));
        }
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| ExportError::io(path, e))?;
        Ok(Self::from_reader(
            path.display().to_string(),
            Box::new(file),
        ))
    }

    pub fn from_reader(label: impl Into<String>, reader: BoxedReader) -> Self {
        Self {
            label: label.into(),
            lines: BufReader::new(reader).lines(),
            line_no: 0,
        }
    }
}

#[async_trait]
impl RecordSource for JsonlSource {
    fn label(&self) -> &str {
        &self.label
    }

    async fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| ExportError::Source(e.into()))?;
            let Some(line) = line else {
                return Ok(None);
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|e| ExportError::SourceLine {
                line: self.line_no,
                source: e,
            })?;
            return Ok(Some(record));
        }
    }
}

/// In-memory source.
pub struct VecSource {
    records: std::vec::IntoIter<Record>,
}

impl VecSource {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records: records.into_iter(),
        }
    }
}

#[async_trait]
impl RecordSource for VecSource {
    async fn next_record(&mut self) -> Result<Option<Record>> {
        Ok(self.records.next())
    }
}

/// Adapter over a `futures::Stream`; a stream error fails the export.
pub struct StreamSource<S> {
    stream: S,
}

impl<S> StreamSource<S>
where
    S: Stream<Item = anyhow::Result<Record>> + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<S> RecordSource for StreamSource<S>
where
    S: Stream<Item = anyhow::Result<Record>> + Unpin + Send,
{
    fn label(&self) -> &str {
        "stream"
    }

    async fn next_record(&mut self) -> Result<Option<Record>> {
        match self.stream.next().await {
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(e)) => Err(ExportError::Source(e)),
            None => Ok(None),
        }
    }
}
