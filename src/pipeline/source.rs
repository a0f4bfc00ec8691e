//! Batch source abstraction for read ingestion.
//!
//! Provides a unified trait for pulling read batches from different places:
//! a pre-loaded replay (file or in-memory) and JSON lines on stdin.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::types::ReadBatch;

/// Events produced by a batch source.
pub enum BatchEvent {
    /// A batch of reads arrived.
    Batch(ReadBatch),
    /// Source reached end of data.
    Eof,
}

/// Trait abstracting where read batches come from.
///
/// The processing loop calls [`next_batch`](BatchSource::next_batch) in a
/// select! with cancellation.
#[async_trait]
pub trait BatchSource: Send + 'static {
    /// Returns `BatchEvent::Eof` when no more data is available.
    async fn next_batch(&mut self) -> Result<BatchEvent>;

    /// Human-readable name for logging.
    fn source_name(&self) -> &str;
}

// ============================================================================
// Replay Source
// ============================================================================

/// Replays pre-loaded batches with an optional delay between them.
pub struct ReplaySource {
    batches: std::vec::IntoIter<ReadBatch>,
    delay_ms: u64,
    yielded_first: bool,
}

impl ReplaySource {
    pub fn from_batches(batches: Vec<ReadBatch>, delay_ms: u64) -> Self {
        Self {
            batches: batches.into_iter(),
            delay_ms,
            yielded_first: false,
        }
    }

    /// Load a JSON-lines file of batches. Malformed lines are skipped with a
    /// warning; an unreadable file is an error.
    pub fn from_file<P: AsRef<Path>>(path: P, delay_ms: u64) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read replay file {}", path.display()))?;

        let mut batches = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<ReadBatch>(line) {
                Ok(batch) => batches.push(batch),
                Err(e) => tracing::warn!(
                    file = %path.display(),
                    line = line_no + 1,
                    error = %e,
                    "[ReplaySource] Skipping malformed batch"
                ),
            }
        }
        tracing::info!(file = %path.display(), batches = batches.len(), "Replay loaded");
        Ok(Self::from_batches(batches, delay_ms))
    }
}

#[async_trait]
impl BatchSource for ReplaySource {
    async fn next_batch(&mut self) -> Result<BatchEvent> {
        if self.yielded_first && self.delay_ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(self.delay_ms)).await;
        }
        match self.batches.next() {
            Some(b) => {
                self.yielded_first = true;
                Ok(BatchEvent::Batch(b))
            }
            None => Ok(BatchEvent::Eof),
        }
    }

    fn source_name(&self) -> &str {
        "replay"
    }
}

// ============================================================================
// JSON Lines Source (stdin)
// ============================================================================

/// Reads one JSON `ReadBatch` per line.
///
/// Used with the simulation binary:
/// `read-simulation --batches 100 | rfid-inventory --stdin`
pub struct JsonLinesSource<R> {
    reader: R,
    line_buffer: String,
    name: &'static str,
}

pub type StdinSource = JsonLinesSource<BufReader<tokio::io::Stdin>>;

impl StdinSource {
    pub fn stdin() -> Self {
        Self::from_reader(BufReader::new(tokio::io::stdin()), "stdin")
    }
}

impl<R> JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    pub fn from_reader(reader: R, name: &'static str) -> Self {
        Self {
            reader,
            line_buffer: String::with_capacity(4096),
            name,
        }
    }
}

#[async_trait]
impl<R> BatchSource for JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    async fn next_batch(&mut self) -> Result<BatchEvent> {
        loop {
            self.line_buffer.clear();
            let bytes = self.reader.read_line(&mut self.line_buffer).await?;
            if bytes == 0 {
                return Ok(BatchEvent::Eof);
            }
            let line = self.line_buffer.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<ReadBatch>(line) {
                Ok(batch) => return Ok(BatchEvent::Batch(batch)),
                Err(e) => {
                    tracing::warn!(source = self.name, error = %e, "Failed to parse batch, skipping line");
                }
            }
        }
    }

    fn source_name(&self) -> &str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    async fn collect<S: BatchSource>(mut source: S) -> Vec<ReadBatch> {
        let mut out = Vec::new();
        while let BatchEvent::Batch(b) = source.next_batch().await.unwrap() {
            out.push(b);
        }
        out
    }

    const LINES: &str = concat!(
        r#"{"reads":[{"epc":"AA","rssi":-50,"timestamp":1,"device_id":"d1","facility_id":"F1"}]}"#,
        "\n",
        "not json\n",
        "\n",
        r#"{"source":"handheld","reads":[]}"#,
        "\n",
    );

    #[tokio::test]
    async fn test_json_lines_skips_garbage() {
        let source = JsonLinesSource::from_reader(BufReader::new(LINES.as_bytes()), "test");
        let batches = collect(source).await;
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].reads[0].epc, "AA");
        assert_eq!(batches[1].source, crate::types::ReadSource::Handheld);
    }

    #[tokio::test]
    async fn test_replay_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(LINES.as_bytes()).unwrap();
        let source = ReplaySource::from_file(file.path(), 0).unwrap();
        assert_eq!(source.source_name(), "replay");
        assert_eq!(collect(source).await.len(), 2);
    }

    #[test]
    fn test_replay_missing_file_is_error() {
        assert!(ReplaySource::from_file("/nonexistent/replay.jsonl", 0).is_err());
    }
}
