//! Local output for dry runs: one JSON document per line, no batching,
//! no retries, no cluster connection.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::record::Record;

/// Writes every record as a self-contained JSON line.
pub struct LocalOutput<W> {
    writer: W,
    written: u64,
}

impl<W: AsyncWrite + Unpin> LocalOutput<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    /// Serialize and write one record.
    pub async fn write(&mut self, record: &Record) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.written += 1;
        Ok(())
    }

    /// Number of records written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Write records from a channel until it closes or the writer fails.
pub async fn run_local<W: AsyncWrite + Unpin>(
    mut rx: mpsc::Receiver<Record>,
    mut output: LocalOutput<W>,
) -> u64 {
    while let Some(record) = rx.recv().await {
        if let Err(e) = output.write(&record).await {
            error!(error = %e, "Local output failed, stopping");
            return output.written();
        }
    }

    if let Err(e) = output.writer.flush().await {
        error!(error = %e, "Failed to flush local output");
    }
    info!(written = output.written(), "Local output finished");
    output.written()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    #[tokio::test]
    async fn test_records_become_json_lines() {
        let ts = DateTime::parse_from_rfc3339("2024-03-01T12:00:00+00:00").unwrap();
        let mut record = Record::new(ts, 404);
        record.host = "example.com".to_string();

        let mut output = LocalOutput::new(Vec::new());
        output.write(&record).await.unwrap();
        output.write(&Record::new(ts, 200)).await.unwrap();
        assert_eq!(output.written(), 2);

        let text = String::from_utf8(output.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let doc: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(doc["status"], 404);
        assert_eq!(doc["host"], "example.com");
    }

    #[tokio::test]
    async fn test_run_local_drains_channel() {
        let ts = DateTime::parse_from_rfc3339("2024-03-01T12:00:00+00:00").unwrap();
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(run_local(rx, LocalOutput::new(Vec::new())));

        tx.send(Record::new(ts, 200)).await.unwrap();
        tx.send(Record::new(ts, 500)).await.unwrap();
        drop(tx);

        assert_eq!(task.await.unwrap(), 2);
    }
}
