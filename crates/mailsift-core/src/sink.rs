//! Result sinks

use async_trait::async_trait;
use mailsift_common::ResultRecord;
use std::io;
use std::path::Path;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::info;

/// Consumes submitted result records
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn write(&self, record: &ResultRecord) -> io::Result<()>;
}

/// Writes one JSON document per line
pub struct JsonLinesSink {
    out: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl JsonLinesSink {
    pub fn new(out: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(tokio::io::stdout()))
    }

    /// Append to `path`, creating it if needed
    pub async fn open(path: &Path) -> io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        info!(path = %path.display(), "Writing results to file");
        Ok(Self::new(Box::new(file)))
    }
}

#[async_trait]
impl ResultSink for JsonLinesSink {
    async fn write(&self, record: &ResultRecord) -> io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut out = self.out.lock().await;
        out.write_all(&line).await?;
        out.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailsift_common::{Origin, WorkItem};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_json_lines_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.jsonl");
        let sink = JsonLinesSink::open(&path).await.unwrap();

        let item = WorkItem::new("a@example.com", vec![], Origin::new("h", 0, "file"), vec![1]);
        let first = ResultRecord::for_item(&item, serde_json::json!({"n": 1}));
        let second = ResultRecord::for_item(&item, serde_json::json!({"n": 2}));
        sink.write(&first).await.unwrap();
        sink.write(&second).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<ResultRecord> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines, vec![first, second]);
    }
}
