//! One-shot import of `.eml` files into the work queue

use mail_parser::MessageParser;
use mailsift_common::config::IngestConfig;
use mailsift_common::{Origin, WorkItem};
use mailsift_queue::{QueueResult, WorkQueue};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Queues every `.eml` file found in a directory
#[derive(Debug, Clone)]
pub struct DirectoryIngest {
    dir: PathBuf,
    remove_after: bool,
}

impl DirectoryIngest {
    pub fn new(dir: impl Into<PathBuf>, remove_after: bool) -> Self {
        Self {
            dir: dir.into(),
            remove_after,
        }
    }

    /// Build from config; `None` when ingestion is disabled
    pub fn from_config(config: &IngestConfig) -> Option<Self> {
        config
            .dir
            .as_ref()
            .map(|dir| Self::new(dir, config.remove_after))
    }

    /// Push every message file, oldest name first. Returns how many were queued.
    pub async fn run(&self, queue: &dyn WorkQueue, cancel: &CancellationToken) -> QueueResult<usize> {
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "eml") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut queued = 0;
        for path in paths {
            let raw = match tokio::fs::read(&path).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable file");
                    continue;
                }
            };

            let item = envelope_from_headers(&path, raw);
            let id = item.id;
            queue.push(item, cancel).await?;
            queued += 1;
            debug!(%id, path = %path.display(), "Queued message file");

            if self.remove_after {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %e, "Failed to remove ingested file");
                }
            }
        }

        info!(dir = %self.dir.display(), count = queued, "Directory ingest finished");
        Ok(queued)
    }
}

/// Files carry no SMTP envelope, so it is taken from the From/To headers.
fn envelope_from_headers(path: &Path, raw: Vec<u8>) -> WorkItem {
    let (sender, recipients) = match MessageParser::default().parse(&raw) {
        Some(parsed) => {
            let sender = parsed
                .from()
                .and_then(|a| a.first())
                .and_then(|a| a.address())
                .unwrap_or_default()
                .to_string();
            let recipients = parsed
                .to()
                .map(|list| {
                    list.iter()
                        .filter_map(|a| a.address())
                        .map(|s| s.to_string())
                        .collect()
                })
                .unwrap_or_default();
            (sender, recipients)
        }
        None => (String::new(), Vec::new()),
    };

    let host = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    WorkItem::new(sender, recipients, Origin::new(host, 0, "file"), raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailsift_queue::MemoryQueue;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_ingest_queues_eml_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("a.eml"),
            "From: a@example.com\r\nTo: x@example.com\r\nSubject: one\r\n\r\nbody",
        )
        .unwrap();
        std::fs::write(dir.path().join("b.eml"), "Subject: two\r\n\r\nbody").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let queue = MemoryQueue::new(8);
        let ingest = DirectoryIngest::new(dir.path(), true);
        let count = ingest.run(&queue, &CancellationToken::new()).await.unwrap();
        assert_eq!(count, 2);

        let first = queue.pull_now().await.unwrap();
        assert_eq!(first.sender, "a@example.com");
        assert_eq!(first.recipients, vec!["x@example.com".to_string()]);
        assert_eq!(first.origin.protocol, "file");

        let second = queue.pull_now().await.unwrap();
        assert_eq!(second.sender, "");

        assert!(!dir.path().join("a.eml").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_ingest_keeps_files_by_default() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.eml"), "Subject: one\r\n\r\nbody").unwrap();

        let queue = MemoryQueue::new(8);
        let config = IngestConfig {
            dir: Some(dir.path().to_path_buf()),
            remove_after: false,
        };
        let ingest = DirectoryIngest::from_config(&config).unwrap();
        assert_eq!(ingest.run(&queue, &CancellationToken::new()).await.unwrap(), 1);
        assert!(dir.path().join("a.eml").exists());
    }

    #[test]
    fn test_disabled_without_dir() {
        assert!(DirectoryIngest::from_config(&IngestConfig::default()).is_none());
    }
}
