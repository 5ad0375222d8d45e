//! On-disk queue backend
//!
//! Layout under the root directory:
//!
//! ```text
//! staging/   items being written; never read by pullers
//! ready/     published items, one file per item
//! corrupt/   files that could not be decoded
//! ```
//!
//! A push writes and fsyncs a file in `staging/`, then renames it into
//! `ready/`. The rename is the only publication step, so a crash mid-push
//! never exposes a partial item. Pullers take files from `ready/` in
//! directory order, which is not FIFO.

use async_trait::async_trait;
use mailsift_common::config::DiskQueueConfig;
use mailsift_common::{WorkItem, WorkItemId};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};
use crate::queue::WorkQueue;

const ITEM_EXT: &str = "msg";
const STAGING_EXT: &str = "tmp";

/// Crash-durable work queue backed by a directory
pub struct DiskQueue {
    staging: PathBuf,
    ready: PathBuf,
    corrupt: PathBuf,
    /// Serializes directory scans between pullers of this process
    pull_lock: Mutex<()>,
    wake: Arc<Notify>,
    poll_interval: Duration,
    closed: AtomicBool,
    watcher: std::sync::Mutex<Option<RecommendedWatcher>>,
}

impl DiskQueue {
    /// Open (or create) a queue from config
    pub fn new(config: &DiskQueueConfig) -> QueueResult<Self> {
        Self::open(
            &config.path,
            Duration::from_secs(config.poll_interval_secs.max(1)),
        )
    }

    /// Open (or create) a queue rooted at `root`
    pub fn open(root: &Path, poll_interval: Duration) -> QueueResult<Self> {
        let staging = root.join("staging");
        let ready = root.join("ready");
        let corrupt = root.join("corrupt");
        for dir in [&staging, &ready, &corrupt] {
            std::fs::create_dir_all(dir)?;
        }

        let abandoned = clear_staging(&staging)?;
        if abandoned > 0 {
            warn!(count = abandoned, "Removed unpublished items left by an interrupted push");
        }

        let wake = Arc::new(Notify::new());
        let watcher = match watch_ready(&ready, wake.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(error = %e, "Filesystem watch unavailable, falling back to polling");
                None
            }
        };

        info!(path = %root.display(), "Opened on-disk queue");

        Ok(Self {
            staging,
            ready,
            corrupt,
            pull_lock: Mutex::new(()),
            wake,
            poll_interval,
            closed: AtomicBool::new(false),
            watcher: std::sync::Mutex::new(watcher),
        })
    }

    /// Number of published items
    pub async fn len(&self) -> QueueResult<usize> {
        let mut count = 0;
        let mut entries = fs::read_dir(&self.ready).await?;
        while let Some(entry) = entries.next_entry().await? {
            if has_ext(&entry.path(), ITEM_EXT) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Write an item into staging and fsync it; returns the staged path
    async fn stage(&self, item: &WorkItem) -> QueueResult<PathBuf> {
        let bytes = item.encode()?;
        let path = self.staging.join(format!(
            "{}.{}.{}",
            item.id.simple(),
            Uuid::new_v4().simple(),
            STAGING_EXT
        ));

        let mut file = fs::File::create(&path).await?;
        if let Err(e) = write_synced(&mut file, &bytes).await {
            drop(file);
            let _ = fs::remove_file(&path).await;
            return Err(e.into());
        }
        Ok(path)
    }

    /// Atomically move a staged file into the ready area
    async fn publish(&self, staged: &Path, id: &WorkItemId) -> QueueResult<()> {
        let target = self.ready.join(format!("{}.{}", id.simple(), ITEM_EXT));
        if let Err(e) = fs::rename(staged, &target).await {
            let _ = fs::remove_file(staged).await;
            return Err(e.into());
        }
        sync_dir(&self.ready).await;
        Ok(())
    }

    async fn first_ready(&self) -> QueueResult<Option<PathBuf>> {
        let mut entries = fs::read_dir(&self.ready).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if has_ext(&path, ITEM_EXT) {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    async fn quarantine(&self, path: &Path) {
        let name = path.file_name().map(|n| n.to_owned()).unwrap_or_default();
        if let Err(e) = fs::rename(path, self.corrupt.join(name)).await {
            warn!(path = %path.display(), error = %e, "Failed to quarantine corrupt item");
        }
    }

    /// Try to take one item; `Ok(None)` when the ready area is empty
    async fn take_one(&self, cancel: &CancellationToken) -> QueueResult<Option<WorkItem>> {
        loop {
            let Some(path) = self.first_ready().await? else {
                return Ok(None);
            };

            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                // Taken by another process sharing the directory
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            let item = match WorkItem::decode(&bytes) {
                Ok(item) => item,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Quarantining undecodable item");
                    self.quarantine(&path).await;
                    continue;
                }
            };

            if cancel.is_cancelled() {
                // Leave the file for the next puller.
                return Err(QueueError::Cancelled);
            }

            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
            debug!(id = %item.id, "Pulled item from disk");
            return Ok(Some(item));
        }
    }
}

#[async_trait]
impl WorkQueue for DiskQueue {
    fn name(&self) -> &'static str {
        "disk"
    }

    async fn push(&self, item: WorkItem, cancel: &CancellationToken) -> QueueResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        if cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }

        let staged = self.stage(&item).await?;
        if cancel.is_cancelled() {
            let _ = fs::remove_file(&staged).await;
            return Err(QueueError::Cancelled);
        }
        self.publish(&staged, &item.id).await?;

        debug!(id = %item.id, "Published item to disk");
        self.wake.notify_waiters();
        Ok(())
    }

    async fn pull(&self, cancel: &CancellationToken) -> QueueResult<WorkItem> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(QueueError::Closed);
            }

            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let _guard = tokio::select! {
                    guard = self.pull_lock.lock() => guard,
                    _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                };
                match self.take_one(cancel).await {
                    Ok(Some(item)) => return Ok(item),
                    Ok(None) => {}
                    Err(QueueError::Cancelled) => {
                        drop(_guard);
                        self.wake.notify_waiters();
                        return Err(QueueError::Cancelled);
                    }
                    Err(e) => return Err(e),
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            }
        }
    }

    async fn acknowledge(&self, _id: WorkItemId) {}

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut watcher) = self.watcher.lock() {
            watcher.take();
        }
        self.wake.notify_waiters();
        info!("Closed on-disk queue");
    }
}

fn has_ext(path: &Path, ext: &str) -> bool {
    path.extension().map(|e| e == ext).unwrap_or(false)
}

fn clear_staging(staging: &Path) -> QueueResult<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(staging)? {
        let path = entry?.path();
        if path.is_file() {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

async fn write_synced(file: &mut fs::File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

/// Persist the rename itself; best effort where directories can be opened
async fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        match fs::File::open(dir).await {
            Ok(handle) => {
                if let Err(e) = handle.sync_all().await {
                    debug!(error = %e, "Directory fsync failed");
                }
            }
            Err(e) => debug!(error = %e, "Directory open for fsync failed"),
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}

fn watch_ready(ready: &Path, wake: Arc<Notify>) -> notify::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    wake.notify_waiters();
                }
            }
            Err(e) => warn!(error = %e, "Filesystem watch error"),
        }
    })?;
    watcher.watch(ready, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}
