use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::Result;
use crate::archive::{ArchiveFile, list_archives};

/// Live backup listing. Holds the directory watcher; dropping it stops updates.
pub struct BackupsWatch {
    rx: watch::Receiver<Vec<ArchiveFile>>,
    _watcher: RecommendedWatcher,
}

impl BackupsWatch {
    pub fn current(&self) -> Vec<ArchiveFile> {
        self.rx.borrow().clone()
    }

    /// The current listing on first call, then the next re-evaluated listing
    /// after each directory change.
    pub async fn next(&mut self) -> Option<Vec<ArchiveFile>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

pub fn watch_backup_dir(dir: &Path) -> Result<BackupsWatch> {
    std::fs::create_dir_all(dir)?;

    let (tx, mut rx) = watch::channel(Vec::new());
    let tx = Arc::new(tx);

    let listed_dir: PathBuf = dir.to_path_buf();
    let events_tx = tx.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                debug!(
                    event = "backups.dir_changed",
                    kind = ?event.kind,
                    "backups.dir_changed"
                );
                if let Err(e) = refresh(&events_tx, &listed_dir) {
                    warn!(
                        event = "backups.list_failed",
                        dir = %listed_dir.display(),
                        error = %e,
                        "backups.list_failed"
                    );
                }
            }
            Err(e) => warn!(event = "backups.watch_error", error = %e, "backups.watch_error"),
        }
    })?;
    // Registered before the initial listing.
    watcher.watch(dir, RecursiveMode::NonRecursive)?;

    refresh(&tx, dir)?;
    rx.mark_changed();

    Ok(BackupsWatch {
        rx,
        _watcher: watcher,
    })
}

/// Re-lists `dir` into `tx`. Listing happens under the channel's write lock,
/// so concurrent refreshes land in order and the newest listing wins.
fn refresh(tx: &watch::Sender<Vec<ArchiveFile>>, dir: &Path) -> Result<()> {
    let mut res = Ok(());
    tx.send_if_modified(|current| match list_archives(dir) {
        Ok(files) if *current != files => {
            *current = files;
            true
        }
        Ok(_) => false,
        Err(e) => {
            res = Err(e);
            false
        }
    });
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn emits_current_listing_then_changes() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("Backups");

        let mut w = watch_backup_dir(&dir).unwrap();
        assert_eq!(w.next().await, Some(vec![]));

        std::fs::write(dir.join("backup-20240101000000.json"), b"{\"messages\":[{}]}").unwrap();

        let listing = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match w.next().await {
                    Some(files) if !files.is_empty() => return files,
                    Some(_) => continue,
                    None => panic!("watch closed"),
                }
            }
        })
        .await
        .expect("directory change not observed");

        assert_eq!(listing.len(), 1);
        assert!(listing[0].path.ends_with("backup-20240101000000.json"));
    }

    #[tokio::test]
    async fn first_listing_includes_existing_files() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("Backups");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("backup-20240101000000.json"), b"{\"messages\":[{},{}]}").unwrap();

        let mut w = watch_backup_dir(&dir).unwrap();
        let first = w.next().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].message_count, 2);
        assert_eq!(w.current(), first);
    }
}
