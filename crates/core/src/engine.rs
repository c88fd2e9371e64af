use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::archive::{
    Archive, ArchiveFile, ArchivedMessage, encode_archive, list_archives, next_backup_path,
    read_archive, write_archive_atomic,
};
use crate::progress::{ProgressChannel, ProgressState};
use crate::store::MessageStore;
use crate::watch::{BackupsWatch, watch_backup_dir};
use crate::{Error, Result};

/// Percent reached when mapping finishes and saving starts.
const SAVE_PHASE_PERCENT: u8 = 90;
/// Remaining-time estimates are reported as 0 until this many records are done.
const ESTIMATE_MIN_RECORDS: usize = 100;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub backup_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupResult {
    pub path: PathBuf,
    pub messages_total: u64,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResult {
    pub messages_restored: u64,
}

pub struct BackupEngine<S> {
    store: S,
    backup_dir: PathBuf,
    backup_progress: ProgressChannel,
    restore_progress: ProgressChannel,
    busy: AtomicBool,
}

struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl<S: MessageStore> BackupEngine<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self {
            store,
            backup_dir: config.backup_dir,
            backup_progress: ProgressChannel::new(),
            restore_progress: ProgressChannel::new(),
            busy: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn backup_progress(&self) -> &ProgressChannel {
        &self.backup_progress
    }

    pub fn restore_progress(&self) -> &ProgressChannel {
        &self.restore_progress
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Writes every stored message to a new archive file in the backup
    /// directory. Returns `Ok(None)` without doing anything when another backup
    /// or restore is running.
    pub async fn perform_backup(&self) -> Result<Option<BackupResult>> {
        let Some(guard) = BusyGuard::acquire(&self.busy) else {
            debug!(event = "backup.skipped_busy", "backup.skipped_busy");
            return Ok(None);
        };

        debug!(
            event = "backup.prepare",
            provider = self.store.provider(),
            backup_dir = %self.backup_dir.display(),
            "backup.prepare"
        );

        match self.run_backup().await {
            Ok(result) => {
                self.backup_progress.publish(ProgressState::running(
                    100,
                    format!("{} messages saved", result.messages_total),
                ));
                // Observers of the terminal state may start the next operation.
                drop(guard);
                self.backup_progress.publish(ProgressState::Idle);
                info!(
                    event = "backup.finish",
                    path = %result.path.display(),
                    messages_total = result.messages_total,
                    bytes_written = result.bytes_written,
                    "backup.finish"
                );
                Ok(Some(result))
            }
            Err(e) => {
                error!(event = "backup.failed", error = %e, "backup.failed");
                drop(guard);
                self.backup_progress.publish(ProgressState::Failed {
                    message: format!("Backup failed: {e}"),
                });
                Err(e)
            }
        }
    }

    async fn run_backup(&self) -> Result<BackupResult> {
        let map_started = Instant::now();
        debug!(event = "phase.start", phase = "map", "phase.start");

        let messages = self.store.list_messages_by_date_sent().await?;
        let total = messages.len();

        let started = Instant::now();
        let mut archived = Vec::with_capacity(total);
        for (index, message) in messages.iter().enumerate() {
            let percent = (index * SAVE_PHASE_PERCENT as usize / total) as u8;
            let remaining = remaining_seconds(started.elapsed().as_millis() as u64, index, total);
            self.backup_progress.publish(ProgressState::running(
                percent,
                format!("{remaining} seconds remaining"),
            ));
            archived.push(ArchivedMessage::from(message));
        }

        debug!(
            event = "phase.finish",
            phase = "map",
            duration_ms = map_started.elapsed().as_millis() as u64,
            messages_total = total,
            "phase.finish"
        );

        let save_started = Instant::now();
        debug!(event = "phase.start", phase = "save", "phase.start");
        self.backup_progress
            .publish(ProgressState::running(SAVE_PHASE_PERCENT, "Saving..."));

        let bytes = encode_archive(&Archive { messages: archived })?;

        std::fs::create_dir_all(&self.backup_dir).map_err(|e| {
            error!(
                event = "io.backup_dir.create_failed",
                backup_dir = %self.backup_dir.display(),
                error = %e,
                "io.backup_dir.create_failed"
            );
            e
        })?;

        let path = next_backup_path(&self.backup_dir, Local::now());
        write_archive_atomic(&path, &bytes).map_err(|e| {
            error!(
                event = "io.archive.write_failed",
                path = %path.display(),
                error = %e,
                "io.archive.write_failed"
            );
            e
        })?;

        debug!(
            event = "phase.finish",
            phase = "save",
            duration_ms = save_started.elapsed().as_millis() as u64,
            bytes = bytes.len() as u64,
            "phase.finish"
        );

        Ok(BackupResult {
            path,
            messages_total: total as u64,
            bytes_written: bytes.len() as u64,
        })
    }

    /// Inserts every message of the archive at `path` into the store. Returns
    /// `Ok(None)` without doing anything when another backup or restore is
    /// running.
    pub async fn perform_restore(&self, path: &Path) -> Result<Option<RestoreResult>> {
        let Some(guard) = BusyGuard::acquire(&self.busy) else {
            debug!(event = "restore.skipped_busy", "restore.skipped_busy");
            return Ok(None);
        };

        debug!(
            event = "restore.prepare",
            provider = self.store.provider(),
            path = %path.display(),
            "restore.prepare"
        );

        match self.run_restore(path).await {
            Ok(result) => {
                drop(guard);
                self.restore_progress.publish(ProgressState::Idle);
                info!(
                    event = "restore.finish",
                    path = %path.display(),
                    messages_restored = result.messages_restored,
                    "restore.finish"
                );
                Ok(Some(result))
            }
            Err(e) => {
                error!(
                    event = "restore.failed",
                    path = %path.display(),
                    error = %e,
                    "restore.failed"
                );
                let message = match &e {
                    Error::InvalidArchive { .. } => format!("Invalid backup: {e}"),
                    _ => format!("Restore failed: {e}"),
                };
                drop(guard);
                self.restore_progress
                    .publish(ProgressState::Failed { message });
                Err(e)
            }
        }
    }

    async fn run_restore(&self, path: &Path) -> Result<RestoreResult> {
        self.restore_progress
            .publish(ProgressState::running(0, "Parsing backup"));

        let archive = read_archive(path)?;
        let total = archive.messages.len();
        debug!(
            event = "phase.start",
            phase = "insert",
            messages_total = total,
            "phase.start"
        );
        let insert_started = Instant::now();

        for (index, message) in archive.messages.into_iter().enumerate() {
            self.restore_progress.publish(ProgressState::running(
                percent_ceil(index, total),
                format!("{index}/{total} messages"),
            ));
            self.store.insert_message(message.into_new_message()).await?;
        }

        if total > 0 {
            self.restore_progress.publish(ProgressState::running(
                100,
                format!("{total}/{total} messages"),
            ));
        }

        debug!(
            event = "phase.finish",
            phase = "insert",
            duration_ms = insert_started.elapsed().as_millis() as u64,
            messages_total = total,
            "phase.finish"
        );

        Ok(RestoreResult {
            messages_restored: total as u64,
        })
    }

    /// Backup files, newest first.
    pub fn backups(&self) -> Result<Vec<ArchiveFile>> {
        list_archives(&self.backup_dir)
    }

    /// Live listing of the backup directory, re-evaluated on every change.
    pub fn watch_backups(&self) -> Result<BackupsWatch> {
        watch_backup_dir(&self.backup_dir)
    }
}

/// Seconds left, extrapolated from the mean time per processed record.
fn remaining_seconds(elapsed_ms: u64, done: usize, total: usize) -> u64 {
    if done <= ESTIMATE_MIN_RECORDS {
        return 0;
    }
    let per_record = elapsed_ms as f64 / done as f64;
    let remaining_ms = (per_record * (total - done) as f64) as u64;
    remaining_ms / 1000
}

fn percent_ceil(index: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    (index * 100).div_ceil(total).min(100) as u8
}
