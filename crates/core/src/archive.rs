use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::message::{Message, NewMessage};
use crate::{Error, Result};

pub const BACKUP_FILE_PREFIX: &str = "backup-";
pub const BACKUP_FILE_EXTENSION: &str = "json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archive {
    #[serde(default)]
    pub messages: Vec<ArchivedMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedMessage {
    #[serde(rename = "type")]
    pub type_: i32,
    pub address: String,
    pub date: i64,
    pub date_sent: i64,
    pub read: bool,
    pub status: i32,
    pub body: String,
    pub protocol: i32,
    pub service_center: Option<String>,
    pub locked: bool,
    pub sub_id: i32,
}

impl From<&Message> for ArchivedMessage {
    fn from(m: &Message) -> Self {
        Self {
            type_: m.kind,
            address: m.address.clone(),
            date: m.date,
            date_sent: m.date_sent,
            read: m.read,
            status: m.status,
            body: m.body.clone(),
            protocol: m.protocol,
            service_center: m.service_center.clone(),
            locked: m.locked,
            sub_id: m.sub_id,
        }
    }
}

impl ArchivedMessage {
    /// Restored rows are always marked seen.
    pub fn into_new_message(self) -> NewMessage {
        NewMessage {
            kind: self.type_,
            address: self.address,
            date: self.date,
            date_sent: self.date_sent,
            read: self.read,
            seen: true,
            status: self.status,
            body: self.body,
            protocol: self.protocol,
            service_center: self.service_center,
            locked: self.locked,
            sub_id: self.sub_id,
        }
    }
}

/// Metadata of a backup file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveFile {
    pub path: PathBuf,
    pub modified_ms: i64,
    pub message_count: u64,
    pub size_bytes: u64,
}

/// Pretty JSON, tab indented.
pub fn encode_archive(archive: &Archive) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    archive.serialize(&mut ser)?;
    Ok(out)
}

pub fn read_archive(path: &Path) -> Result<Archive> {
    let file = File::open(path).map_err(|e| Error::InvalidArchive {
        path: path.to_path_buf(),
        message: format!("open failed: {e}"),
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| Error::InvalidArchive {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Counts entries without materializing message bodies.
pub fn count_archive_messages(path: &Path) -> Result<u64> {
    #[derive(Deserialize)]
    struct Counted {
        #[serde(default)]
        messages: Vec<IgnoredAny>,
    }

    let file = File::open(path)?;
    let counted: Counted =
        serde_json::from_reader(BufReader::new(file)).map_err(|e| Error::InvalidArchive {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    Ok(counted.messages.len() as u64)
}

pub fn backup_file_name(at: DateTime<Local>) -> String {
    format!(
        "{BACKUP_FILE_PREFIX}{}.{BACKUP_FILE_EXTENSION}",
        at.format("%Y%m%d%H%M%S")
    )
}

/// First free path for a backup started at `at`. A same-second collision gets
/// a `-2`, `-3`, ... suffix.
pub fn next_backup_path(dir: &Path, at: DateTime<Local>) -> PathBuf {
    let first = dir.join(backup_file_name(at));
    if !first.exists() {
        return first;
    }
    let stamp = at.format("%Y%m%d%H%M%S");
    (2u32..)
        .map(|n| dir.join(format!("{BACKUP_FILE_PREFIX}{stamp}-{n}.{BACKUP_FILE_EXTENSION}")))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

/// Writes `bytes` to a temp file next to `path`, then renames it into place.
pub fn write_archive_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp.{}", std::process::id()));

    let res = (|| {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        drop(f);
        std::fs::rename(&tmp, path)
    })();

    if res.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    res
}

/// Backup files in `dir`, newest first. A missing directory lists as empty.
pub fn list_archives(dir: &Path) -> Result<Vec<ArchiveFile>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.starts_with('.') || !name.ends_with(&format!(".{BACKUP_FILE_EXTENSION}")) {
            continue;
        }

        let metadata = entry.metadata()?;
        let modified_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let message_count = match count_archive_messages(entry.path()) {
            Ok(n) => n,
            Err(e) => {
                debug!(
                    event = "archive.count_failed",
                    path = %entry.path().display(),
                    error = %e,
                    "archive.count_failed"
                );
                0
            }
        };

        out.push(ArchiveFile {
            path: entry.path().to_path_buf(),
            modified_ms,
            message_count,
            size_bytes: metadata.len(),
        });
    }

    sort_newest_first(&mut out);
    Ok(out)
}

pub fn sort_newest_first(files: &mut [ArchiveFile]) {
    files.sort_by(|a, b| {
        b.modified_ms
            .cmp(&a.modified_ms)
            .then_with(|| b.path.cmp(&a.path))
    });
}
