use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};

use chrono::Utc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// File of the run in progress. Events emitted while it is `None` are dropped.
static ACTIVE_LOG: Mutex<Option<BufWriter<File>>> = Mutex::new(None);
static SUBSCRIBER: Once = Once::new();

/// Writer handed to the JSON layer; forwards each formatted event to the
/// active run file.
struct ActiveLogWriter;

impl Write for ActiveLogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match ACTIVE_LOG.lock().unwrap_or_else(|e| e.into_inner()).as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match ACTIVE_LOG.lock().unwrap_or_else(|e| e.into_inner()).as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

fn env_filter(msgvault_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    msgvault_log
        .or(rust_log)
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("debug"))
}

fn install_subscriber() {
    SUBSCRIBER.call_once(|| {
        let filter = env_filter(
            std::env::var("MSGVAULT_LOG").ok().as_deref(),
            std::env::var("RUST_LOG").ok().as_deref(),
        );
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(|| ActiveLogWriter);
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init();
    });
}

/// Keeps the run log open. Dropping it flushes and syncs the file.
pub struct RunLogGuard {
    path: PathBuf,
}

impl RunLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        let taken = ACTIVE_LOG.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut file) = taken {
            let _ = file.flush();
            let _ = file.get_ref().sync_all();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Backup,
    Restore,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
        }
    }
}

/// Routes all tracing output to a fresh NDJSON file until the guard drops.
/// Only one run log can be open per process.
pub fn start_run_log(
    kind: RunKind,
    run_id: &str,
    data_dir: &Path,
) -> std::io::Result<RunLogGuard> {
    install_subscriber();

    let log_dir = resolve_log_dir(data_dir);
    std::fs::create_dir_all(&log_dir)?;
    let path = log_dir.join(format!(
        "run-{}-{}-{}.ndjson",
        kind.as_str(),
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        sanitize_filename_component(run_id)
    ));

    let mut active = ACTIVE_LOG.lock().unwrap_or_else(|e| e.into_inner());
    if active.is_some() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "run log already active",
        ));
    }
    let file = OpenOptions::new().create_new(true).write(true).open(&path)?;
    *active = Some(BufWriter::new(file));

    Ok(RunLogGuard { path })
}

fn resolve_log_dir(data_dir: &Path) -> PathBuf {
    if let Ok(v) = std::env::var("MSGVAULT_LOG_DIR") {
        return PathBuf::from(v);
    }
    data_dir.join("logs")
}

fn sanitize_filename_component(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_filter_precedence_is_msgvault_then_rust_log_then_default() {
        let f1 = env_filter(Some("info"), Some("debug"));
        let f2 = env_filter(None, Some("warn"));
        let f3 = env_filter(None, None);

        assert_eq!(f1.to_string(), "info");
        assert_eq!(f2.to_string(), "warn");
        assert_eq!(f3.to_string(), "debug");
    }

    #[test]
    fn file_name_components_are_sanitized() {
        assert_eq!(sanitize_filename_component("a b/c:d.e_f-1"), "a_b_c_d.e_f-1");
        assert_eq!(RunKind::Restore.as_str(), "restore");
    }

    #[test]
    fn run_log_is_ndjson_and_flushed_on_drop() {
        let temp = tempfile::tempdir().expect("create tempdir");
        let guard =
            start_run_log(RunKind::Backup, "run test/1", temp.path()).expect("start_run_log");

        let expected_dir = temp.path().join("logs");
        assert_eq!(guard.path().parent(), Some(expected_dir.as_path()));
        let name = guard.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("run-backup-"), "{name}");
        assert!(name.ends_with("-run_test_1.ndjson"), "{name}");
        assert_eq!(
            start_run_log(RunKind::Restore, "second", temp.path())
                .err()
                .map(|e| e.kind()),
            Some(std::io::ErrorKind::AlreadyExists)
        );

        tracing::info!(
            event = "run.start",
            kind = "backup",
            run_id = "run test/1",
            "run.start"
        );
        tracing::debug!(event = "phase.start", phase = "map", "phase.start");
        tracing::debug!(event = "phase.finish", phase = "save", "phase.finish");
        tracing::info!(
            event = "run.finish",
            kind = "backup",
            run_id = "run test/1",
            status = "succeeded",
            "run.finish"
        );

        let path = guard.path().to_path_buf();
        drop(guard);

        let text = std::fs::read_to_string(&path).expect("read run log");
        assert!(!text.trim().is_empty(), "run log is empty");

        let mut events = Vec::new();
        for line in text.lines() {
            let v: serde_json::Value = serde_json::from_str(line).expect("valid json line");
            let obj = v.as_object().expect("json object");
            assert!(obj.contains_key("timestamp"));
            assert!(obj.contains_key("level"));
            assert!(obj.contains_key("target"));
            let fields = obj
                .get("fields")
                .expect("fields")
                .as_object()
                .expect("fields object");
            if let Some(event) = fields.get("event").and_then(|e| e.as_str()) {
                events.push(event.to_string());
            }
        }
        for expected in ["run.start", "phase.start", "phase.finish", "run.finish"] {
            assert!(events.iter().any(|e| e == expected), "missing {expected}");
        }
    }
}
