use std::future::Future;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use msgvault_core::config::{Settings, load_settings, parse_settings, save_settings, to_toml};
use msgvault_core::run_log::{RunKind, start_run_log};
use msgvault_core::{
    APP_NAME, ArchiveFile, BackupEngine, EngineConfig, MessageStore, ProgressChannel,
    ProgressSink, ProgressState, SampledSink, SqliteMessageStore,
};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "msgvault")]
#[command(about = "Back up and restore a local message store as JSON archives", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    events: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
    Messages {
        #[command(subcommand)]
        cmd: MessagesCmd,
    },
    Backups {
        #[command(subcommand)]
        cmd: BackupsCmd,
    },
    Backup {
        #[command(subcommand)]
        cmd: BackupCmd,
    },
    Restore {
        #[command(subcommand)]
        cmd: RestoreCmd,
    },
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get,
    Set,
}

#[derive(Subcommand)]
enum MessagesCmd {
    Count,
}

#[derive(Subcommand)]
enum BackupsCmd {
    List,
    Watch,
}

#[derive(Subcommand)]
enum BackupCmd {
    Run,
}

#[derive(Subcommand)]
enum RestoreCmd {
    Run {
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| std::env::var("MSGVAULT_CONFIG_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_config_dir);
    let data_dir = cli
        .data_dir
        .or_else(|| std::env::var("MSGVAULT_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_data_dir);

    match cli.cmd {
        Command::Settings { cmd } => match cmd {
            SettingsCmd::Get => settings_get(&config_dir, &data_dir, cli.json),
            SettingsCmd::Set => settings_set(&config_dir, cli.json),
        },
        Command::Messages { cmd } => match cmd {
            MessagesCmd::Count => messages_count(&config_dir, &data_dir, cli.json).await,
        },
        Command::Backups { cmd } => match cmd {
            BackupsCmd::List => backups_list(&config_dir, &data_dir, cli.json).await,
            BackupsCmd::Watch => backups_watch(&config_dir, &data_dir, cli.json).await,
        },
        Command::Backup { cmd } => match cmd {
            BackupCmd::Run => backup_run(&config_dir, &data_dir, cli.json, cli.events).await,
        },
        Command::Restore { cmd } => match cmd {
            RestoreCmd::Run { file } => {
                restore_run(&config_dir, &data_dir, file, cli.json, cli.events).await
            }
        },
    }
}

fn settings_get(config_dir: &Path, data_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = load_settings(config_dir).map_err(map_core_err)?;
    let backup_dir = settings.backup_dir(data_dir);
    let db_path = settings.db_path(data_dir);

    if json {
        println!(
            "{}",
            serde_json::json!({
                "settings": settings,
                "resolved": {
                    "backupDir": backup_dir,
                    "dbPath": db_path,
                }
            })
        );
    } else {
        let text = to_toml(&settings).map_err(map_core_err)?;
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
        println!();
        println!("backupDir={}", backup_dir.display());
        println!("dbPath={}", db_path.display());
    }
    Ok(())
}

fn settings_set(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| CliError::new("config.read_failed", e.to_string()))?;
    let settings = parse_settings(&input).map_err(map_core_err)?;
    save_settings(config_dir, &settings).map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "settings": settings }));
    }
    Ok(())
}

async fn open_engine(
    config_dir: &Path,
    data_dir: &Path,
) -> Result<(Settings, BackupEngine<SqliteMessageStore>), CliError> {
    let settings = load_settings(config_dir).map_err(map_core_err)?;
    let store = SqliteMessageStore::open(&settings.db_path(data_dir))
        .await
        .map_err(map_core_err)?;
    let engine = BackupEngine::new(
        store,
        EngineConfig {
            backup_dir: settings.backup_dir(data_dir),
        },
    );
    Ok((settings, engine))
}

async fn messages_count(config_dir: &Path, data_dir: &Path, json: bool) -> Result<(), CliError> {
    let (_, engine) = open_engine(config_dir, data_dir).await?;
    let n = engine
        .store()
        .count_messages()
        .await
        .map_err(map_core_err)?;
    if json {
        println!("{}", serde_json::json!({ "messagesTotal": n }));
    } else {
        println!("messagesTotal={n}");
    }
    Ok(())
}

async fn backups_list(config_dir: &Path, data_dir: &Path, json: bool) -> Result<(), CliError> {
    let (_, engine) = open_engine(config_dir, data_dir).await?;
    let backups = engine.backups().map_err(map_core_err)?;
    print_backups(&backups, json);
    Ok(())
}

async fn backups_watch(config_dir: &Path, data_dir: &Path, json: bool) -> Result<(), CliError> {
    let (_, engine) = open_engine(config_dir, data_dir).await?;
    let mut watch = engine.watch_backups().map_err(map_core_err)?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            next = watch.next() => match next {
                Some(backups) => print_backups(&backups, json),
                None => return Ok(()),
            },
        }
    }
}

fn print_backups(backups: &[ArchiveFile], json: bool) {
    if json {
        println!("{}", serde_json::json!({ "backups": backups }));
    } else {
        for b in backups {
            println!(
                "{}\tmodifiedMs={}\tmessages={}\tbytes={}",
                b.path.display(),
                b.modified_ms,
                b.message_count,
                b.size_bytes
            );
        }
        println!();
    }
}

/// NDJSON event stream written by `--events`.
struct EventWriter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl EventWriter {
    fn stdout() -> Arc<Self> {
        Arc::new(Self {
            out: Mutex::new(Box::new(std::io::stdout())),
        })
    }

    fn emit(&self, line: &serde_json::Value) {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        let _ = writeln!(out, "{line}");
        let _ = out.flush();
    }

    fn task_state(&self, task_id: &str, kind: RunKind, state: &str, extra: serde_json::Value) {
        let mut line = serde_json::json!({
            "type": "task.state",
            "taskId": task_id,
            "kind": kind.as_str(),
            "state": state,
        });
        if let (Some(obj), serde_json::Value::Object(extra)) = (line.as_object_mut(), extra) {
            obj.extend(extra);
        }
        self.emit(&line);
    }
}

struct NdjsonProgressSink {
    task_id: String,
    kind: RunKind,
    events: Arc<EventWriter>,
}

impl ProgressSink for NdjsonProgressSink {
    fn on_progress(&self, progress: &ProgressState) {
        self.events.emit(&serde_json::json!({
            "type": "task.progress",
            "taskId": self.task_id,
            "kind": self.kind.as_str(),
            "progress": progress,
        }));
    }
}

/// Runs `op` with `task.state` and sampled `task.progress` lines around it.
/// Emits `running` first and `failed` if `op` fails; the caller reports
/// success since the payload differs per kind.
async fn run_with_events<T>(
    events: Option<&Arc<EventWriter>>,
    channel: &ProgressChannel,
    task_id: &str,
    kind: RunKind,
    every: Duration,
    running_extra: serde_json::Value,
    op: impl Future<Output = msgvault_core::Result<Option<T>>>,
) -> msgvault_core::Result<Option<T>> {
    let Some(events) = events else {
        return op.await;
    };

    events.task_state(task_id, kind, "running", running_extra);
    let sink = NdjsonProgressSink {
        task_id: task_id.to_string(),
        kind,
        events: events.clone(),
    };
    let sink_id = channel.add_sink(Arc::new(SampledSink::new(Arc::new(sink), every)));
    let res = op.await;
    channel.remove_sink(sink_id);

    if let Err(e) = &res {
        let message = match channel.current() {
            ProgressState::Failed { message } => message,
            _ => e.to_string(),
        };
        events.task_state(
            task_id,
            kind,
            "failed",
            serde_json::json!({ "message": message }),
        );
    }
    res
}

async fn backup_run(
    config_dir: &Path,
    data_dir: &Path,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    let (settings, engine) = open_engine(config_dir, data_dir).await?;
    let events = events.then(EventWriter::stdout);

    let task_id = format!("tsk_{}", uuid::Uuid::new_v4());
    let run_log = start_run_log(RunKind::Backup, &task_id, data_dir)
        .map_err(|e| CliError::new("log.write_failed", e.to_string()))?;
    tracing::info!(
        event = "run.start",
        kind = "backup",
        run_id = %task_id,
        backup_dir = %engine.backup_dir().display(),
        log_path = %run_log.path().display(),
        "run.start"
    );

    let started = Instant::now();
    let res = run_with_events(
        events.as_ref(),
        engine.backup_progress(),
        &task_id,
        RunKind::Backup,
        settings.sample_interval(),
        serde_json::json!({}),
        engine.perform_backup(),
    )
    .await;

    tracing::info!(
        event = "run.finish",
        kind = "backup",
        run_id = %task_id,
        duration_ms = started.elapsed().as_millis() as u64,
        status = if res.is_ok() { "succeeded" } else { "failed" },
        "run.finish"
    );

    let res = res.map_err(map_core_err)?;
    let Some(res) = res else {
        return Err(CliError::retryable(
            "task.busy",
            "another backup or restore is running",
        ));
    };

    if let Some(events) = &events {
        events.task_state(
            &task_id,
            RunKind::Backup,
            "succeeded",
            serde_json::json!({ "path": res.path }),
        );
        return Ok(());
    }

    if json {
        println!(
            "{}",
            serde_json::to_string(&res).map_err(|e| CliError::new("json.failed", e.to_string()))?
        );
    } else {
        println!("path={}", res.path.display());
        println!(
            "messagesTotal={} bytesWritten={}",
            res.messages_total, res.bytes_written
        );
    }
    Ok(())
}

async fn restore_run(
    config_dir: &Path,
    data_dir: &Path,
    file: PathBuf,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    let (settings, engine) = open_engine(config_dir, data_dir).await?;
    let events = events.then(EventWriter::stdout);

    let task_id = format!("tsk_{}", uuid::Uuid::new_v4());
    let run_log = start_run_log(RunKind::Restore, &task_id, data_dir)
        .map_err(|e| CliError::new("log.write_failed", e.to_string()))?;
    tracing::info!(
        event = "run.start",
        kind = "restore",
        run_id = %task_id,
        path = %file.display(),
        log_path = %run_log.path().display(),
        "run.start"
    );

    let started = Instant::now();
    let res = run_with_events(
        events.as_ref(),
        engine.restore_progress(),
        &task_id,
        RunKind::Restore,
        settings.sample_interval(),
        serde_json::json!({ "path": file }),
        engine.perform_restore(&file),
    )
    .await;

    tracing::info!(
        event = "run.finish",
        kind = "restore",
        run_id = %task_id,
        duration_ms = started.elapsed().as_millis() as u64,
        status = if res.is_ok() { "succeeded" } else { "failed" },
        "run.finish"
    );

    let res = res.map_err(map_core_err)?;
    let Some(res) = res else {
        return Err(CliError::retryable(
            "task.busy",
            "another backup or restore is running",
        ));
    };

    if let Some(events) = &events {
        events.task_state(
            &task_id,
            RunKind::Restore,
            "succeeded",
            serde_json::json!({ "messagesRestored": res.messages_restored }),
        );
        return Ok(());
    }

    if json {
        println!(
            "{}",
            serde_json::to_string(&res).map_err(|e| CliError::new("json.failed", e.to_string()))?
        );
    } else {
        println!("messagesRestored={}", res.messages_restored);
    }
    Ok(())
}

fn default_config_dir() -> PathBuf {
    if let Ok(v) = std::env::var("XDG_CONFIG_HOME")
        && !v.is_empty()
    {
        return PathBuf::from(v).join(APP_NAME);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config").join(APP_NAME)
}

fn default_data_dir() -> PathBuf {
    if let Ok(v) = std::env::var("XDG_DATA_HOME")
        && !v.is_empty()
    {
        return PathBuf::from(v).join(APP_NAME);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".local")
        .join("share")
        .join(APP_NAME)
}

fn map_core_err(e: msgvault_core::Error) -> CliError {
    match e {
        msgvault_core::Error::InvalidConfig { message } => CliError::new("config.invalid", message),
        msgvault_core::Error::InvalidArchive { path, message } => CliError::new(
            "archive.invalid",
            format!("{}: {message}", path.display()),
        ),
        msgvault_core::Error::Io(e) => CliError::retryable("io.failed", e.to_string()),
        msgvault_core::Error::Sqlite(e) => CliError::new("db.failed", e.to_string()),
        msgvault_core::Error::StoreRejected { message } => {
            CliError::new("store.rejected", message)
        }
        other => CliError::new("unknown", other.to_string()),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgvault_core::{InMemoryMessageStore, NewMessage};
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn lines(&self) -> Vec<serde_json::Value> {
            String::from_utf8(self.0.lock().unwrap().clone())
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    fn capture() -> (Arc<EventWriter>, SharedBuf) {
        let buf = SharedBuf::default();
        let events = Arc::new(EventWriter {
            out: Mutex::new(Box::new(buf.clone())),
        });
        (events, buf)
    }

    fn message(i: i64) -> NewMessage {
        NewMessage {
            kind: 1,
            address: "+15550100".to_string(),
            date: i,
            date_sent: i,
            read: false,
            seen: false,
            status: -1,
            body: format!("m{i}"),
            protocol: 0,
            service_center: None,
            locked: false,
            sub_id: 1,
        }
    }

    fn progress_states(lines: &[serde_json::Value]) -> Vec<&str> {
        lines
            .iter()
            .filter(|l| l["type"] == "task.progress")
            .filter_map(|l| l["progress"]["state"].as_str())
            .collect()
    }

    #[tokio::test]
    async fn backup_events_stream_progress_until_idle() {
        let temp = TempDir::new().unwrap();
        let engine = BackupEngine::new(
            InMemoryMessageStore::with_messages((0..5).map(message).collect()),
            EngineConfig {
                backup_dir: temp.path().join("Backups"),
            },
        );
        let (events, buf) = capture();

        let res = run_with_events(
            Some(&events),
            engine.backup_progress(),
            "tsk_test",
            RunKind::Backup,
            Duration::ZERO,
            serde_json::json!({}),
            engine.perform_backup(),
        )
        .await
        .unwrap();
        assert!(res.is_some());

        let lines = buf.lines();
        assert_eq!(lines[0]["type"], "task.state");
        assert_eq!(lines[0]["state"], "running");
        assert!(lines.iter().all(|l| l["taskId"] == "tsk_test" && l["kind"] == "backup"));
        assert!(lines.iter().any(|l| {
            l["progress"]["state"] == "running" && l["progress"]["percent"] == 100
        }));
        assert_eq!(progress_states(&lines).last(), Some(&"idle"));
        assert!(!lines.iter().any(|l| l["state"] == "failed"));

        // The sink is gone once the run returns.
        let before = buf.lines().len();
        engine.backup_progress().publish(ProgressState::running(1, "later"));
        assert_eq!(buf.lines().len(), before);
    }

    #[tokio::test]
    async fn failed_backup_emits_failed_task_state() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let engine = BackupEngine::new(
            InMemoryMessageStore::with_messages(vec![message(1)]),
            EngineConfig {
                backup_dir: blocker.join("Backups"),
            },
        );
        let (events, buf) = capture();

        let res = run_with_events(
            Some(&events),
            engine.backup_progress(),
            "tsk_fail",
            RunKind::Backup,
            Duration::ZERO,
            serde_json::json!({}),
            engine.perform_backup(),
        )
        .await;
        assert!(res.is_err());

        let lines = buf.lines();
        assert_eq!(progress_states(&lines).last(), Some(&"failed"));
        let last = lines.last().unwrap();
        assert_eq!(last["type"], "task.state");
        assert_eq!(last["state"], "failed");
        assert!(
            last["message"]
                .as_str()
                .unwrap()
                .starts_with("Backup failed:"),
            "{last}"
        );
    }

    #[tokio::test]
    async fn invalid_restore_emits_failed_task_state() {
        let temp = TempDir::new().unwrap();
        let bad = temp.path().join("bad.json");
        std::fs::write(&bad, "[").unwrap();
        let engine = BackupEngine::new(
            InMemoryMessageStore::new(),
            EngineConfig {
                backup_dir: temp.path().join("Backups"),
            },
        );
        let (events, buf) = capture();

        let res = run_with_events(
            Some(&events),
            engine.restore_progress(),
            "tsk_restore",
            RunKind::Restore,
            Duration::ZERO,
            serde_json::json!({ "path": bad }),
            engine.perform_restore(&bad),
        )
        .await;
        assert!(res.is_err());

        let lines = buf.lines();
        assert_eq!(lines[0]["path"], serde_json::json!(bad));
        let last = lines.last().unwrap();
        assert_eq!(last["state"], "failed");
        assert!(last["message"].as_str().unwrap().starts_with("Invalid backup:"));
    }
}
