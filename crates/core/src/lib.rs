pub mod archive;
pub mod config;
mod engine;
mod error;
pub mod message;
pub mod progress;
pub mod run_log;
pub mod store;
mod store_db;
mod watch;

pub const APP_NAME: &str = "msgvault";

pub use archive::{Archive, ArchiveFile, ArchivedMessage};
pub use engine::{BackupEngine, BackupResult, EngineConfig, RestoreResult};
pub use error::{Error, Result};
pub use message::{Message, NewMessage};
pub use progress::{
    ProgressChannel, ProgressSink, ProgressState, ProgressSubscription, RecordingSink,
    SampledSink, SinkId,
};
pub use store::{InMemoryMessageStore, MessageStore, SqliteMessageStore};
pub use watch::BackupsWatch;
