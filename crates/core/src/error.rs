use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("sqlite migrate error: {0}")]
    SqliteMigrate(#[from] sqlx::migrate::MigrateError),

    #[error("walkdir error: {0}")]
    Walkdir(#[from] walkdir::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid backup archive {path:?}: {message}")]
    InvalidArchive { path: PathBuf, message: String },

    #[error("directory watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("message store rejected insert: {message}")]
    StoreRejected { message: String },
}
