use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use tokio::sync::Mutex;

use crate::message::{Message, NewMessage};
use crate::store_db::open_store_db;
use crate::{Error, Result};

pub trait MessageStore {
    fn provider(&self) -> &'static str;

    /// Every message, ordered by `date_sent` ascending (ties by id), read as one
    /// consistent snapshot.
    fn list_messages_by_date_sent<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Message>>> + Send + 'a>>;

    /// Inserts a new row and returns its id.
    fn insert_message<'a>(
        &'a self,
        message: NewMessage,
    ) -> Pin<Box<dyn Future<Output = Result<i64>> + Send + 'a>>;

    fn count_messages<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    pub async fn open(db_path: &Path) -> Result<Self> {
        let pool = open_store_db(db_path).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl MessageStore for SqliteMessageStore {
    fn provider(&self) -> &'static str {
        "sqlite"
    }

    fn list_messages_by_date_sent<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Message>>> + Send + 'a>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            let rows = sqlx::query(
                r#"
                SELECT id, kind, address, date, date_sent, read, seen, status, body,
                       protocol, service_center, locked, sub_id
                FROM messages
                ORDER BY date_sent ASC, id ASC
                "#,
            )
            .fetch_all(&mut *tx)
            .await?;
            tx.commit().await?;

            rows.iter().map(message_from_row).collect()
        })
    }

    fn insert_message<'a>(
        &'a self,
        message: NewMessage,
    ) -> Pin<Box<dyn Future<Output = Result<i64>> + Send + 'a>> {
        Box::pin(async move {
            let res = sqlx::query(
                r#"
                INSERT INTO messages (
                    kind, address, date, date_sent, read, seen, status, body,
                    protocol, service_center, locked, sub_id
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(message.kind)
            .bind(&message.address)
            .bind(message.date)
            .bind(message.date_sent)
            .bind(message.read)
            .bind(message.seen)
            .bind(message.status)
            .bind(&message.body)
            .bind(message.protocol)
            .bind(message.service_center.as_deref())
            .bind(message.locked)
            .bind(message.sub_id)
            .execute(&self.pool)
            .await?;
            Ok(res.last_insert_rowid())
        })
    }

    fn count_messages<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + 'a>> {
        Box::pin(async move {
            let n: i64 = sqlx::query("SELECT COUNT(1) AS n FROM messages")
                .fetch_one(&self.pool)
                .await?
                .get("n");
            Ok(n.max(0) as u64)
        })
    }
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    Ok(Message {
        id: row.try_get("id")?,
        kind: row.try_get("kind")?,
        address: row.try_get("address")?,
        date: row.try_get("date")?,
        date_sent: row.try_get("date_sent")?,
        read: row.try_get("read")?,
        seen: row.try_get("seen")?,
        status: row.try_get("status")?,
        body: row.try_get("body")?,
        protocol: row.try_get("protocol")?,
        service_center: row.try_get("service_center")?,
        locked: row.try_get("locked")?,
        sub_id: row.try_get("sub_id")?,
    })
}

/// Store double used by tests. Inserts can be made to fail after a fixed
/// number of successes.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    inserted: AtomicUsize,
    reject_after: Option<usize>,
    inner: Mutex<Vec<Message>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(messages: Vec<NewMessage>) -> Self {
        let rows = messages
            .into_iter()
            .enumerate()
            .map(|(i, m)| m.into_message(i as i64 + 1))
            .collect();
        Self {
            inner: Mutex::new(rows),
            ..Self::default()
        }
    }

    /// The store accepts `n` inserts and rejects every one after that.
    pub fn reject_inserts_after(mut self, n: usize) -> Self {
        self.reject_after = Some(n);
        self
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.inner.lock().await.clone()
    }
}

impl MessageStore for InMemoryMessageStore {
    fn provider(&self) -> &'static str {
        "test.mem"
    }

    fn list_messages_by_date_sent<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Message>>> + Send + 'a>> {
        Box::pin(async move {
            let mut rows = self.inner.lock().await.clone();
            rows.sort_by_key(|m| (m.date_sent, m.id));
            Ok(rows)
        })
    }

    fn insert_message<'a>(
        &'a self,
        message: NewMessage,
    ) -> Pin<Box<dyn Future<Output = Result<i64>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(limit) = self.reject_after
                && self.inserted.load(Ordering::Relaxed) >= limit
            {
                return Err(Error::StoreRejected {
                    message: format!("insert limit reached ({limit})"),
                });
            }
            let mut rows = self.inner.lock().await;
            let id = rows.iter().map(|m| m.id).max().unwrap_or(0) + 1;
            rows.push(message.into_message(id));
            self.inserted.fetch_add(1, Ordering::Relaxed);
            Ok(id)
        })
    }

    fn count_messages<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + 'a>> {
        Box::pin(async move { Ok(self.inner.lock().await.len() as u64) })
    }
}
