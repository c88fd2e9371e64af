use serde::{Deserialize, Serialize};

/// A message row as read from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    /// Box / type code (inbox, sent, draft, ...).
    pub kind: i32,
    pub address: String,
    pub date: i64,
    pub date_sent: i64,
    pub read: bool,
    pub seen: bool,
    pub status: i32,
    pub body: String,
    pub protocol: i32,
    pub service_center: Option<String>,
    pub locked: bool,
    pub sub_id: i32,
}

/// The field set accepted by `MessageStore::insert_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub kind: i32,
    pub address: String,
    pub date: i64,
    pub date_sent: i64,
    pub read: bool,
    pub seen: bool,
    pub status: i32,
    pub body: String,
    pub protocol: i32,
    pub service_center: Option<String>,
    pub locked: bool,
    pub sub_id: i32,
}

impl NewMessage {
    pub fn into_message(self, id: i64) -> Message {
        Message {
            id,
            kind: self.kind,
            address: self.address,
            date: self.date,
            date_sent: self.date_sent,
            read: self.read,
            seen: self.seen,
            status: self.status,
            body: self.body,
            protocol: self.protocol,
            service_center: self.service_center,
            locked: self.locked,
            sub_id: self.sub_id,
        }
    }
}
