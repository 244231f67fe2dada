//! Conversation rows and their on-disk column mapping.
//!
//! A row is decomposed into one key per column under its `(uid_hash, id)`
//! prefix. A forward scan therefore observes column keys in `(id, column)`
//! order; the iteration protocol accumulates columns into a pending row
//! and yields it when the id changes, with a residual yield after the
//! loop. Unknown column tags are skipped so rows written by newer versions
//! stay readable.

use crate::error::{StoreError, StoreResult};
use crate::key::{self, col};
use crate::shard::{Batch, ShardDb};

/// Kind of inbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ConversationType {
    /// An ordinary chat conversation.
    #[default]
    Chat = 0,
    /// A command/system conversation.
    Cmd = 1,
}

impl From<u8> for ConversationType {
    fn from(value: u8) -> Self {
        match value {
            1 => ConversationType::Cmd,
            _ => ConversationType::Chat,
        }
    }
}

/// One user's cursor into one channel's message stream.
///
/// `(uid, channel_id, channel_type)` is the logical key; `id` is unique
/// within the user and reused across upserts. Timestamps are nanoseconds
/// since the epoch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    pub id: u64,
    pub uid: String,
    pub channel_id: String,
    pub channel_type: u8,
    pub conversation_type: ConversationType,
    pub unread_count: u32,
    pub read_to_msg_seq: u64,
    pub deleted_at_msg_seq: u64,
    pub created_at: Option<u64>,
    pub updated_at: Option<u64>,
}

impl Conversation {
    pub fn is_empty(&self) -> bool {
        self.id == 0 && self.uid.is_empty() && self.channel_id.is_empty()
    }
}

/// A channel identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel {
    pub channel_id: String,
    pub channel_type: u8,
}

impl Channel {
    pub fn new(channel_id: impl Into<String>, channel_type: u8) -> Self {
        Self {
            channel_id: channel_id.into(),
            channel_type,
        }
    }
}

/// Arguments of [`crate::ConversationStore::search_conversation`].
#[derive(Debug, Clone, Default)]
pub struct SearchReq {
    /// Restrict to one user; `None` scans every shard.
    pub uid: Option<String>,
    pub limit: usize,
    /// 1-based page index.
    pub current_page: usize,
}

fn read_u32(value: &[u8]) -> StoreResult<u32> {
    let bytes: [u8; 4] = value
        .try_into()
        .map_err(|_| StoreError::corrupted_key("u32 column of wrong width"))?;
    Ok(u32::from_be_bytes(bytes))
}

fn read_u64(value: &[u8]) -> StoreResult<u64> {
    let bytes: [u8; 8] = value
        .try_into()
        .map_err(|_| StoreError::corrupted_key("u64 column of wrong width"))?;
    Ok(u64::from_be_bytes(bytes))
}

fn apply_column(row: &mut Conversation, column: u8, value: &[u8]) -> StoreResult<()> {
    match column {
        col::UID => row.uid = String::from_utf8_lossy(value).into_owned(),
        col::CHANNEL_ID => row.channel_id = String::from_utf8_lossy(value).into_owned(),
        col::CHANNEL_TYPE => row.channel_type = value.first().copied().unwrap_or(0),
        col::TYPE => row.conversation_type = value.first().copied().unwrap_or(0).into(),
        col::UNREAD_COUNT => row.unread_count = read_u32(value)?,
        col::READ_TO_MSG_SEQ => row.read_to_msg_seq = read_u64(value)?,
        col::CREATED_AT => {
            let ts = read_u64(value)?;
            if ts > 0 {
                row.created_at = Some(ts);
            }
        }
        col::UPDATED_AT => {
            let ts = read_u64(value)?;
            if ts > 0 {
                row.updated_at = Some(ts);
            }
        }
        col::DELETED_AT_MSG_SEQ => row.deleted_at_msg_seq = read_u64(value)?,
        _ => {}
    }
    Ok(())
}

/// Scan `[low, high)` of the primary table, assembling rows column by
/// column and yielding each to `f`; `f` returning false stops the scan.
pub(crate) fn iterate_rows(
    shard: &ShardDb,
    low: &[u8],
    high: &[u8],
    mut f: impl FnMut(Conversation) -> bool,
) -> StoreResult<()> {
    let mut pending: Option<Conversation> = None;
    let mut stopped = false;
    shard.scan(low, high, |key, value| {
        let (_, id, column) = key::parse_primary_key(key)?;
        if pending.as_ref().map(|row| row.id) != Some(id) {
            if let Some(row) = pending.take() {
                if !f(row) {
                    stopped = true;
                    return Ok(false);
                }
            }
            pending = Some(Conversation {
                id,
                ..Conversation::default()
            });
        }
        if let Some(row) = pending.as_mut() {
            apply_column(row, column, value)?;
        }
        Ok(true)
    })?;
    if !stopped {
        if let Some(row) = pending {
            f(row);
        }
    }
    Ok(())
}

/// Write every column of `row` plus its index entries into `batch`.
/// Timestamp columns and their index entries are written only when set.
pub(crate) fn write_conversation(row: &Conversation, batch: &mut Batch<'_>) {
    let uh = key::uid_hash(&row.uid);
    let id = row.id;
    batch.set(key::primary_key(uh, id, col::UID), row.uid.as_bytes());
    batch.set(
        key::primary_key(uh, id, col::CHANNEL_ID),
        row.channel_id.as_bytes(),
    );
    batch.set(
        key::primary_key(uh, id, col::CHANNEL_TYPE),
        [row.channel_type],
    );
    batch.set(
        key::primary_key(uh, id, col::TYPE),
        [row.conversation_type as u8],
    );
    batch.set(
        key::primary_key(uh, id, col::UNREAD_COUNT),
        row.unread_count.to_be_bytes(),
    );
    batch.set(
        key::primary_key(uh, id, col::READ_TO_MSG_SEQ),
        row.read_to_msg_seq.to_be_bytes(),
    );
    if let Some(created_at) = row.created_at {
        batch.set(
            key::primary_key(uh, id, col::CREATED_AT),
            created_at.to_be_bytes(),
        );
    }
    if let Some(updated_at) = row.updated_at {
        batch.set(
            key::primary_key(uh, id, col::UPDATED_AT),
            updated_at.to_be_bytes(),
        );
    }
    write_conversation_indexes(row, batch);
}

pub(crate) fn write_conversation_indexes(row: &Conversation, batch: &mut Batch<'_>) {
    let uh = key::uid_hash(&row.uid);
    let ch = key::channel_hash(&row.channel_id, row.channel_type);
    batch.set(key::channel_index_key(uh, ch), row.id.to_be_bytes());
    batch.set(
        key::second_index_key(uh, key::index_tag::TYPE, row.conversation_type as u64, row.id),
        Vec::new(),
    );
    if let Some(created_at) = row.created_at {
        batch.set(
            key::second_index_key(uh, key::index_tag::CREATED_AT, created_at, row.id),
            Vec::new(),
        );
    }
    if let Some(updated_at) = row.updated_at {
        batch.set(
            key::second_index_key(uh, key::index_tag::UPDATED_AT, updated_at, row.id),
            Vec::new(),
        );
    }
}

/// Delete the index entries of an existing row. On upsert the caller
/// clears `created_at` first so the reused id keeps its original
/// created-at index entry.
pub(crate) fn delete_conversation_indexes(row: &Conversation, batch: &mut Batch<'_>) {
    let uh = key::uid_hash(&row.uid);
    let ch = key::channel_hash(&row.channel_id, row.channel_type);
    batch.delete(key::channel_index_key(uh, ch));
    batch.delete(key::second_index_key(
        uh,
        key::index_tag::TYPE,
        row.conversation_type as u64,
        row.id,
    ));
    if let Some(created_at) = row.created_at {
        batch.delete(key::second_index_key(
            uh,
            key::index_tag::CREATED_AT,
            created_at,
            row.id,
        ));
    }
    if let Some(updated_at) = row.updated_at {
        batch.delete(key::second_index_key(
            uh,
            key::index_tag::UPDATED_AT,
            updated_at,
            row.id,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_type_from_u8() {
        assert_eq!(ConversationType::from(0), ConversationType::Chat);
        assert_eq!(ConversationType::from(1), ConversationType::Cmd);
        assert_eq!(ConversationType::from(200), ConversationType::Chat);
    }

    #[test]
    fn empty_detection() {
        assert!(Conversation::default().is_empty());
        let row = Conversation {
            uid: "alice".into(),
            ..Conversation::default()
        };
        assert!(!row.is_empty());
    }
}
