//! Sharded persistent conversation store for the quill messaging server.
//!
//! Maps `(uid, channel_id, channel_type)` to a [`Conversation`], the
//! user's cursor into that channel's message stream. Rows are decomposed
//! into per-column keys on an LMDB shard chosen by uid hash, with
//! secondary indexes for type/created/updated ranged queries and a
//! channel-side reverse index listing the local users of a channel. A
//! read-through cache fronts the hottest query.
//!
//! Cross-shard writes are best-effort: each shard's batch commits
//! atomically, but there is no rollback across shards. Per-uid mutations
//! serialize on a striped lock table; reads are lock-free.

pub mod cache;
pub mod config;
pub mod conversation;
pub mod error;
pub mod key;
pub mod store;

mod shard;

pub use cache::ConversationCache;
pub use config::StoreOptions;
pub use conversation::{Channel, Conversation, ConversationType, SearchReq};
pub use error::{StoreError, StoreResult};
pub use store::ConversationStore;
