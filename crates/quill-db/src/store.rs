//! The sharded conversation store.
//!
//! One LMDB shard per `hash(uid) % shard_count`; all of a user's rows live
//! on one shard. Reads are lock-free; per-uid mutating paths serialize on
//! a striped lock table because "read old row, delete its indexes, write
//! new row" must not interleave for the same user. The multi-user upsert
//! path takes no per-uid locks; callers must not race the same uid
//! through both paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::cache::ConversationCache;
use crate::config::{StoreOptions, SLOW_WRITE_THRESHOLD_MS};
use crate::conversation::{
    delete_conversation_indexes, iterate_rows, write_conversation, Channel, Conversation,
    ConversationType, SearchReq,
};
use crate::error::{StoreError, StoreResult};
use crate::key;
use crate::shard::{commit_all, Batch, ShardDb};

const LOCK_STRIPES: usize = 128;

/// Striped per-uid lock table.
struct UidLocks {
    stripes: Vec<Mutex<()>>,
}

impl UidLocks {
    fn new() -> Self {
        Self {
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn guard(&self, uid: &str) -> MutexGuard<'_, ()> {
        self.stripes[key::uid_hash(uid) as usize & (LOCK_STRIPES - 1)].lock()
    }
}

/// Mints row ids: monotonically increasing, seeded from the wall clock so
/// ids stay unique across restarts without a persisted counter.
struct IdAllocator {
    last: AtomicU64,
}

impl IdAllocator {
    fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    fn next(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let next = now.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }
}

/// Sharded persistent store of per-user recent conversations.
pub struct ConversationStore {
    opts: StoreOptions,
    shards: Vec<ShardDb>,
    cache: ConversationCache,
    locks: UidLocks,
    id_alloc: IdAllocator,
}

impl ConversationStore {
    /// Open or create the store under `opts.data_dir`. The shard count is
    /// fixed for the lifetime of the directory.
    pub fn open(opts: StoreOptions) -> StoreResult<Self> {
        opts.validate()?;
        std::fs::create_dir_all(&opts.data_dir)?;
        let mut shards = Vec::with_capacity(opts.shard_count as usize);
        for idx in 0..opts.shard_count {
            let path = opts.data_dir.join(format!("shard-{idx:03}"));
            shards.push(ShardDb::open(idx, &path, opts.map_size)?);
        }
        Ok(Self {
            opts,
            shards,
            cache: ConversationCache::new(),
            locks: UidLocks::new(),
            id_alloc: IdAllocator::new(),
        })
    }

    fn shard_for_uid(&self, uid: &str) -> &ShardDb {
        &self.shards[(key::uid_hash(uid) % self.shards.len() as u64) as usize]
    }

    fn shard_for_channel(&self, channel_id: &str, channel_type: u8) -> &ShardDb {
        let ch = key::channel_hash(channel_id, channel_type);
        &self.shards[(ch % self.shards.len() as u64) as usize]
    }

    fn conversation_id_by_channel(
        &self,
        uid: &str,
        channel_id: &str,
        channel_type: u8,
    ) -> StoreResult<Option<u64>> {
        let uh = key::uid_hash(uid);
        let ch = key::channel_hash(channel_id, channel_type);
        let Some(value) = self.shard_for_uid(uid).get(&key::channel_index_key(uh, ch))? else {
            return Ok(None);
        };
        let bytes: [u8; 8] = value
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::corrupted_key("channel index value of wrong width"))?;
        let id = u64::from_be_bytes(bytes);
        Ok((id != 0).then_some(id))
    }

    /// Upsert a heterogeneous batch of rows, grouped into one batch per
    /// user shard. Commit failures are logged and swallowed: each shard's
    /// batch either lands or does not, and there is no compensating
    /// rollback across shards.
    pub fn add_or_update_conversations(&self, rows: &[Conversation]) -> StoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut batches: HashMap<u32, Batch<'_>> = HashMap::new();
        for row in rows {
            let shard = self.shard_for_uid(&row.uid);
            let batch = batches
                .entry(shard.idx())
                .or_insert_with(|| shard.batch());
            self.upsert_row(row, batch)?;
        }
        self.set_channel_reverse_relations(rows)?;
        if let Err(err) = commit_all(batches.into_values().collect()) {
            error!(error = %err, "conversation commits failed");
            return Ok(());
        }
        self.cache.update_conversations_in_cache(rows);
        Ok(())
    }

    /// Like [`Self::add_or_update_conversations`] but skips any row whose
    /// logical key already exists.
    pub fn add_or_update_conversations_if_not_exist(
        &self,
        rows: &[Conversation],
    ) -> StoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut batches: HashMap<u32, Batch<'_>> = HashMap::new();
        for row in rows {
            let shard = self.shard_for_uid(&row.uid);
            let batch = batches
                .entry(shard.idx())
                .or_insert_with(|| shard.batch());
            if self.exist_conversation(&row.uid, &row.channel_id, row.channel_type)? {
                continue;
            }
            let mut row = row.clone();
            if row.id == 0 {
                row.id = self.id_alloc.next();
            }
            write_conversation(&row, batch);
        }
        commit_all(batches.into_values().collect())
    }

    /// Single-user upsert under the uid's stripe lock, committed durably.
    pub fn add_or_update_conversations_with_user(
        &self,
        uid: &str,
        rows: &[Conversation],
    ) -> StoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let _guard = self.locks.guard(uid);
        let started = self.opts.enable_cost.then(Instant::now);

        let shard = self.shard_for_uid(uid);
        let mut batch = shard.batch();
        for row in rows {
            self.upsert_row_for_uid(uid, row, &mut batch)?;
        }
        self.set_channel_reverse_relations(rows)?;
        batch.commit_sync()?;

        if let Some(started) = started {
            let cost = started.elapsed();
            if cost > Duration::from_millis(SLOW_WRITE_THRESHOLD_MS) {
                info!(
                    cost_ms = cost.as_millis() as u64,
                    uid,
                    rows = rows.len(),
                    "conversation upsert cost too long"
                );
            }
        }
        self.cache.update_conversations_in_cache(rows);
        Ok(())
    }

    fn upsert_row(&self, row: &Conversation, batch: &mut Batch<'_>) -> StoreResult<()> {
        self.upsert_row_for_uid(&row.uid, row, batch)
    }

    fn upsert_row_for_uid(
        &self,
        uid: &str,
        row: &Conversation,
        batch: &mut Batch<'_>,
    ) -> StoreResult<()> {
        let old = match self.get_conversation(uid, &row.channel_id, row.channel_type) {
            Ok(old) => Some(old),
            Err(StoreError::NotFound) => None,
            Err(err) => return Err(err),
        };
        let mut row = row.clone();
        match old {
            Some(mut old) => {
                // The reused id keeps its original created-at column and
                // index entry, so neither is deleted nor re-written.
                old.created_at = None;
                delete_conversation_indexes(&old, batch);
                row.id = old.id;
                row.created_at = None;
            }
            None => {
                if row.id == 0 {
                    row.id = self.id_alloc.next();
                }
            }
        }
        write_conversation(&row, batch);
        Ok(())
    }

    /// Record how far a user's inbox has been cleared.
    pub fn update_conversation_deleted_at_msg_seq(
        &self,
        uid: &str,
        channel_id: &str,
        channel_type: u8,
        deleted_at_msg_seq: u64,
    ) -> StoreResult<()> {
        let Some(id) = self.conversation_id_by_channel(uid, channel_id, channel_type)? else {
            return Ok(());
        };
        let uh = key::uid_hash(uid);
        let shard = self.shard_for_uid(uid);
        let mut batch = shard.batch();
        batch.set(
            key::primary_key(uh, id, key::col::DELETED_AT_MSG_SEQ),
            deleted_at_msg_seq.to_be_bytes(),
        );
        self.cache.invalidate_user_conversations(uid);
        batch.commit_sync()
    }

    /// Advance `read_to_msg_seq` if the stored value is smaller. Commits
    /// without fsync; durability rides on the OS flush.
    pub fn update_conversation_if_seq_greater_async(
        &self,
        uid: &str,
        channel_id: &str,
        channel_type: u8,
        read_to_msg_seq: u64,
    ) -> StoreResult<()> {
        let existing = match self.get_conversation(uid, channel_id, channel_type) {
            Ok(existing) => existing,
            Err(StoreError::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };
        if existing.read_to_msg_seq >= read_to_msg_seq {
            return Ok(());
        }
        let uh = key::uid_hash(uid);
        let shard = self.shard_for_uid(uid);
        let mut batch = shard.batch();
        batch.set(
            key::primary_key(uh, existing.id, key::col::READ_TO_MSG_SEQ),
            read_to_msg_seq.to_be_bytes(),
        );
        self.cache.invalidate_user_conversations(uid);
        batch.commit()
    }

    /// Fetch one row by its logical key.
    pub fn get_conversation(
        &self,
        uid: &str,
        channel_id: &str,
        channel_type: u8,
    ) -> StoreResult<Conversation> {
        let Some(id) = self.conversation_id_by_channel(uid, channel_id, channel_type)? else {
            return Err(StoreError::NotFound);
        };
        let uh = key::uid_hash(uid);
        let (low, high) = key::row_bounds(uh, id);
        let mut found = None;
        iterate_rows(self.shard_for_uid(uid), &low, &high, |row| {
            found = Some(row);
            false
        })?;
        found.ok_or(StoreError::NotFound)
    }

    /// Every row of one user.
    pub fn get_conversations(&self, uid: &str) -> StoreResult<Vec<Conversation>> {
        let uh = key::uid_hash(uid);
        let (low, high) = key::primary_bounds(uh);
        let mut rows = Vec::new();
        iterate_rows(self.shard_for_uid(uid), &low, &high, |row| {
            rows.push(row);
            true
        })?;
        Ok(rows)
    }

    /// Every row of one user with the given type, de-duplicated by channel.
    /// Duplicates indicate prior bugs and are logged when observed.
    pub fn get_conversations_by_type(
        &self,
        uid: &str,
        conversation_type: ConversationType,
    ) -> StoreResult<Vec<Conversation>> {
        let rows: Vec<Conversation> = self
            .get_conversations(uid)?
            .into_iter()
            .filter(|row| row.conversation_type == conversation_type)
            .collect();
        let before = rows.len();
        let rows = dedup_by_channel(rows);
        if rows.len() != before {
            warn!(
                uid,
                before,
                after = rows.len(),
                "duplicate conversations removed"
            );
        }
        Ok(rows)
    }

    /// The user's latest conversations, newest `updated_at` first, served
    /// from the cache when the same query was answered before.
    pub fn get_last_conversations(
        &self,
        uid: &str,
        conversation_type: ConversationType,
        since: u64,
        exclude_channel_types: &[u8],
        limit: usize,
    ) -> StoreResult<Vec<Conversation>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        if let Some(cached) = self.cache.get_last_conversations(
            uid,
            conversation_type,
            since,
            exclude_channel_types,
            limit,
        ) {
            return Ok(cached);
        }

        let mut rows = Vec::new();
        let uh = key::uid_hash(uid);
        let (low, high) = key::primary_bounds(uh);
        iterate_rows(self.shard_for_uid(uid), &low, &high, |row| {
            if row.conversation_type != conversation_type {
                return true;
            }
            if exclude_channel_types.contains(&row.channel_type) {
                return true;
            }
            if since == 0 || row.updated_at.map(|ts| ts >= since).unwrap_or(false) {
                rows.push(row);
            }
            true
        })?;

        // Newest first; rows without updated_at sort last.
        rows.sort_by(|a, b| b.updated_at.unwrap_or(0).cmp(&a.updated_at.unwrap_or(0)));
        if rows.len() > limit {
            rows.truncate(limit);
        }

        self.cache.set_last_conversations(
            uid,
            conversation_type,
            since,
            exclude_channel_types,
            limit,
            rows.clone(),
        );
        Ok(rows)
    }

    /// Row ids of the user's conversations updated at or after `since`,
    /// newest first, straight off the second index.
    pub fn last_conversation_ids(
        &self,
        uid: &str,
        since: u64,
        limit: usize,
    ) -> StoreResult<Vec<u64>> {
        let uh = key::uid_hash(uid);
        let (low, high) = key::second_index_bounds(uh, key::index_tag::UPDATED_AT, since);
        let mut ids = Vec::new();
        self.shard_for_uid(uid).scan_rev(&low, &high, |raw, _| {
            let (_, _, id) = key::parse_second_index_key(raw)?;
            ids.push(id);
            Ok(limit == 0 || ids.len() < limit)
        })?;

        let mut seen = std::collections::HashSet::new();
        let unique: Vec<u64> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        if unique.len() != ids.len() {
            warn!(
                uid,
                before = ids.len(),
                after = unique.len(),
                "duplicate ids in updated_at index"
            );
        }
        Ok(unique)
    }

    /// Local users holding a conversation with the channel, off the
    /// channel shard's reverse index.
    pub fn get_channel_conversation_local_users(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> StoreResult<Vec<String>> {
        let ch = key::channel_hash(channel_id, channel_type);
        let (low, high) = key::reverse_bounds(ch);
        let mut users = Vec::new();
        self.shard_for_channel(channel_id, channel_type)
            .scan(&low, &high, |raw, _| {
                users.push(key::parse_reverse_key(raw)?);
                Ok(true)
            })?;
        Ok(users)
    }

    pub fn exist_conversation(
        &self,
        uid: &str,
        channel_id: &str,
        channel_type: u8,
    ) -> StoreResult<bool> {
        Ok(self
            .conversation_id_by_channel(uid, channel_id, channel_type)?
            .is_some())
    }

    /// Delete the user's conversation with one channel, including every
    /// duplicate row a prior bug may have left for the same logical key.
    pub fn delete_conversation(
        &self,
        uid: &str,
        channel_id: &str,
        channel_type: u8,
    ) -> StoreResult<()> {
        let _guard = self.locks.guard(uid);
        let shard = self.shard_for_uid(uid);
        let mut batch = shard.batch();
        self.delete_conversation_rows(uid, channel_id, channel_type, &mut batch)?;
        self.delete_channel_reverse_relation(channel_id, channel_type, uid)?;
        batch.commit_sync()?;
        self.cache.invalidate_user_conversations(uid);
        Ok(())
    }

    /// Batched variant of [`Self::delete_conversation`].
    pub fn delete_conversations(&self, uid: &str, channels: &[Channel]) -> StoreResult<()> {
        if channels.is_empty() {
            return Ok(());
        }
        let _guard = self.locks.guard(uid);
        let shard = self.shard_for_uid(uid);
        let mut batch = shard.batch();
        for channel in channels {
            self.delete_conversation_rows(uid, &channel.channel_id, channel.channel_type, &mut batch)?;
        }
        self.delete_channel_reverse_relations(uid, channels)?;
        batch.commit_sync()?;
        self.cache.invalidate_user_conversations(uid);
        Ok(())
    }

    /// Page through conversations; with a uid this is
    /// [`Self::get_conversations`], otherwise a full scan across shards.
    pub fn search_conversation(&self, req: &SearchReq) -> StoreResult<Vec<Conversation>> {
        if let Some(uid) = req.uid.as_deref() {
            if !uid.is_empty() {
                return self.get_conversations(uid);
            }
        }
        let page = req.current_page.max(1);
        let (low, high) = key::primary_table_bounds();
        let mut rows = Vec::new();
        let mut current = 0usize;
        for shard in &self.shards {
            iterate_rows(shard, &low, &high, |row| {
                if current > req.limit * page {
                    return false;
                }
                current += 1;
                if current > (page - 1) * req.limit && current <= page * req.limit {
                    rows.push(row);
                }
                true
            })?;
        }
        Ok(rows)
    }

    /// All rows of one user matching a channel. Legacy duplicates make
    /// this a scan rather than an index lookup.
    fn conversations_by_channel(
        &self,
        uid: &str,
        channel_id: &str,
        channel_type: u8,
    ) -> StoreResult<Vec<Conversation>> {
        let uh = key::uid_hash(uid);
        let (low, high) = key::primary_bounds(uh);
        let mut rows = Vec::new();
        iterate_rows(self.shard_for_uid(uid), &low, &high, |row| {
            if row.channel_id == channel_id && row.channel_type == channel_type {
                rows.push(row);
            }
            true
        })?;
        Ok(rows)
    }

    fn delete_conversation_rows(
        &self,
        uid: &str,
        channel_id: &str,
        channel_type: u8,
        batch: &mut Batch<'_>,
    ) -> StoreResult<()> {
        let rows = self.conversations_by_channel(uid, channel_id, channel_type)?;
        let uh = key::uid_hash(uid);
        for row in &rows {
            delete_conversation_indexes(row, batch);
            let (low, high) = key::row_bounds(uh, row.id);
            batch.delete_range(low, high);
        }
        Ok(())
    }

    /// Maintain the channel-side reverse index for `rows`, one batch per
    /// channel shard, committed immediately without fsync.
    fn set_channel_reverse_relations(&self, rows: &[Conversation]) -> StoreResult<()> {
        let mut batches: HashMap<u32, Batch<'_>> = HashMap::new();
        for row in rows {
            let shard = self.shard_for_channel(&row.channel_id, row.channel_type);
            let batch = batches
                .entry(shard.idx())
                .or_insert_with(|| shard.batch());
            let ch = key::channel_hash(&row.channel_id, row.channel_type);
            batch.set(key::reverse_key(ch, &row.uid), Vec::new());
        }
        for batch in batches.into_values() {
            batch.commit()?;
        }
        Ok(())
    }

    fn delete_channel_reverse_relation(
        &self,
        channel_id: &str,
        channel_type: u8,
        uid: &str,
    ) -> StoreResult<()> {
        let shard = self.shard_for_channel(channel_id, channel_type);
        let mut batch = shard.batch();
        let ch = key::channel_hash(channel_id, channel_type);
        batch.delete(key::reverse_key(ch, uid));
        batch.commit_sync()
    }

    fn delete_channel_reverse_relations(&self, uid: &str, channels: &[Channel]) -> StoreResult<()> {
        let mut batches: HashMap<u32, Batch<'_>> = HashMap::new();
        for channel in channels {
            let shard = self.shard_for_channel(&channel.channel_id, channel.channel_type);
            let batch = batches
                .entry(shard.idx())
                .or_insert_with(|| shard.batch());
            let ch = key::channel_hash(&channel.channel_id, channel.channel_type);
            batch.delete(key::reverse_key(ch, uid));
        }
        commit_all(batches.into_values().collect())
    }
}

fn dedup_by_channel(rows: Vec<Conversation>) -> Vec<Conversation> {
    if rows.is_empty() {
        return rows;
    }
    let mut order: Vec<(String, u8)> = Vec::new();
    let mut latest: HashMap<(String, u8), Conversation> = HashMap::new();
    for row in rows {
        let key = (row.channel_id.clone(), row.channel_type);
        if !latest.contains_key(&key) {
            order.push(key.clone());
        }
        latest.insert(key, row);
    }
    order
        .into_iter()
        .filter_map(|key| latest.remove(&key))
        .collect()
}
