//! Read-through cache for the hottest query, `get_last_conversations`.
//!
//! One entry per uid, holding the most recent query results keyed by the
//! full argument tuple. Write paths either smart-patch the cached lists in
//! place or drop the uid's entry entirely.

use std::collections::HashMap;

use dashmap::DashMap;

use crate::conversation::{Conversation, ConversationType};

/// Queries retained per user; inserting past the cap evicts an arbitrary
/// resident query.
const MAX_QUERIES_PER_USER: usize = 8;

#[derive(Clone, PartialEq, Eq, Hash)]
struct QueryKey {
    conversation_type: u8,
    since: u64,
    exclude_channel_types: Vec<u8>,
    limit: usize,
}

impl QueryKey {
    fn new(
        conversation_type: ConversationType,
        since: u64,
        exclude_channel_types: &[u8],
        limit: usize,
    ) -> Self {
        let mut exclude = exclude_channel_types.to_vec();
        exclude.sort_unstable();
        exclude.dedup();
        Self {
            conversation_type: conversation_type as u8,
            since,
            exclude_channel_types: exclude,
            limit,
        }
    }

    fn matches(&self, row: &Conversation) -> bool {
        if row.conversation_type as u8 != self.conversation_type {
            return false;
        }
        if self.exclude_channel_types.contains(&row.channel_type) {
            return false;
        }
        self.since == 0 || row.updated_at.unwrap_or(0) >= self.since
    }
}

#[derive(Default)]
struct UserEntry {
    queries: HashMap<QueryKey, Vec<Conversation>>,
}

/// Process-wide conversation cache, internally thread-safe.
#[derive(Default)]
pub struct ConversationCache {
    users: DashMap<String, UserEntry>,
}

impl ConversationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_last_conversations(
        &self,
        uid: &str,
        conversation_type: ConversationType,
        since: u64,
        exclude_channel_types: &[u8],
        limit: usize,
    ) -> Option<Vec<Conversation>> {
        let key = QueryKey::new(conversation_type, since, exclude_channel_types, limit);
        self.users
            .get(uid)
            .and_then(|entry| entry.queries.get(&key).cloned())
    }

    pub fn set_last_conversations(
        &self,
        uid: &str,
        conversation_type: ConversationType,
        since: u64,
        exclude_channel_types: &[u8],
        limit: usize,
        rows: Vec<Conversation>,
    ) {
        let key = QueryKey::new(conversation_type, since, exclude_channel_types, limit);
        let mut entry = self.users.entry(uid.to_string()).or_default();
        if entry.queries.len() >= MAX_QUERIES_PER_USER && !entry.queries.contains_key(&key) {
            if let Some(evict) = entry.queries.keys().next().cloned() {
                entry.queries.remove(&evict);
            }
        }
        entry.queries.insert(key, rows);
    }

    /// Smart patch: for every cached list of an affected uid, replace or
    /// insert the rows that match the list's query, re-sort by
    /// `updated_at` descending and re-truncate to the stored limit.
    pub fn update_conversations_in_cache(&self, rows: &[Conversation]) {
        let mut by_uid: HashMap<&str, Vec<&Conversation>> = HashMap::new();
        for row in rows {
            by_uid.entry(row.uid.as_str()).or_default().push(row);
        }
        for (uid, user_rows) in by_uid {
            let Some(mut entry) = self.users.get_mut(uid) else {
                continue;
            };
            for (key, list) in entry.queries.iter_mut() {
                for row in &user_rows {
                    if !key.matches(row) {
                        continue;
                    }
                    match list.iter_mut().find(|cached| {
                        cached.channel_id == row.channel_id
                            && cached.channel_type == row.channel_type
                    }) {
                        Some(cached) => *cached = (*row).clone(),
                        None => list.push((*row).clone()),
                    }
                }
                list.sort_by(|a, b| b.updated_at.unwrap_or(0).cmp(&a.updated_at.unwrap_or(0)));
                if key.limit > 0 && list.len() > key.limit {
                    list.truncate(key.limit);
                }
            }
        }
    }

    /// Drop every cached query for `uid`.
    pub fn invalidate_user_conversations(&self, uid: &str) {
        self.users.remove(uid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(uid: &str, channel_id: &str, updated_at: u64) -> Conversation {
        Conversation {
            id: 0,
            uid: uid.to_string(),
            channel_id: channel_id.to_string(),
            channel_type: 1,
            conversation_type: ConversationType::Chat,
            unread_count: 0,
            read_to_msg_seq: 0,
            deleted_at_msg_seq: 0,
            created_at: Some(updated_at),
            updated_at: Some(updated_at),
        }
    }

    #[test]
    fn miss_then_hit() {
        let cache = ConversationCache::new();
        assert!(cache
            .get_last_conversations("alice", ConversationType::Chat, 0, &[], 10)
            .is_none());
        cache.set_last_conversations(
            "alice",
            ConversationType::Chat,
            0,
            &[],
            10,
            vec![row("alice", "room1", 100)],
        );
        let hit = cache
            .get_last_conversations("alice", ConversationType::Chat, 0, &[], 10)
            .expect("cached");
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].channel_id, "room1");
    }

    #[test]
    fn exclude_set_order_does_not_split_entries() {
        let cache = ConversationCache::new();
        cache.set_last_conversations(
            "alice",
            ConversationType::Chat,
            0,
            &[2, 1],
            10,
            vec![row("alice", "room1", 100)],
        );
        assert!(cache
            .get_last_conversations("alice", ConversationType::Chat, 0, &[1, 2], 10)
            .is_some());
    }

    #[test]
    fn smart_patch_replaces_and_resorts() {
        let cache = ConversationCache::new();
        cache.set_last_conversations(
            "alice",
            ConversationType::Chat,
            0,
            &[],
            10,
            vec![row("alice", "room1", 200), row("alice", "room2", 100)],
        );
        cache.update_conversations_in_cache(&[row("alice", "room2", 300)]);
        let hit = cache
            .get_last_conversations("alice", ConversationType::Chat, 0, &[], 10)
            .expect("cached");
        assert_eq!(hit[0].channel_id, "room2");
        assert_eq!(hit[0].updated_at, Some(300));
        assert_eq!(hit[1].channel_id, "room1");
    }

    #[test]
    fn patch_respects_limit() {
        let cache = ConversationCache::new();
        cache.set_last_conversations(
            "alice",
            ConversationType::Chat,
            0,
            &[],
            2,
            vec![row("alice", "room1", 300), row("alice", "room2", 200)],
        );
        cache.update_conversations_in_cache(&[row("alice", "room3", 400)]);
        let hit = cache
            .get_last_conversations("alice", ConversationType::Chat, 0, &[], 2)
            .expect("cached");
        assert_eq!(hit.len(), 2);
        assert_eq!(hit[0].channel_id, "room3");
        assert_eq!(hit[1].channel_id, "room1");
    }

    #[test]
    fn invalidate_drops_user() {
        let cache = ConversationCache::new();
        cache.set_last_conversations(
            "alice",
            ConversationType::Chat,
            0,
            &[],
            10,
            vec![row("alice", "room1", 100)],
        );
        cache.invalidate_user_conversations("alice");
        assert!(cache
            .get_last_conversations("alice", ConversationType::Chat, 0, &[], 10)
            .is_none());
    }
}
