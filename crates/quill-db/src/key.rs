//! Key encoding for the conversation tables.
//!
//! Every integer is big-endian so lexicographic order equals numeric
//! order; that is what makes "latest N by updated_at" a bounded reverse
//! scan over the second index. Users and channels are addressed by a
//! stable 64-bit CRC of their string identity, so the hashes persisted in
//! keys survive restarts. New columns must take unused tags and stay
//! optional on read, so rows written today remain readable after a
//! downgrade.
//!
//! ```text
//! primary   : 0x01 | uid_hash(8) | id(8) | column(1)         -> value
//! channel ix: 0x02 | uid_hash(8) | channel_hash(8)           -> id(8)
//! second ix : 0x03 | uid_hash(8) | tag(1) | value(8) | id(8) -> ()
//! reverse   : 0x04 | channel_hash(8) | uid bytes             -> ()
//! ```

use crc64fast_nvme::Digest;

use crate::error::{StoreError, StoreResult};

pub const TABLE_PRIMARY: u8 = 0x01;
pub const TABLE_CHANNEL_INDEX: u8 = 0x02;
pub const TABLE_SECOND_INDEX: u8 = 0x03;
pub const TABLE_REVERSE: u8 = 0x04;

/// Column tags of the primary table.
pub mod col {
    pub const UID: u8 = 1;
    pub const CHANNEL_ID: u8 = 2;
    pub const CHANNEL_TYPE: u8 = 3;
    pub const TYPE: u8 = 4;
    pub const UNREAD_COUNT: u8 = 5;
    pub const READ_TO_MSG_SEQ: u8 = 6;
    pub const CREATED_AT: u8 = 7;
    pub const UPDATED_AT: u8 = 8;
    pub const DELETED_AT_MSG_SEQ: u8 = 9;

    pub const MIN: u8 = 0x00;
    pub const MAX: u8 = 0xFF;
}

/// Tags of the second index.
pub mod index_tag {
    pub const TYPE: u8 = 1;
    pub const CREATED_AT: u8 = 2;
    pub const UPDATED_AT: u8 = 3;
}

/// Stable 64-bit hash of a uid; embedded in persisted keys.
pub fn uid_hash(uid: &str) -> u64 {
    let mut digest = Digest::new();
    digest.write(uid.as_bytes());
    digest.sum64()
}

/// Stable 64-bit hash of a `(channel_id, channel_type)` pair.
pub fn channel_hash(channel_id: &str, channel_type: u8) -> u64 {
    let mut digest = Digest::new();
    digest.write(channel_id.as_bytes());
    digest.write(&[channel_type]);
    digest.sum64()
}

pub fn primary_key(uid_hash: u64, id: u64, column: u8) -> [u8; 18] {
    let mut key = [0u8; 18];
    key[0] = TABLE_PRIMARY;
    key[1..9].copy_from_slice(&uid_hash.to_be_bytes());
    key[9..17].copy_from_slice(&id.to_be_bytes());
    key[17] = column;
    key
}

/// `[low, high)` covering every column of every row of one user.
pub fn primary_bounds(uid_hash: u64) -> ([u8; 18], [u8; 18]) {
    (
        primary_key(uid_hash, 0, col::MIN),
        primary_key(uid_hash, u64::MAX, col::MAX),
    )
}

/// `[low, high)` covering every column of one row.
pub fn row_bounds(uid_hash: u64, id: u64) -> ([u8; 18], [u8; 18]) {
    (
        primary_key(uid_hash, id, col::MIN),
        primary_key(uid_hash, id, col::MAX),
    )
}

/// `[low, high)` covering the whole primary table of a shard.
pub fn primary_table_bounds() -> ([u8; 18], [u8; 18]) {
    (
        primary_key(0, 0, col::MIN),
        primary_key(u64::MAX, u64::MAX, col::MAX),
    )
}

pub fn parse_primary_key(key: &[u8]) -> StoreResult<(u64, u64, u8)> {
    if key.len() != 18 || key[0] != TABLE_PRIMARY {
        return Err(StoreError::corrupted_key(format!(
            "primary key of length {}",
            key.len()
        )));
    }
    let uid_hash = u64::from_be_bytes(key[1..9].try_into().expect("8-byte slice"));
    let id = u64::from_be_bytes(key[9..17].try_into().expect("8-byte slice"));
    Ok((uid_hash, id, key[17]))
}

pub fn channel_index_key(uid_hash: u64, channel_hash: u64) -> [u8; 17] {
    let mut key = [0u8; 17];
    key[0] = TABLE_CHANNEL_INDEX;
    key[1..9].copy_from_slice(&uid_hash.to_be_bytes());
    key[9..17].copy_from_slice(&channel_hash.to_be_bytes());
    key
}

pub fn second_index_key(uid_hash: u64, tag: u8, value: u64, id: u64) -> [u8; 26] {
    let mut key = [0u8; 26];
    key[0] = TABLE_SECOND_INDEX;
    key[1..9].copy_from_slice(&uid_hash.to_be_bytes());
    key[9] = tag;
    key[10..18].copy_from_slice(&value.to_be_bytes());
    key[18..26].copy_from_slice(&id.to_be_bytes());
    key
}

/// `[low, high)` over one tag of one user's second index, starting at
/// `from_value`.
pub fn second_index_bounds(uid_hash: u64, tag: u8, from_value: u64) -> ([u8; 26], [u8; 26]) {
    (
        second_index_key(uid_hash, tag, from_value, 0),
        second_index_key(uid_hash, tag, u64::MAX, u64::MAX),
    )
}

pub fn parse_second_index_key(key: &[u8]) -> StoreResult<(u8, u64, u64)> {
    if key.len() != 26 || key[0] != TABLE_SECOND_INDEX {
        return Err(StoreError::corrupted_key(format!(
            "second index key of length {}",
            key.len()
        )));
    }
    let tag = key[9];
    let value = u64::from_be_bytes(key[10..18].try_into().expect("8-byte slice"));
    let id = u64::from_be_bytes(key[18..26].try_into().expect("8-byte slice"));
    Ok((tag, value, id))
}

pub fn reverse_key(channel_hash: u64, uid: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(9 + uid.len());
    key.push(TABLE_REVERSE);
    key.extend_from_slice(&channel_hash.to_be_bytes());
    key.extend_from_slice(uid.as_bytes());
    key
}

/// `[low, high)` covering every local user of one channel.
pub fn reverse_bounds(channel_hash: u64) -> (Vec<u8>, Vec<u8>) {
    let low = reverse_key(channel_hash, "");
    let mut high = Vec::with_capacity(9);
    if channel_hash == u64::MAX {
        high.push(TABLE_REVERSE + 1);
    } else {
        high.push(TABLE_REVERSE);
        high.extend_from_slice(&(channel_hash + 1).to_be_bytes());
    }
    (low, high)
}

pub fn parse_reverse_key(key: &[u8]) -> StoreResult<String> {
    if key.len() < 9 || key[0] != TABLE_REVERSE {
        return Err(StoreError::corrupted_key(format!(
            "reverse key of length {}",
            key.len()
        )));
    }
    String::from_utf8(key[9..].to_vec())
        .map_err(|_| StoreError::corrupted_key("reverse key uid is not utf-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_are_stable_and_distinct() {
        assert_eq!(uid_hash("alice"), uid_hash("alice"));
        assert_ne!(uid_hash("alice"), uid_hash("bob"));
        assert_ne!(channel_hash("room1", 1), channel_hash("room1", 2));
    }

    #[test]
    fn primary_key_roundtrip() {
        let uh = uid_hash("alice");
        let key = primary_key(uh, 42, col::UNREAD_COUNT);
        let (parsed_uh, id, column) = parse_primary_key(&key).expect("parse");
        assert_eq!(parsed_uh, uh);
        assert_eq!(id, 42);
        assert_eq!(column, col::UNREAD_COUNT);
    }

    #[test]
    fn second_index_orders_by_value_then_id() {
        let uh = uid_hash("alice");
        let early = second_index_key(uh, index_tag::UPDATED_AT, 100, 7);
        let late = second_index_key(uh, index_tag::UPDATED_AT, 200, 1);
        assert!(early < late, "larger timestamps must sort later");
        let (tag, value, id) = parse_second_index_key(&late).expect("parse");
        assert_eq!(tag, index_tag::UPDATED_AT);
        assert_eq!(value, 200);
        assert_eq!(id, 1);
    }

    #[test]
    fn reverse_bounds_cover_only_one_channel() {
        let ch = channel_hash("room1", 1);
        let (low, high) = reverse_bounds(ch);
        let alice = reverse_key(ch, "alice");
        assert!(low <= alice && alice < high);
        let other = reverse_key(channel_hash("room2", 1), "alice");
        assert!(other < low || other >= high);
        assert_eq!(parse_reverse_key(&alice).expect("parse"), "alice");
    }

    #[test]
    fn primary_bounds_isolate_users() {
        let (low, high) = primary_bounds(uid_hash("alice"));
        let own = primary_key(uid_hash("alice"), 5, col::UID);
        assert!(low <= own && own < high);
    }
}
