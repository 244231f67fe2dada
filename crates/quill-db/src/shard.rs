//! One LMDB environment per shard, plus the batch type that applies a set
//! of writes in a single transaction.
//!
//! Environments are opened `NO_SYNC`: committing a write transaction
//! publishes it to readers and to the OS page cache, and a durable commit
//! additionally forces a sync. This is the sync/no-sync split the async
//! update helpers rely on.

use std::ops::Bound;
use std::path::Path;

use heed::types::Bytes;
use heed::{Database, Env, EnvFlags, EnvOpenOptions};
use tracing::error;

use crate::error::StoreResult;

pub(crate) struct ShardDb {
    idx: u32,
    env: Env,
    db: Database<Bytes, Bytes>,
}

pub(crate) enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    DeleteRange { low: Vec<u8>, high: Vec<u8> },
}

/// Writes against one shard, committed atomically on that shard. There is
/// no cross-shard atomicity; see [`commit_all`].
pub(crate) struct Batch<'a> {
    shard: &'a ShardDb,
    ops: Vec<BatchOp>,
}

impl ShardDb {
    pub(crate) fn open(idx: u32, path: &Path, map_size: usize) -> StoreResult<Self> {
        std::fs::create_dir_all(path)?;
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .flags(EnvFlags::NO_SYNC)
                .open(path)?
        };
        let mut wtxn = env.write_txn()?;
        let db = env.create_database::<Bytes, Bytes>(&mut wtxn, None)?;
        wtxn.commit()?;
        Ok(Self { idx, env, db })
    }

    pub(crate) fn idx(&self) -> u32 {
        self.idx
    }

    pub(crate) fn batch(&self) -> Batch<'_> {
        Batch {
            shard: self,
            ops: Vec::new(),
        }
    }

    pub(crate) fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.db.get(&rtxn, key)?.map(|value| value.to_vec()))
    }

    /// Forward scan over `[low, high)`, yielding owned pairs to `f` until
    /// it returns false.
    pub(crate) fn scan(
        &self,
        low: &[u8],
        high: &[u8],
        mut f: impl FnMut(&[u8], &[u8]) -> StoreResult<bool>,
    ) -> StoreResult<()> {
        let rtxn = self.env.read_txn()?;
        let range = (Bound::Included(low), Bound::Excluded(high));
        for item in self.db.range(&rtxn, &range)? {
            let (key, value) = item?;
            if !f(key, value)? {
                break;
            }
        }
        Ok(())
    }

    /// Reverse scan over `[low, high)`.
    pub(crate) fn scan_rev(
        &self,
        low: &[u8],
        high: &[u8],
        mut f: impl FnMut(&[u8], &[u8]) -> StoreResult<bool>,
    ) -> StoreResult<()> {
        let rtxn = self.env.read_txn()?;
        let range = (Bound::Included(low), Bound::Excluded(high));
        for item in self.db.rev_range(&rtxn, &range)? {
            let (key, value) = item?;
            if !f(key, value)? {
                break;
            }
        }
        Ok(())
    }
}

impl<'a> Batch<'a> {
    pub(crate) fn set(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    pub(crate) fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    pub(crate) fn delete_range(&mut self, low: impl Into<Vec<u8>>, high: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::DeleteRange {
            low: low.into(),
            high: high.into(),
        });
    }

    /// Apply every op in one write transaction and commit. Durability rides
    /// on the OS flush; use [`Batch::commit_sync`] for a durable commit.
    pub(crate) fn commit(self) -> StoreResult<()> {
        let mut wtxn = self.shard.env.write_txn()?;
        for op in &self.ops {
            match op {
                BatchOp::Put { key, value } => {
                    self.shard.db.put(&mut wtxn, key, value)?;
                }
                BatchOp::Delete { key } => {
                    self.shard.db.delete(&mut wtxn, key)?;
                }
                BatchOp::DeleteRange { low, high } => {
                    let range = (
                        Bound::Included(low.as_slice()),
                        Bound::Excluded(high.as_slice()),
                    );
                    self.shard.db.delete_range(&mut wtxn, &range)?;
                }
            }
        }
        wtxn.commit()?;
        Ok(())
    }

    /// Commit and force the shard to disk.
    pub(crate) fn commit_sync(self) -> StoreResult<()> {
        let env = self.shard.env.clone();
        self.commit()?;
        env.force_sync()?;
        Ok(())
    }
}

/// Commit every batch durably; on failure keeps going and reports the
/// first error. Cross-shard atomicity is not provided.
pub(crate) fn commit_all(batches: Vec<Batch<'_>>) -> StoreResult<()> {
    let mut first_err = None;
    for batch in batches {
        if let Err(err) = batch.commit_sync() {
            error!(error = %err, "shard batch commit failed");
            if first_err.is_none() {
                first_err = Some(err);
            }
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
