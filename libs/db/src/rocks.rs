//! RocksDB engine for the ordered key-value abstraction.
//!
//! One database, one default column family: keys are already namespaced by
//! the context's instance prefix, so range scans within an instance are
//! contiguous without per-instance column families.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};

use crate::context::DataContext;
use crate::error::{Error, Result};
use crate::kv::{KvBatch, OrderedKeyValueStore, RangeFn};
use crate::stats::LoadStats;
use crate::VersionId;

/// Deletions are flushed in groups of this many keys during instance purges.
const DELETE_BATCH_SIZE: usize = 10_000;

/// RocksDB-backed ordered store.
pub struct RocksStore {
    db: Arc<DB>,
    description: String,
    stats: Arc<LoadStats>,
}

impl RocksStore {
    /// Open (creating if missing) a database at `path`.
    pub fn open(path: &Path, stats: Arc<LoadStats>) -> Result<Arc<Self>> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.increase_parallelism(LoadStats::max_chunk_handlers() as i32);

        let db = DB::open(&opts, path)?;
        tracing::info!(path = %path.display(), "opened rocksdb store");

        Ok(Arc::new(Self {
            db: Arc::new(db),
            description: format!("rocksdb ({})", path.display()),
            stats,
        }))
    }

    pub fn path(&self) -> PathBuf {
        self.db.path().to_path_buf()
    }
}

impl OrderedKeyValueStore for RocksStore {
    fn engine(&self) -> &str {
        &self.description
    }

    fn ordered(&self) -> bool {
        true
    }

    fn supports_batching(&self) -> bool {
        true
    }

    fn get(&self, ctx: &DataContext, index: &[u8]) -> Result<Option<Vec<u8>>> {
        let key = ctx.key_from_index(index);
        let value = self.db.get(&key)?;
        self.stats
            .record_get(key.len(), value.as_ref().map_or(0, Vec::len));
        Ok(value)
    }

    fn put(&self, ctx: &DataContext, index: &[u8], value: &[u8]) -> Result<()> {
        let key = ctx.key_from_index(index);
        self.db.put(&key, value)?;
        self.stats.record_put(key.len(), value.len());
        Ok(())
    }

    fn delete(&self, ctx: &DataContext, index: &[u8]) -> Result<()> {
        let key = ctx.key_from_index(index);
        self.db.delete(&key)?;
        Ok(())
    }

    fn process_range(
        &self,
        ctx: &DataContext,
        begin: &[u8],
        end: &[u8],
        f: &mut RangeFn<'_>,
    ) -> Result<()> {
        let begin_key = ctx.key_from_index(begin);
        let end_key = ctx.key_from_index(end);

        let iter = self
            .db
            .iterator(IteratorMode::From(&begin_key, Direction::Forward));
        for item in iter {
            if ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let (key, value) = item?;
            if key.as_ref() > end_key.as_slice() {
                break;
            }
            // Keys of other versions interleave within the index range;
            // only this context's version is visited.
            if DataContext::version_from_key(&key)? != ctx.version_id() {
                continue;
            }
            self.stats.record_get(key.len(), value.len());
            f(&key, &value)?;
        }
        Ok(())
    }

    fn delete_all(&self, ctx: &DataContext, include_metadata: bool) -> Result<()> {
        let min_key = ctx.instance_min_key();
        let max_key = ctx.instance_max_key();

        let mut batch = WriteBatch::default();
        let mut pending = 0usize;
        let mut removed = 0usize;

        let iter = self
            .db
            .iterator(IteratorMode::From(&min_key, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            let past_instance = match &max_key {
                Some(max) => key.as_ref() >= max.as_slice(),
                None => !key.starts_with(&min_key),
            };
            if past_instance {
                break;
            }
            if !include_metadata && DataContext::version_from_key(&key)? == VersionId(0) {
                continue;
            }
            batch.delete(&key);
            pending += 1;
            removed += 1;
            if pending == DELETE_BATCH_SIZE {
                self.db.write(std::mem::take(&mut batch))?;
                pending = 0;
            }
        }
        if pending > 0 {
            self.db.write(batch)?;
        }

        tracing::debug!(
            instance = %ctx.instance_id(),
            removed,
            include_metadata,
            "purged instance keys"
        );
        Ok(())
    }

    fn new_batch(&self, ctx: &DataContext) -> Result<Box<dyn KvBatch>> {
        Ok(Box::new(RocksBatch {
            db: self.db.clone(),
            ctx: ctx.clone(),
            batch: WriteBatch::default(),
            stats: self.stats.clone(),
        }))
    }
}

/// WriteBatch-backed batch; buffered mutations become visible at commit.
struct RocksBatch {
    db: Arc<DB>,
    ctx: DataContext,
    batch: WriteBatch,
    stats: Arc<LoadStats>,
}

impl KvBatch for RocksBatch {
    fn put(&mut self, index: &[u8], value: &[u8]) {
        let key = self.ctx.key_from_index(index);
        self.stats.record_put(key.len(), value.len());
        self.batch.put(key, value);
    }

    fn delete(&mut self, index: &[u8]) {
        self.batch.delete(self.ctx.key_from_index(index));
    }

    fn commit(self: Box<Self>) -> Result<()> {
        self.db.write(self.batch)?;
        Ok(())
    }
}
