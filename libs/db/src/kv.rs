//! Ordered key-value store abstraction.
//!
//! Engines are pluggable; the only behavioral requirement is that keys
//! compare bytewise and [`OrderedKeyValueStore::process_range`] visits them
//! in strictly ascending order. All methods take a [`DataContext`] so the
//! engine can namespace keys by `(instance, version)` without the caller
//! ever seeing a full key it did not build.

use std::sync::Arc;

use crate::context::DataContext;
use crate::error::{Error, Result};

/// Shared handle to an engine. Tiers that share an engine share the `Arc`.
pub type Store = Arc<dyn OrderedKeyValueStore>;

/// Callback invoked by [`OrderedKeyValueStore::process_range`] for each
/// `(full key, value)` pair, in ascending key order.
pub type RangeFn<'a> = dyn FnMut(&[u8], &[u8]) -> Result<()> + 'a;

/// A byte-ordered key-value store namespaced by storage contexts.
pub trait OrderedKeyValueStore: Send + Sync {
    /// Human-readable engine description, e.g. `"rocksdb (/path/to/db)"`.
    fn engine(&self) -> &str;

    /// Whether keys are returned in ascending bytewise order. Startup fails
    /// with [`Error::EngineNotOrdered`] for engines that answer `false`.
    fn ordered(&self) -> bool;

    /// Whether [`OrderedKeyValueStore::new_batch`] is supported. Checked at
    /// instance-creation time for data types that require batching.
    fn supports_batching(&self) -> bool {
        false
    }

    /// Read the value stored for `index` in `ctx`'s namespace.
    fn get(&self, ctx: &DataContext, index: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Store `value` for `index` in `ctx`'s namespace.
    fn put(&self, ctx: &DataContext, index: &[u8], value: &[u8]) -> Result<()>;

    /// Remove the key for `index` in `ctx`'s namespace. Removing an absent
    /// key is not an error.
    fn delete(&self, ctx: &DataContext, index: &[u8]) -> Result<()>;

    /// Invoke `f(full_key, value)` for every key of `ctx`'s
    /// `(instance, version)` whose index bytes lie in `[begin, end]`, in
    /// strictly ascending key order.
    ///
    /// Returns [`Error::Cancelled`] if the context is cancelled mid-scan;
    /// the current callback completes first.
    fn process_range(
        &self,
        ctx: &DataContext,
        begin: &[u8],
        end: &[u8],
        f: &mut RangeFn<'_>,
    ) -> Result<()>;

    /// Remove every key whose instance-id matches `ctx`, across all
    /// versions. Keys with version-id 0 are unversioned instance metadata
    /// and are only removed when `include_metadata` is set.
    fn delete_all(&self, ctx: &DataContext, include_metadata: bool) -> Result<()>;

    /// Start an atomic write batch in `ctx`'s namespace.
    ///
    /// The default implementation reports the engine as batch-incapable;
    /// engines override it together with
    /// [`OrderedKeyValueStore::supports_batching`].
    fn new_batch(&self, _ctx: &DataContext) -> Result<Box<dyn KvBatch>> {
        Err(Error::BatcherUnsupported(self.engine().to_string()))
    }
}

/// An in-flight write batch. Mutations are buffered until `commit`.
///
/// Atomicity is whatever the engine provides; the core only requires that a
/// committed batch is at least single-key atomic.
pub trait KvBatch: Send {
    fn put(&mut self, index: &[u8], value: &[u8]);
    fn delete(&mut self, index: &[u8]);
    fn commit(self: Box<Self>) -> Result<()>;
}
