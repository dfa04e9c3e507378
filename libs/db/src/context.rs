//! Storage contexts: per-(instance, version) key namespacing and mutexes.
//!
//! Every key handed to an engine is built as
//!
//! ```text
//! instance-id (4B BE) | type-specific index bytes | version-id (4B BE)
//! ```
//!
//! so all keys of one instance are contiguous, and within an instance the
//! index bytes dominate the ordering. A context also carries the request's
//! cancellation flag and hands out the write mutex for its
//! `(instance, version)` pair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use lazy_static::lazy_static;

use crate::{Error, InstanceId, Result, VersionId};

/// Byte length of the instance-id prefix and the version-id suffix.
pub const KEY_PREFIX_LEN: usize = 4;
pub const KEY_SUFFIX_LEN: usize = 4;

lazy_static! {
    // Process-wide striped lock table. Entries are created on first use and
    // never removed; the number of live (instance, version) pairs is small.
    static ref WRITE_MUTEXES: DashMap<(u32, u32), Arc<Mutex<()>>> = DashMap::new();
}

// ============================================================================
// Cancel
// ============================================================================

/// Cloneable cancellation flag inherited from the request.
///
/// Engines check it between range-scan callbacks; batch writers check it
/// between commits. Cancellation never rolls back applied writes.
#[derive(Debug, Clone, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ============================================================================
// DataContext
// ============================================================================

/// Handle bundling `(instance-id, version-id, cancellation)`; the unit of
/// key namespacing and write serialization.
#[derive(Debug, Clone)]
pub struct DataContext {
    instance_id: InstanceId,
    version_id: VersionId,
    cancel: Cancel,
}

impl DataContext {
    pub fn new(instance_id: InstanceId, version_id: VersionId) -> Self {
        Self {
            instance_id,
            version_id,
            cancel: Cancel::new(),
        }
    }

    /// Attach a request-scoped cancellation flag.
    pub fn with_cancel(mut self, cancel: Cancel) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn version_id(&self) -> VersionId {
        self.version_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Build the full storage key for type-specific index bytes.
    pub fn key_from_index(&self, index: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(KEY_PREFIX_LEN + index.len() + KEY_SUFFIX_LEN);
        key.extend_from_slice(&self.instance_id.0.to_be_bytes());
        key.extend_from_slice(index);
        key.extend_from_slice(&self.version_id.0.to_be_bytes());
        key
    }

    /// Recover the index bytes from a full key.
    ///
    /// Fails with [`Error::MalformedKey`] when the key is too short or its
    /// instance prefix / version suffix does not match this context.
    pub fn index_from_key<'a>(&self, key: &'a [u8]) -> Result<&'a [u8]> {
        if key.len() < KEY_PREFIX_LEN + KEY_SUFFIX_LEN {
            return Err(Error::MalformedKey(format!(
                "key length {} below minimum {}",
                key.len(),
                KEY_PREFIX_LEN + KEY_SUFFIX_LEN
            )));
        }
        if key[..KEY_PREFIX_LEN] != self.instance_id.0.to_be_bytes() {
            return Err(Error::MalformedKey(format!(
                "key instance prefix does not match instance {}",
                self.instance_id
            )));
        }
        let suffix_at = key.len() - KEY_SUFFIX_LEN;
        if key[suffix_at..] != self.version_id.0.to_be_bytes() {
            return Err(Error::MalformedKey(format!(
                "key version suffix does not match version {}",
                self.version_id
            )));
        }
        Ok(&key[KEY_PREFIX_LEN..suffix_at])
    }

    /// The version-id stored in a full key's suffix, regardless of whether
    /// it matches this context. Used by engines to filter range scans.
    pub fn version_from_key(key: &[u8]) -> Result<VersionId> {
        if key.len() < KEY_PREFIX_LEN + KEY_SUFFIX_LEN {
            return Err(Error::MalformedKey(format!(
                "key length {} below minimum {}",
                key.len(),
                KEY_PREFIX_LEN + KEY_SUFFIX_LEN
            )));
        }
        let suffix: [u8; KEY_SUFFIX_LEN] = key[key.len() - KEY_SUFFIX_LEN..]
            .try_into()
            .expect("suffix length checked above");
        Ok(VersionId(u32::from_be_bytes(suffix)))
    }

    /// Inclusive lower bound of every key belonging to this instance.
    pub fn instance_min_key(&self) -> Vec<u8> {
        self.instance_id.0.to_be_bytes().to_vec()
    }

    /// Exclusive upper bound of this instance's keys, or `None` when the
    /// instance-id is the last representable one.
    pub fn instance_max_key(&self) -> Option<Vec<u8>> {
        self.instance_id
            .0
            .checked_add(1)
            .map(|next| next.to_be_bytes().to_vec())
    }

    /// The write mutex for this `(instance, version)` pair, drawn from a
    /// process-wide table. Writers to the same pair serialize; writers to
    /// different pairs do not.
    pub fn mutex(&self) -> Arc<Mutex<()>> {
        WRITE_MUTEXES
            .entry((self.instance_id.0, self.version_id.0))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
