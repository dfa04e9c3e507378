//! Storage tier wiring.
//!
//! A backend names three tiers - metadata, mutable, immutable - each bound
//! to an ordered store. On a single-server deployment all three usually
//! share one engine; operations that walk "every distinct tier" deduplicate
//! by handle identity so a shared engine is only visited once.

use crate::context::DataContext;
use crate::error::{Error, Result};
use crate::kv::Store;
use crate::{InstanceId, VersionId};

pub struct Backend {
    metadata: Store,
    mutable: Store,
    immutable: Store,
}

impl Backend {
    pub fn new(metadata: Store, mutable: Store, immutable: Store) -> Self {
        Self {
            metadata,
            mutable,
            immutable,
        }
    }

    /// Wire all three tiers to a single shared engine.
    pub fn with_store(store: Store) -> Self {
        Self {
            metadata: store.clone(),
            mutable: store.clone(),
            immutable: store,
        }
    }

    pub fn metadata(&self) -> &Store {
        &self.metadata
    }

    pub fn mutable(&self) -> &Store {
        &self.mutable
    }

    pub fn immutable(&self) -> &Store {
        &self.immutable
    }

    /// The distinct engines behind the tiers, deduplicated by identity.
    pub fn unique_stores(&self) -> Vec<&Store> {
        let mut stores: Vec<&Store> = vec![&self.metadata];
        for candidate in [&self.mutable, &self.immutable] {
            if !stores.iter().any(|s| Store::ptr_eq(s, candidate)) {
                stores.push(candidate);
            }
        }
        stores
    }

    /// Engine descriptions for `/api/server/info`.
    pub fn descriptions(&self) -> Vec<String> {
        self.unique_stores()
            .iter()
            .map(|s| s.engine().to_string())
            .collect()
    }

    /// Fail startup unless every configured engine is byte-ordered.
    pub fn verify_ordered(&self) -> Result<()> {
        for store in self.unique_stores() {
            if !store.ordered() {
                return Err(Error::EngineNotOrdered(store.engine().to_string()));
            }
        }
        Ok(())
    }

    /// Remove every key belonging to `instance_id` from every distinct tier.
    ///
    /// Used when a data instance is deleted; the purge spans all versions
    /// and includes the instance's unversioned metadata records.
    pub fn delete_data_instance(&self, instance_id: InstanceId) -> Result<()> {
        tracing::info!(instance = %instance_id, "deleting data instance keys across tiers");
        let ctx = DataContext::new(instance_id, VersionId(0));
        for store in self.unique_stores() {
            store.delete_all(&ctx, true)?;
        }
        Ok(())
    }
}
