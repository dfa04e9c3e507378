//! Repos, version DAGs, and the UUID resolver.
//!
//! A repo is a rooted DAG of version nodes plus a registry of named data
//! instances. Nodes live in a per-repo arena indexed by version-id, so
//! parent/child links are integer handles rather than references. The
//! [`RepoManager`] is an explicit service handle (created at startup, passed
//! through the request state) owning every repo, the global UUID index, and
//! the instance-id generator.
//!
//! Every mutation persists a JSON snapshot of the full state to the metadata
//! tier; data types call [`RepoManager::update_data`] when they change their
//! own persisted properties (the "save hook").

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::context::DataContext;
use crate::error::{Error, Result};
use crate::kv::Store;
use crate::registry::{DataInstance, NewDataArgs, TypeRegistry};
use crate::{DataConfig, InstanceId, Uuid, VersionId};

/// Reserved instance-id for the manager snapshot in the metadata tier. Real
/// instance ids start at 1, so instance purges can never touch it.
const METADATA_INSTANCE: InstanceId = InstanceId(0);

/// Index bytes of the snapshot record.
const SNAPSHOT_INDEX: &[u8] = b"repos";

fn snapshot_ctx() -> DataContext {
    DataContext::new(METADATA_INSTANCE, VersionId(0))
}

// ============================================================================
// Configuration
// ============================================================================

/// Instance-id generator settings (`instance_id_gen` / `instance_id_start`).
#[derive(Debug, Clone)]
pub struct InstanceIdConfig {
    pub gen: String,
    pub start: u32,
}

impl Default for InstanceIdConfig {
    fn default() -> Self {
        Self {
            gen: "sequential".to_string(),
            start: 1,
        }
    }
}

// ============================================================================
// State
// ============================================================================

/// Stable handle to a repo within the manager's arena. Repos are never
/// removed, so handles stay valid for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepoId(pub usize);

/// A version node resolved from a (possibly partial) UUID string.
#[derive(Debug, Clone)]
pub struct ResolvedVersion {
    pub uuid: Uuid,
    pub version: VersionId,
    pub repo: RepoId,
    pub locked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    uuid: Uuid,
    version: VersionId,
    parent: Option<VersionId>,
    children: Vec<VersionId>,
    locked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Repo {
    root: Uuid,
    /// Arena: version `v` lives at `nodes[v - 1]`.
    nodes: Vec<Node>,
    data: BTreeMap<String, DataInstance>,
}

impl Repo {
    fn node(&self, version: VersionId) -> Option<&Node> {
        self.nodes.get(version.0.checked_sub(1)? as usize)
    }

    fn node_mut(&mut self, version: VersionId) -> Option<&mut Node> {
        self.nodes.get_mut(version.0.checked_sub(1)? as usize)
    }

    fn json(&self) -> serde_json::Value {
        let nodes: serde_json::Map<String, serde_json::Value> = self
            .nodes
            .iter()
            .map(|n| {
                let parents: Vec<&str> = n
                    .parent
                    .and_then(|p| self.node(p))
                    .map(|p| vec![p.uuid.as_str()])
                    .unwrap_or_default();
                let children: Vec<&str> = n
                    .children
                    .iter()
                    .filter_map(|c| self.node(*c))
                    .map(|c| c.uuid.as_str())
                    .collect();
                (
                    n.uuid.as_str().to_string(),
                    serde_json::json!({
                        "UUID": n.uuid,
                        "VersionID": n.version,
                        "Locked": n.locked,
                        "Parents": parents,
                        "Children": children,
                    }),
                )
            })
            .collect();
        let data: serde_json::Map<String, serde_json::Value> = self
            .data
            .iter()
            .map(|(name, d)| (name.clone(), d.info_json()))
            .collect();
        serde_json::json!({
            "Root": self.root,
            "DAG": { "Root": self.root, "Nodes": nodes },
            "Data": data,
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ManagerState {
    repos: Vec<Repo>,
    next_instance_id: u32,

    // Derived indexes, rebuilt on load.
    #[serde(skip)]
    uuids: HashMap<String, (usize, VersionId)>,
    #[serde(skip)]
    instances: HashMap<u32, usize>,
}

impl ManagerState {
    fn rebuild_indexes(&mut self) {
        self.uuids.clear();
        self.instances.clear();
        for (idx, repo) in self.repos.iter().enumerate() {
            for node in &repo.nodes {
                self.uuids
                    .insert(node.uuid.as_str().to_string(), (idx, node.version));
            }
            for data in repo.data.values() {
                self.instances.insert(data.instance_id().0, idx);
            }
        }
    }
}

// ============================================================================
// RepoManager
// ============================================================================

/// Owner of every repo, the global UUID index, and the instance-id counter.
///
/// Readers (resolution, JSON views, data lookups) share a read lock;
/// mutations (new repo/version, lock, instance changes) take the write lock
/// and persist a snapshot before returning.
pub struct RepoManager {
    state: RwLock<ManagerState>,
    metadata: Store,
}

impl RepoManager {
    /// Open the manager, restoring the snapshot from the metadata tier when
    /// one exists.
    pub fn open(metadata: Store, id_config: InstanceIdConfig) -> Result<Self> {
        if id_config.gen != "sequential" {
            return Err(Error::BadConfig(format!(
                "unsupported instance_id_gen {:?} (only \"sequential\" is available)",
                id_config.gen
            )));
        }

        let mut state = match metadata.get(&snapshot_ctx(), SNAPSHOT_INDEX)? {
            Some(bytes) => serde_json::from_slice::<ManagerState>(&bytes)
                .map_err(|e| Error::BadConfig(format!("corrupt repo metadata: {}", e)))?,
            None => ManagerState::default(),
        };
        state.rebuild_indexes();
        state.next_instance_id = state.next_instance_id.max(id_config.start.max(1));

        tracing::info!(
            repos = state.repos.len(),
            next_instance_id = state.next_instance_id,
            "repo manager ready"
        );
        Ok(Self {
            state: RwLock::new(state),
            metadata,
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ManagerState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ManagerState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, state: &ManagerState) -> Result<()> {
        let bytes = serde_json::to_vec(state)?;
        self.metadata.put(&snapshot_ctx(), SNAPSHOT_INDEX, &bytes)
    }

    /// Create a repo with a fresh root version (unlocked, version-id 1).
    pub fn new_repo(&self) -> Result<Uuid> {
        let uuid = Uuid::generate();
        let mut state = self.write();
        let idx = state.repos.len();
        state.repos.push(Repo {
            root: uuid.clone(),
            nodes: vec![Node {
                uuid: uuid.clone(),
                version: VersionId(1),
                parent: None,
                children: Vec::new(),
                locked: false,
            }],
            data: BTreeMap::new(),
        });
        state
            .uuids
            .insert(uuid.as_str().to_string(), (idx, VersionId(1)));
        self.persist(&state)?;
        tracing::info!(root = %uuid, "created repo");
        Ok(uuid)
    }

    /// Resolve a (possibly partial) UUID string to a unique version node.
    ///
    /// The empty prefix matches everything and is always ambiguous.
    pub fn matching_uuid(&self, prefix: &str) -> Result<ResolvedVersion> {
        let state = self.read();
        if prefix.is_empty() {
            return Err(Error::AmbiguousUuid {
                prefix: String::new(),
                matches: state.uuids.len(),
            });
        }
        let mut matched: Option<(&String, &(usize, VersionId))> = None;
        let mut matches = 0usize;
        for entry in state.uuids.iter() {
            if entry.0.starts_with(prefix) {
                matches += 1;
                matched = Some(entry);
            }
        }
        match matches {
            0 => Err(Error::UnknownUuid(prefix.to_string())),
            1 => {
                let (uuid, (repo_idx, version)) = matched.expect("one match recorded");
                let locked = state.repos[*repo_idx]
                    .node(*version)
                    .map(|n| n.locked)
                    .unwrap_or(false);
                Ok(ResolvedVersion {
                    uuid: Uuid::from(uuid.as_str()),
                    version: *version,
                    repo: RepoId(*repo_idx),
                    locked,
                })
            }
            n => Err(Error::AmbiguousUuid {
                prefix: prefix.to_string(),
                matches: n,
            }),
        }
    }

    fn lookup_exact(state: &ManagerState, uuid: &Uuid) -> Result<(usize, VersionId)> {
        state
            .uuids
            .get(uuid.as_str())
            .copied()
            .ok_or_else(|| Error::UnknownUuid(uuid.as_str().to_string()))
    }

    /// Lock a version node. Idempotent; locking is one-way.
    pub fn lock(&self, uuid: &Uuid) -> Result<()> {
        let mut state = self.write();
        let (repo_idx, version) = Self::lookup_exact(&state, uuid)?;
        let node = state.repos[repo_idx]
            .node_mut(version)
            .ok_or_else(|| Error::UnknownUuid(uuid.as_str().to_string()))?;
        if !node.locked {
            node.locked = true;
            tracing::info!(node = %uuid, "locked version node");
        }
        self.persist(&state)
    }

    /// Whether the node with this exact UUID is locked.
    pub fn is_locked(&self, uuid: &Uuid) -> Result<bool> {
        let state = self.read();
        let (repo_idx, version) = Self::lookup_exact(&state, uuid)?;
        Ok(state.repos[repo_idx]
            .node(version)
            .map(|n| n.locked)
            .unwrap_or(false))
    }

    /// Create a child version of a locked parent node.
    pub fn new_version(&self, parent: &Uuid) -> Result<Uuid> {
        let mut state = self.write();
        let (repo_idx, parent_version) = Self::lookup_exact(&state, parent)?;
        let repo = &mut state.repos[repo_idx];
        let parent_node = repo
            .node(parent_version)
            .ok_or_else(|| Error::UnknownUuid(parent.as_str().to_string()))?;
        if !parent_node.locked {
            return Err(Error::NotLocked(parent.clone()));
        }

        let child_uuid = Uuid::generate();
        let child_version = VersionId(repo.nodes.len() as u32 + 1);
        repo.nodes.push(Node {
            uuid: child_uuid.clone(),
            version: child_version,
            parent: Some(parent_version),
            children: Vec::new(),
            locked: false,
        });
        repo.node_mut(parent_version)
            .expect("parent checked above")
            .children
            .push(child_version);
        state
            .uuids
            .insert(child_uuid.as_str().to_string(), (repo_idx, child_version));
        self.persist(&state)?;
        tracing::info!(parent = %parent, child = %child_uuid, "branched version node");
        Ok(child_uuid)
    }

    /// Create a data instance in the repo holding `uuid`.
    ///
    /// The config must carry `typename` and `dataname`; the name must be
    /// unique within the repo; the type's storage requirements are checked
    /// against `default_store`.
    pub fn new_data(
        &self,
        registry: &TypeRegistry,
        uuid: &Uuid,
        config: &DataConfig,
        default_store: &Store,
    ) -> Result<String> {
        let type_name = config
            .get_str("typename")
            .ok_or_else(|| Error::BadConfig("instance config requires a \"typename\"".into()))?;
        let name = config
            .get_str("dataname")
            .ok_or_else(|| Error::BadConfig("instance config requires a \"dataname\"".into()))?
            .to_string();
        if name.is_empty() {
            return Err(Error::BadConfig("\"dataname\" must be non-empty".into()));
        }
        let service = registry.get(type_name)?;
        if service.info.requires_batcher && !default_store.supports_batching() {
            return Err(Error::BatcherUnsupported(
                default_store.engine().to_string(),
            ));
        }

        let mut state = self.write();
        let (repo_idx, _) = Self::lookup_exact(&state, uuid)?;
        if state.repos[repo_idx].data.contains_key(&name) {
            return Err(Error::DuplicateName(name));
        }

        let instance_id = InstanceId(state.next_instance_id);
        let data = (service.new_data)(NewDataArgs {
            uuid,
            instance_id,
            name: &name,
            config,
        })?;
        state.next_instance_id += 1;
        state.repos[repo_idx].data.insert(name.clone(), data);
        state.instances.insert(instance_id.0, repo_idx);
        self.persist(&state)?;
        tracing::info!(name = %name, datatype = type_name, instance = %instance_id, "created data instance");
        Ok(name)
    }

    /// Fetch a data instance by name. The returned value is a snapshot;
    /// mutations go through [`RepoManager::update_data`].
    pub fn get_data(&self, repo: RepoId, name: &str) -> Result<DataInstance> {
        let state = self.read();
        state
            .repos
            .get(repo.0)
            .and_then(|r| r.data.get(name))
            .cloned()
            .ok_or_else(|| Error::UnknownData(name.to_string()))
    }

    /// Remove a data instance from the registry and purge its keys from
    /// every distinct storage tier.
    pub fn delete_data(&self, repo: RepoId, name: &str, backend: &Backend) -> Result<()> {
        let instance_id = {
            let mut state = self.write();
            let repo_state = state
                .repos
                .get_mut(repo.0)
                .ok_or_else(|| Error::UnknownData(name.to_string()))?;
            let data = repo_state
                .data
                .remove(name)
                .ok_or_else(|| Error::UnknownData(name.to_string()))?;
            let instance_id = data.instance_id();
            state.instances.remove(&instance_id.0);
            self.persist(&state)?;
            instance_id
        };
        // The purge can be long; run it after the registry update so other
        // repos stay available.
        backend.delete_data_instance(instance_id)
    }

    /// Mutate a data instance's persisted properties and save the snapshot.
    ///
    /// This is the save hook data types call after changing properties such
    /// as ROI extents.
    pub fn update_data<F>(&self, instance_id: InstanceId, f: F) -> Result<()>
    where
        F: FnOnce(&mut DataInstance),
    {
        let mut state = self.write();
        let repo_idx = *state
            .instances
            .get(&instance_id.0)
            .ok_or_else(|| Error::UnknownData(format!("instance {}", instance_id)))?;
        let data = state.repos[repo_idx]
            .data
            .values_mut()
            .find(|d| d.instance_id() == instance_id)
            .ok_or_else(|| Error::UnknownData(format!("instance {}", instance_id)))?;
        f(data);
        self.persist(&state)
    }

    /// JSON view of one repo.
    pub fn repo_json(&self, repo: RepoId) -> Result<serde_json::Value> {
        let state = self.read();
        state
            .repos
            .get(repo.0)
            .map(Repo::json)
            .ok_or_else(|| Error::UnknownUuid(format!("repo #{}", repo.0)))
    }

    /// JSON view of every repo, keyed by root UUID.
    pub fn repos_json(&self) -> serde_json::Value {
        let state = self.read();
        let map: serde_json::Map<String, serde_json::Value> = state
            .repos
            .iter()
            .map(|r| (r.root.as_str().to_string(), r.json()))
            .collect();
        serde_json::Value::Object(map)
    }
}
