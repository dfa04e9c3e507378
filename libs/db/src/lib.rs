//! Core storage layer for the voxd versioned volumetric data server.
//!
//! This crate provides the pieces below the HTTP surface:
//!
//! - `kv` - the ordered key-value store abstraction and batch contract
//! - `rocks` - the RocksDB engine behind that abstraction
//! - `context` - per-(instance, version) key namespacing and write mutexes
//! - `backend` - metadata/mutable/immutable tier wiring
//! - `repo` - the repo/version DAG, UUID resolution, and instance registry
//! - `registry` - the compiled-in data-type registry
//! - `roi` - the region-of-interest data type
//! - `stats` - load counters surfaced by the server's `/api/load`
//!
//! The unit of addressing throughout is a *data instance* at a *version
//! node*: every stored key is namespaced by `(instance-id, version-id)` so
//! that range scans within one instance and version are contiguous.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod backend;
pub mod context;
mod error;
pub mod kv;
pub mod registry;
pub mod repo;
pub mod rocks;
pub mod roi;
pub mod stats;

pub use backend::Backend;
pub use context::{Cancel, DataContext};
pub use error::{Error, Result};
pub use kv::{KvBatch, OrderedKeyValueStore, Store};
pub use registry::{DataInstance, DataRequest, DataResponse, TypeRegistry, TypeService};
pub use repo::{InstanceIdConfig, RepoManager, ResolvedVersion};
pub use rocks::RocksStore;
pub use stats::LoadStats;

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier of a version node, rendered as 32 lowercase hex characters.
///
/// Clients may address a node by any unique prefix of this string; see
/// [`RepoManager::matching_uuid`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uuid(String);

impl Uuid {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Uuid(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uuid {
    fn from(s: &str) -> Self {
        Uuid(s.to_string())
    }
}

/// Process-unique identifier of a data instance. Part of every storage key
/// prefix; see [`context::DataContext`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct InstanceId(pub u32);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Repo-local identifier of a version node, monotone from 1 at the root.
/// Part of every storage key suffix.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct VersionId(pub u32);

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Geometry
// ============================================================================

/// Integer 3-D point, `[x, y, z]`. Used both for voxel coordinates and for
/// block coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Point3d(pub [i32; 3]);

impl Point3d {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Point3d([x, y, z])
    }

    pub fn x(&self) -> i32 {
        self.0[0]
    }

    pub fn y(&self) -> i32 {
        self.0[1]
    }

    pub fn z(&self) -> i32 {
        self.0[2]
    }

    /// The block containing this voxel, given a per-axis block size.
    ///
    /// Uses floor division so negative voxel coordinates land in the correct
    /// block (`-1` with block size 32 is block `-1`, not block 0).
    pub fn block(&self, block_size: Point3d) -> Point3d {
        Point3d([
            self.0[0].div_euclid(block_size.0[0]),
            self.0[1].div_euclid(block_size.0[1]),
            self.0[2].div_euclid(block_size.0[2]),
        ])
    }
}

impl fmt::Display for Point3d {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.0[0], self.0[1], self.0[2])
    }
}

impl FromStr for Point3d {
    type Err = Error;

    /// Parse a comma-separated triple such as `"32,32,32"`.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(Error::BadConfig(format!(
                "point must be 3-d (\"x,y,z\"), got {:?}",
                s
            )));
        }
        let mut coords = [0i32; 3];
        for (i, part) in parts.iter().enumerate() {
            coords[i] = part.parse().map_err(|_| {
                Error::BadConfig(format!("bad coordinate {:?} in point {:?}", part, s))
            })?;
        }
        Ok(Point3d(coords))
    }
}

// ============================================================================
// DataConfig
// ============================================================================

/// Free-form JSON configuration attached to data-instance creation.
///
/// Keys are matched case-insensitively, so clients may send `BlockSize` or
/// `blocksize` interchangeably.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataConfig(serde_json::Map<String, serde_json::Value>);

impl DataConfig {
    /// Parse a JSON object from raw request bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(Error::from)
    }

    fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    /// Look up a string-valued setting, case-insensitive on the key.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }
}
