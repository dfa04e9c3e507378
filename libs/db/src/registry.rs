//! Compiled-in data-type registry.
//!
//! Data types are a closed set: [`DataInstance`] is an enum over every type
//! this server is built with, and dispatch is a `match`. The registry maps
//! type names to constructors and help text; it is built once at startup and
//! shared read-only, so lookups never take a lock.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::context::DataContext;
use crate::error::{Error, Result};
use crate::kv::Store;
use crate::repo::RepoManager;
use crate::roi;
use crate::{DataConfig, InstanceId, Uuid};

// ============================================================================
// Instance basics
// ============================================================================

/// Fields common to every data instance, independent of its type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseData {
    /// Instance name, unique within its repo.
    #[serde(rename = "Name")]
    pub name: String,
    /// Registered type name, e.g. `"roi"`.
    #[serde(rename = "TypeName")]
    pub type_name: String,
    /// Process-unique id; part of every storage key this instance writes.
    #[serde(rename = "InstanceID")]
    pub instance_id: InstanceId,
    /// Version node the instance was created at.
    #[serde(rename = "RepoUUID")]
    pub created: Uuid,
}

/// Arguments handed to a type's constructor.
pub struct NewDataArgs<'a> {
    pub uuid: &'a Uuid,
    pub instance_id: InstanceId,
    pub name: &'a str,
    pub config: &'a DataConfig,
}

/// A request already resolved to a data instance: the remaining endpoint
/// segment of `/api/node/{uuid}/{dataname}/{endpoint}`, the HTTP verb, the
/// query parameters, and the body.
pub struct DataRequest<'a> {
    pub method: &'a str,
    pub endpoint: &'a str,
    pub query: &'a HashMap<String, String>,
    pub body: &'a [u8],
}

/// Response produced by a data instance handler.
pub struct DataResponse {
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl DataResponse {
    pub fn json(value: serde_json::Value) -> Self {
        Self {
            content_type: "application/json",
            body: value.to_string().into_bytes(),
        }
    }

    pub fn json_bytes(body: Vec<u8>) -> Self {
        Self {
            content_type: "application/json",
            body,
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self {
            content_type: "text/plain",
            body: body.into().into_bytes(),
        }
    }
}

// ============================================================================
// DataInstance
// ============================================================================

/// A data instance of one of the compiled-in types.
///
/// Serialized with its type name as the tag, so instance registries survive
/// restarts without any runtime type lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "typename")]
pub enum DataInstance {
    #[serde(rename = "roi")]
    Roi(roi::Data),
}

impl DataInstance {
    pub fn base(&self) -> &BaseData {
        match self {
            DataInstance::Roi(d) => &d.base,
        }
    }

    pub fn name(&self) -> &str {
        &self.base().name
    }

    pub fn type_name(&self) -> &str {
        &self.base().type_name
    }

    pub fn instance_id(&self) -> InstanceId {
        self.base().instance_id
    }

    /// Instance metadata as served by `GET /node/{uuid}/{name}/info`.
    pub fn info_json(&self) -> serde_json::Value {
        match self {
            DataInstance::Roi(d) => d.info_json(),
        }
    }

    pub fn help(&self) -> &'static str {
        match self {
            DataInstance::Roi(_) => roi::HELP,
        }
    }

    /// Handle a node-level request addressed to this instance.
    pub fn handle(
        &self,
        store: &Store,
        manager: &RepoManager,
        ctx: &DataContext,
        req: DataRequest<'_>,
    ) -> Result<DataResponse> {
        match self {
            DataInstance::Roi(d) => d.handle(store, manager, ctx, req),
        }
    }
}

// ============================================================================
// TypeRegistry
// ============================================================================

/// Static description of a registered type.
#[derive(Debug, Clone, Serialize)]
pub struct TypeInfo {
    #[serde(rename = "Name")]
    pub name: &'static str,
    #[serde(rename = "URL")]
    pub url: &'static str,
    #[serde(rename = "Version")]
    pub version: &'static str,
    /// Whether instances of this type need a batch-capable store.
    #[serde(skip)]
    pub requires_batcher: bool,
}

/// Constructor signature for a registered type.
pub type NewDataFn = for<'a> fn(NewDataArgs<'a>) -> Result<DataInstance>;

/// One registered type: its description, help text, and constructor.
pub struct TypeService {
    pub info: TypeInfo,
    pub help: &'static str,
    pub new_data: NewDataFn,
}

/// Registry of every data type compiled into this server.
pub struct TypeRegistry {
    types: BTreeMap<&'static str, TypeService>,
}

impl TypeRegistry {
    /// The registry of built-in types. Called once at startup.
    pub fn builtin() -> Self {
        let mut types = BTreeMap::new();
        let roi = roi::type_service();
        types.insert(roi.info.name, roi);
        Self { types }
    }

    /// Look up a type by name.
    pub fn get(&self, name: &str) -> Result<&TypeService> {
        self.types
            .get(name)
            .ok_or_else(|| Error::UnknownType(name.to_string()))
    }

    pub fn services(&self) -> impl Iterator<Item = &TypeService> {
        self.types.values()
    }

    /// `{typename: url}` map served by `GET /api/server/types`.
    pub fn types_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .types
            .values()
            .map(|t| (t.info.name.to_string(), t.info.url.into()))
            .collect();
        serde_json::Value::Object(map)
    }
}
