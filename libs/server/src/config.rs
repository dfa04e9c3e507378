//! Server configuration.
//!
//! A TOML document declares the HTTP server settings, the named stores, the
//! backend tier designations, and cache sizes:
//!
//! ```toml
//! [server]
//! httpAddress = "localhost:8000"
//!
//! [store.main]
//! engine = "rocksdb"
//! path = "db"                # relative to this file
//!
//! [backend.default]
//! store = "main"
//! ```
//!
//! A single declared store is the implicit default; with several stores the
//! `[backend.default]` designation is required. The `metadata` designation
//! falls back to the default store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use voxd_db::{Backend, Error, InstanceIdConfig, LoadStats, Result, RocksStore, Store};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub store: HashMap<String, StoreSection>,
    pub backend: HashMap<String, BackendSection>,
    pub cache: HashMap<String, CacheSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    #[serde(rename = "httpAddress")]
    pub http_address: String,
    #[serde(rename = "rpcAddress")]
    pub rpc_address: String,
    /// Optional directory with admin console files; resolved but unserved
    /// in this build.
    #[serde(rename = "webClient")]
    pub web_client: Option<PathBuf>,
    /// When set, responses carry `Timing-Allow-Origin: *`.
    #[serde(rename = "allowTiming")]
    pub allow_timing: bool,
    pub instance_id_gen: String,
    pub instance_id_start: u32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_address: "localhost:8000".to_string(),
            rpc_address: "localhost:8001".to_string(),
            web_client: None,
            allow_timing: false,
            instance_id_gen: "sequential".to_string(),
            instance_id_start: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    pub engine: String,
    pub path: PathBuf,
    /// Engine-specific settings, passed through as-is.
    #[serde(flatten)]
    pub options: toml::Table,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    pub store: String,
    #[serde(default)]
    pub log: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CacheSection {
    /// MiB reserved for this cache id.
    pub size: u64,
}

impl Config {
    /// Load and validate a config file. Relative paths inside the file are
    /// resolved against the file's own directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::BadConfig(format!("cannot read config {}: {}", path.display(), e)))?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&content, dir)
    }

    /// Parse config text, resolving relative paths against `dir`.
    pub fn parse(content: &str, dir: &Path) -> Result<Self> {
        let mut config: Config = toml::from_str(content)
            .map_err(|e| Error::BadConfig(format!("cannot parse config: {}", e)))?;
        config.resolve_paths(dir);
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, dir: &Path) {
        for section in self.store.values_mut() {
            if section.path.is_relative() {
                section.path = dir.join(&section.path);
            }
        }
        if let Some(web_client) = &self.server.web_client {
            if web_client.is_relative() {
                self.server.web_client = Some(dir.join(web_client));
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.store.is_empty() {
            return Err(Error::BadConfig("no [store.<alias>] declared".into()));
        }
        for (spec, backend) in &self.backend {
            if !self.store.contains_key(&backend.store) {
                return Err(Error::BadConfig(format!(
                    "backend {:?} references undeclared store {:?}",
                    spec, backend.store
                )));
            }
        }
        // Surfaces the ambiguous-default error at load time.
        self.default_store_alias()?;
        Ok(())
    }

    /// The alias of the default store: the `[backend.default]` designation,
    /// or the single declared store.
    pub fn default_store_alias(&self) -> Result<&str> {
        if let Some(spec) = self.backend.get("default") {
            return Ok(&spec.store);
        }
        if self.store.len() == 1 {
            return Ok(self.store.keys().next().expect("one store"));
        }
        Err(Error::BadConfig(
            "ambiguous default store: declare [backend.default] when more than one store is configured"
                .into(),
        ))
    }

    /// The alias of the metadata store, falling back to the default.
    pub fn metadata_store_alias(&self) -> Result<&str> {
        match self.backend.get("metadata") {
            Some(spec) => Ok(&spec.store),
            None => self.default_store_alias(),
        }
    }

    /// Open the configured engines (once per alias) and wire the tiers.
    pub fn open_backend(&self, stats: Arc<LoadStats>) -> Result<Backend> {
        let default_alias = self.default_store_alias()?.to_string();
        let metadata_alias = self.metadata_store_alias()?.to_string();

        let mut opened: HashMap<&str, Store> = HashMap::new();
        for alias in [default_alias.as_str(), metadata_alias.as_str()] {
            if opened.contains_key(alias) {
                continue;
            }
            let section = self
                .store
                .get(alias)
                .ok_or_else(|| Error::BadConfig(format!("undeclared store {:?}", alias)))?;
            opened.insert(alias, open_engine(section, stats.clone())?);
        }

        let default = opened[default_alias.as_str()].clone();
        let metadata = opened[metadata_alias.as_str()].clone();
        let backend = Backend::new(metadata, default.clone(), default);
        backend.verify_ordered()?;
        Ok(backend)
    }

    pub fn instance_id_config(&self) -> InstanceIdConfig {
        InstanceIdConfig {
            gen: self.server.instance_id_gen.clone(),
            start: self.server.instance_id_start,
        }
    }

    /// Bytes reserved for a cache id, 0 when unconfigured.
    pub fn cache_size_bytes(&self, id: &str) -> u64 {
        self.cache.get(id).map(|c| c.size << 20).unwrap_or(0)
    }
}

/// Default `[server] host`: the machine's fully qualified name, or
/// `"localhost"` when the lookup fails. The value is advisory and only
/// echoed back in `/api/server/info` and startup logs.
fn default_host() -> String {
    match std::process::Command::new("/bin/hostname").arg("-f").output() {
        Ok(out) if out.status.success() => {
            let host = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if host.is_empty() {
                "localhost".to_string()
            } else {
                host
            }
        }
        _ => "localhost".to_string(),
    }
}

fn open_engine(section: &StoreSection, stats: Arc<LoadStats>) -> Result<Store> {
    match section.engine.as_str() {
        "rocksdb" => {
            let store: Store = RocksStore::open(&section.path, stats)?;
            Ok(store)
        }
        other => Err(Error::BadConfig(format!(
            "unknown storage engine {:?} (available: rocksdb)",
            other
        ))),
    }
}
