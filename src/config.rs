use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::ecs::{ComponentRegistry, ComponentSchema, ComponentTypeId, Field, FieldKind, SchemaError};
use crate::engine::EngineSettings;
use crate::storage::kv::MemoryKv;
use crate::storage::{KvStorage, MemoryStorage, StorageBackend};
use crate::workload::WorkloadConfig;
use crate::world::WorldStorage;

fn default_world_id() -> String {
    "1".to_string()
}

fn default_max_retries() -> u32 {
    8
}

fn default_receipt_history_size() -> u64 {
    10
}

fn default_verify_each_tick() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("snapshots")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    /// Key-value adapter over the in-process key-value store.
    Kv,
    Redis,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub annotation: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
}

impl FieldConfig {
    fn to_field(&self) -> Result<Field, SchemaError> {
        let kind = match self.kind.as_str() {
            "struct" => FieldKind::Struct(nested(&self.fields)?),
            "[]struct" => FieldKind::Slice(Box::new(FieldKind::Struct(nested(&self.fields)?))),
            other => FieldKind::from_name(other)?,
        };
        let field = Field::new(&self.name, kind);
        Ok(match &self.annotation {
            Some(annotation) => field.annotated(annotation),
            None => field,
        })
    }
}

fn nested(fields: &[FieldConfig]) -> Result<Vec<Field>, SchemaError> {
    fields.iter().map(FieldConfig::to_field).collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComponentConfig {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default)]
    pub interval_ticks: u64,
    #[serde(default = "default_snapshot_dir")]
    pub dir: PathBuf,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval_ticks: 0,
            dir: default_snapshot_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_world_id")]
    pub world_id: String,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_receipt_history_size")]
    pub receipt_history_size: u64,
    #[serde(default = "default_verify_each_tick")]
    pub verify_each_tick: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub components: Vec<ComponentConfig>,
    #[serde(default)]
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

impl Config {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text).context("Failed to parse configuration")?;
        config.registry()?;
        Ok(config)
    }

    /// Builds and validates the component registry.
    pub fn registry(&self) -> Result<ComponentRegistry> {
        let mut registry = ComponentRegistry::new();
        for component in &self.components {
            let fields = nested(&component.fields)
                .with_context(|| format!("Invalid field kind in component {}", component.name))?;
            let schema = ComponentSchema::new(ComponentTypeId::new(component.id), &component.name, fields);
            registry
                .register(schema)
                .with_context(|| format!("Failed to register component {}", component.name))?;
        }
        Ok(registry)
    }

    pub fn component_ids(&self) -> Vec<ComponentTypeId> {
        self.components
            .iter()
            .map(|component| ComponentTypeId::new(component.id))
            .collect()
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            max_retries: self.max_retries,
            verify_each_tick: self.verify_each_tick,
            receipt_history_size: self.receipt_history_size,
            snapshot_interval_ticks: self.snapshot.interval_ticks,
            snapshot_dir: self.snapshot.dir.clone(),
        }
    }

    /// Opens the configured backend and hands the world to `task`.
    pub fn open_world<T: WorldTask>(&self, task: T) -> Result<T::Output> {
        let registry = self.registry()?;
        let world_id = self.world_id.clone();
        match self.backend.kind {
            BackendKind::Memory => task.run(WorldStorage::new(world_id, registry, MemoryStorage::new())),
            BackendKind::Kv => {
                let backend = KvStorage::new(MemoryKv::new(), world_id.clone()).with_max_retries(self.max_retries);
                task.run(WorldStorage::new(world_id, registry, backend))
            }
            BackendKind::Redis => self.open_redis(world_id, registry, task),
        }
    }

    #[cfg(feature = "redis")]
    fn open_redis<T: WorldTask>(&self, world_id: String, registry: ComponentRegistry, task: T) -> Result<T::Output> {
        let url = self
            .backend
            .url
            .as_deref()
            .context("backend.url is required for the redis backend")?;
        let store = crate::storage::kv::RedisKv::open(url)
            .with_context(|| format!("Failed to connect to redis at {url}"))?;
        let backend = KvStorage::new(store, world_id.clone()).with_max_retries(self.max_retries);
        task.run(WorldStorage::new(world_id, registry, backend))
    }

    #[cfg(not(feature = "redis"))]
    fn open_redis<T: WorldTask>(&self, _world_id: String, _registry: ComponentRegistry, _task: T) -> Result<T::Output> {
        bail!("the redis backend requires building with the `redis` feature")
    }
}

/// Work to run against a world whose backend type is chosen at runtime.
pub trait WorldTask {
    type Output;

    fn run<B>(self, world: WorldStorage<B>) -> Result<Self::Output>
    where
        B: StorageBackend + Send + 'static;
}

pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    pub fn load(&self, file: impl AsRef<Path>) -> Result<Config> {
        let path = self.base_dir.join(file);
        let data = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Config::from_yaml(&data).with_context(|| format!("Failed to load {}", path.display()))?;
        if config.components.is_empty() {
            bail!("{} declares no components", path.display());
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEMO: &str = r#"
world_id: demo
backend:
  kind: kv
components:
  - id: 0
    name: Health
    fields:
      - { name: hp, kind: uint32 }
  - id: 1
    name: Wallet
    fields:
      - { name: balance, kind: bigint, annotation: uint256 }
      - name: history
        kind: "[]struct"
        fields:
          - { name: amount, kind: int64 }
workload:
  seed: 3
  ticks: 5
"#;

    #[test]
    fn test_defaults_and_registry() {
        let config = Config::from_yaml(DEMO).unwrap();
        assert_eq!(config.world_id, "demo");
        assert_eq!(config.backend.kind, BackendKind::Kv);
        assert_eq!(config.max_retries, 8);
        assert_eq!(config.receipt_history_size, 10);
        assert!(config.verify_each_tick);
        assert_eq!(config.workload.transactions_per_tick, 16);
        assert_eq!(config.snapshot.interval_ticks, 0);
        let registry = config.registry().unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.by_name("Wallet").is_some());
    }

    #[test]
    fn test_unannotated_bigint_fails_at_load() {
        let yaml = r#"
components:
  - id: 0
    name: Wallet
    fields:
      - { name: balance, kind: bigint }
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("Wallet"), "{message}");
        assert!(message.contains("balance"), "{message}");
    }

    #[test]
    fn test_unsized_int_fails_at_load() {
        let yaml = r#"
components:
  - id: 4
    name: Counter
    fields:
      - { name: n, kind: uint }
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_loader_reads_relative_to_base_dir() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("world.yaml"), DEMO).unwrap();
        let config = ConfigLoader::new(temp.path()).load("world.yaml").unwrap();
        assert_eq!(config.workload.seed, 3);
        assert!(ConfigLoader::new(temp.path()).load("missing.yaml").is_err());
    }
}
