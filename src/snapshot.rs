use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ecs::{ArchetypeIndex, EntityId, Layout};
use crate::storage::{StorageBackend, StorageError};
use crate::world::WorldStorage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchetypeSnapshot {
    pub index: ArchetypeIndex,
    pub layout: Layout,
    pub members: Vec<EntityId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub world_id: String,
    pub tick: u64,
    pub taken_at: DateTime<Utc>,
    pub entity_count: usize,
    pub archetypes: Vec<ArchetypeSnapshot>,
}

impl WorldSnapshot {
    pub fn capture<B: StorageBackend>(world: &WorldStorage<B>, tick: u64) -> Result<Self, StorageError> {
        let backend = world.backend();
        let archetypes = (0..backend.archetype_count()?)
            .map(|raw| {
                let archetype = backend.archetype(ArchetypeIndex::new(raw))?;
                Ok(ArchetypeSnapshot {
                    index: archetype.index(),
                    layout: archetype.layout().clone(),
                    members: archetype.entities().to_vec(),
                })
            })
            .collect::<Result<Vec<_>, StorageError>>()?;
        Ok(Self {
            world_id: world.world_id().to_string(),
            tick,
            taken_at: Utc::now(),
            entity_count: world.entity_count()?,
            archetypes,
        })
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to read world state for snapshot: {0}")]
    Storage(#[from] StorageError),
}

/// Writes `<dir>/<world_id>/tick_NNNNNN.json` every `interval` ticks.
pub struct SnapshotWriter {
    dir: PathBuf,
    interval: u64,
}

impl SnapshotWriter {
    pub fn new(dir: impl AsRef<Path>, interval: u64) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            interval,
        }
    }

    /// `ticks_completed` counts sealed ticks; interval 0 disables writing.
    pub fn should_write(&self, ticks_completed: u64) -> bool {
        self.interval != 0 && ticks_completed != 0 && ticks_completed % self.interval == 0
    }

    pub fn maybe_write<B: StorageBackend>(
        &self,
        world: &WorldStorage<B>,
        tick: u64,
    ) -> Result<Option<PathBuf>, SnapshotError> {
        if !self.should_write(tick + 1) {
            return Ok(None);
        }
        let snapshot = WorldSnapshot::capture(world, tick)?;
        self.write(&snapshot).map(Some)
    }

    pub fn write(&self, snapshot: &WorldSnapshot) -> Result<PathBuf, SnapshotError> {
        let dir = self.dir.join(&snapshot.world_id);
        fs::create_dir_all(&dir).map_err(|source| SnapshotError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = dir.join(format!("tick_{:06}.json", snapshot.tick));
        let json = serde_json::to_string_pretty(snapshot)?;
        fs::write(&path, json).map_err(|source| SnapshotError::Io {
            path: path.clone(),
            source,
        })?;
        log::info!("wrote snapshot {}", path.display());
        Ok(path)
    }
}

pub fn load_snapshot(path: impl AsRef<Path>) -> Result<WorldSnapshot, SnapshotError> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&data)?)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tempfile::tempdir;

    use super::*;
    use crate::ecs::{ComponentRegistry, ComponentSchema, ComponentTypeId, Field, FieldKind};
    use crate::storage::MemoryStorage;

    #[test]
    fn test_should_write_on_interval() {
        let writer = SnapshotWriter::new("unused", 5);
        assert!(!writer.should_write(0));
        assert!(!writer.should_write(4));
        assert!(writer.should_write(5));
        assert!(writer.should_write(10));
        assert!(!SnapshotWriter::new("unused", 0).should_write(5));
    }

    #[test]
    fn test_snapshot_round_trips_through_disk() {
        let health = ComponentTypeId::new(0);
        let mut registry = ComponentRegistry::new();
        registry
            .register(ComponentSchema::new(health, "Health", vec![Field::new("hp", FieldKind::Uint(32))]))
            .unwrap();
        let mut world = WorldStorage::new("demo", registry, MemoryStorage::new());
        world.new_entity().unwrap();
        let e = world
            .create_entity(vec![(health, Bytes::from_static(b"10"))])
            .unwrap();

        let temp = tempdir().unwrap();
        let writer = SnapshotWriter::new(temp.path(), 1);
        let path = writer.maybe_write(&world, 0).unwrap().unwrap();
        assert!(path.ends_with("demo/tick_000000.json"));

        let snapshot = load_snapshot(&path).unwrap();
        assert_eq!(snapshot.entity_count, 2);
        assert_eq!(snapshot.archetypes.len(), 2);
        assert_eq!(snapshot.archetypes[1].layout, Layout::new([health]));
        assert_eq!(snapshot.archetypes[1].members, vec![e]);
    }
}
