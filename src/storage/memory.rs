//! In-process storage backend
//!
//! Keeps everything in plain collections. Inside [`StorageBackend::atomically`]
//! every mutation records its inverse in a journal, and a failed transaction
//! replays the journal backwards.

use std::collections::HashMap;

use bytes::Bytes;

use crate::ecs::{Archetype, ArchetypeIndex, ComponentTypeId, EntityEntry, EntityId, Layout, LayoutFilter};

use super::{
    ArchetypeStore, Capabilities, ComponentIndex, ComponentIndexStore, ComponentStore, EntityLedger,
    Location, LocationStore, StorageBackend, StorageError, StorageResult,
};

type ColumnKey = (ComponentTypeId, ArchetypeIndex);

enum Undo {
    PopArchetype,
    PopMember(ArchetypeIndex),
    RestoreMember {
        archetype: ArchetypeIndex,
        position: ComponentIndex,
        entity: EntityId,
    },
    PopComponent(ColumnKey),
    RestoreComponent {
        column: ColumnKey,
        position: ComponentIndex,
        payload: Bytes,
    },
    ResetComponent {
        column: ColumnKey,
        position: ComponentIndex,
        payload: Bytes,
    },
    Count {
        column: ColumnKey,
        previous: Option<ComponentIndex>,
    },
    Location {
        entity: EntityId,
        previous: Option<Location>,
        count: usize,
    },
    Entry {
        entity: EntityId,
        previous: Option<EntityEntry>,
    },
    NextEntity(u64),
}

#[derive(Default)]
pub struct MemoryStorage {
    archetypes: Vec<Archetype>,
    layouts: HashMap<Layout, ArchetypeIndex>,
    columns: HashMap<ColumnKey, Vec<Bytes>>,
    counts: HashMap<ColumnKey, ComponentIndex>,
    locations: HashMap<EntityId, Location>,
    location_count: usize,
    entries: HashMap<EntityId, EntityEntry>,
    next_entity: u64,
    journal: Option<Vec<Undo>>,
    advertised: Option<Capabilities>,
}

impl MemoryStorage {
    const FULL_CAPABILITIES: Capabilities = Capabilities::ARCHETYPE_SEARCH
        .union(Capabilities::ENTITY_LIFECYCLE)
        .union(Capabilities::ATOMIC_MUTATIONS);

    pub fn new() -> Self {
        Self::default()
    }

    /// Advertises only `capabilities`, for exercising callers against a
    /// backend with gaps.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.advertised = Some(capabilities & Self::FULL_CAPABILITIES);
        self
    }

    fn record(&mut self, undo: Undo) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(undo);
        }
    }

    fn rollback(&mut self, journal: Vec<Undo>) {
        log::debug!("rolling back {} in-memory writes", journal.len());
        for undo in journal.into_iter().rev() {
            match undo {
                Undo::PopArchetype => {
                    if let Some(archetype) = self.archetypes.pop() {
                        self.layouts.remove(archetype.layout());
                    }
                }
                Undo::PopMember(index) => {
                    if let Some(archetype) = self.archetypes.get_mut(index.raw()) {
                        archetype.members_mut().pop();
                    }
                }
                Undo::RestoreMember {
                    archetype,
                    position,
                    entity,
                } => {
                    if let Some(archetype) = self.archetypes.get_mut(archetype.raw()) {
                        let members = archetype.members_mut();
                        members.push(entity);
                        let last = members.len() - 1;
                        members.swap(position, last);
                    }
                }
                Undo::PopComponent(column) => {
                    if let Some(list) = self.columns.get_mut(&column) {
                        list.pop();
                    }
                }
                Undo::RestoreComponent {
                    column,
                    position,
                    payload,
                } => {
                    let list = self.columns.entry(column).or_default();
                    list.push(payload);
                    let last = list.len() - 1;
                    list.swap(position, last);
                }
                Undo::ResetComponent {
                    column,
                    position,
                    payload,
                } => {
                    if let Some(slot) = self.columns.get_mut(&column).and_then(|l| l.get_mut(position)) {
                        *slot = payload;
                    }
                }
                Undo::Count { column, previous } => match previous {
                    Some(count) => {
                        self.counts.insert(column, count);
                    }
                    None => {
                        self.counts.remove(&column);
                    }
                },
                Undo::Location {
                    entity,
                    previous,
                    count,
                } => {
                    match previous {
                        Some(location) => self.locations.insert(entity, location),
                        None => self.locations.remove(&entity),
                    };
                    self.location_count = count;
                }
                Undo::Entry { entity, previous } => {
                    match previous {
                        Some(entry) => self.entries.insert(entity, entry),
                        None => self.entries.remove(&entity),
                    };
                }
                Undo::NextEntity(next) => self.next_entity = next,
            }
        }
    }

    fn archetype_ref(&self, index: ArchetypeIndex) -> StorageResult<&Archetype> {
        self.archetypes
            .get(index.raw())
            .ok_or(StorageError::ArchetypeNotFound(index))
    }

    fn archetype_mut(&mut self, index: ArchetypeIndex) -> StorageResult<&mut Archetype> {
        self.archetypes
            .get_mut(index.raw())
            .ok_or(StorageError::ArchetypeNotFound(index))
    }

    fn check_column(&self, component: ComponentTypeId, archetype: ArchetypeIndex) -> StorageResult<()> {
        if self.archetype_ref(archetype)?.layout().has_component(component) {
            Ok(())
        } else {
            Err(StorageError::ComponentNotInArchetype {
                component,
                archetype,
            })
        }
    }

    fn column(&self, component: ComponentTypeId, archetype: ArchetypeIndex) -> StorageResult<&[Bytes]> {
        self.check_column(component, archetype)?;
        Ok(self
            .columns
            .get(&(component, archetype))
            .map(Vec::as_slice)
            .unwrap_or(&[]))
    }
}

impl ArchetypeStore for MemoryStorage {
    fn push_archetype(&mut self, layout: Layout) -> StorageResult<ArchetypeIndex> {
        if let Some(existing) = self.layouts.get(&layout) {
            return Err(StorageError::InvalidLayout(format!(
                "layout [{}] already belongs to archetype {existing}",
                layout.signature()
            )));
        }
        let index = ArchetypeIndex::new(self.archetypes.len());
        self.layouts.insert(layout.clone(), index);
        self.archetypes.push(Archetype::new(index, layout));
        self.record(Undo::PopArchetype);
        Ok(index)
    }

    fn find_archetype(&self, layout: &Layout) -> StorageResult<Option<ArchetypeIndex>> {
        let Some(&index) = self.layouts.get(layout) else {
            return Ok(None);
        };
        if !self.archetype_ref(index)?.layout_matches(layout.components()) {
            return Err(StorageError::invariant(format!(
                "layout index maps [{}] to archetype {index} with a different layout",
                layout.signature()
            )));
        }
        Ok(Some(index))
    }

    fn archetype(&self, index: ArchetypeIndex) -> StorageResult<Archetype> {
        self.archetype_ref(index).cloned()
    }

    fn archetype_layout(&self, index: ArchetypeIndex) -> StorageResult<Layout> {
        Ok(self.archetype_ref(index)?.layout().clone())
    }

    fn archetype_count(&self) -> StorageResult<usize> {
        Ok(self.archetypes.len())
    }

    fn search_from(&self, filter: &LayoutFilter, start: ArchetypeIndex) -> StorageResult<Vec<ArchetypeIndex>> {
        Ok(self
            .archetypes
            .iter()
            .skip(start.raw())
            .filter(|archetype| filter.matches(archetype.layout()))
            .map(Archetype::index)
            .collect())
    }

    fn push_entity(&mut self, index: ArchetypeIndex, entity: EntityId) -> StorageResult<ComponentIndex> {
        let position = self.archetype_mut(index)?.push_entity(entity);
        self.record(Undo::PopMember(index));
        Ok(position)
    }

    fn swap_remove_entity(&mut self, index: ArchetypeIndex, position: ComponentIndex) -> StorageResult<EntityId> {
        let entity = self
            .archetype_mut(index)?
            .swap_remove(position)
            .ok_or(StorageError::MemberNotFound {
                archetype: index,
                position,
            })?;
        self.record(Undo::RestoreMember {
            archetype: index,
            position,
            entity,
        });
        Ok(entity)
    }

    fn member(&self, index: ArchetypeIndex, position: ComponentIndex) -> StorageResult<EntityId> {
        self.archetype_ref(index)?
            .entities()
            .get(position)
            .copied()
            .ok_or(StorageError::MemberNotFound {
                archetype: index,
                position,
            })
    }

    fn member_count(&self, index: ArchetypeIndex) -> StorageResult<usize> {
        Ok(self.archetype_ref(index)?.count())
    }
}

impl ComponentStore for MemoryStorage {
    fn push_component(
        &mut self,
        component: ComponentTypeId,
        archetype: ArchetypeIndex,
        payload: Bytes,
    ) -> StorageResult<ComponentIndex> {
        let position = self.component_count(component, archetype)?;
        let list = self.columns.entry((component, archetype)).or_default();
        if list.len() != position {
            return Err(StorageError::invariant(format!(
                "component {component} in archetype {archetype} holds {} payloads but counts {position}",
                list.len()
            )));
        }
        list.push(payload);
        self.record(Undo::PopComponent((component, archetype)));
        self.increment_component_count(component, archetype)?;
        Ok(position)
    }

    fn component(
        &self,
        component: ComponentTypeId,
        archetype: ArchetypeIndex,
        position: ComponentIndex,
    ) -> StorageResult<Bytes> {
        self.column(component, archetype)?
            .get(position)
            .cloned()
            .ok_or(StorageError::ComponentNotFound {
                component,
                archetype,
                position,
            })
    }

    fn set_component(
        &mut self,
        component: ComponentTypeId,
        archetype: ArchetypeIndex,
        position: ComponentIndex,
        payload: Bytes,
    ) -> StorageResult<()> {
        self.check_column(component, archetype)?;
        let slot = self
            .columns
            .get_mut(&(component, archetype))
            .and_then(|list| list.get_mut(position))
            .ok_or(StorageError::ComponentNotFound {
                component,
                archetype,
                position,
            })?;
        let previous = std::mem::replace(slot, payload);
        self.record(Undo::ResetComponent {
            column: (component, archetype),
            position,
            payload: previous,
        });
        Ok(())
    }

    fn swap_remove_component(
        &mut self,
        component: ComponentTypeId,
        archetype: ArchetypeIndex,
        position: ComponentIndex,
    ) -> StorageResult<Bytes> {
        self.check_column(component, archetype)?;
        let list = self
            .columns
            .get_mut(&(component, archetype))
            .filter(|list| position < list.len())
            .ok_or(StorageError::ComponentNotFound {
                component,
                archetype,
                position,
            })?;
        let payload = list.swap_remove(position);
        self.record(Undo::RestoreComponent {
            column: (component, archetype),
            position,
            payload: payload.clone(),
        });
        self.decrement_component_count(component, archetype)?;
        Ok(payload)
    }

    fn contains_component(
        &self,
        component: ComponentTypeId,
        archetype: ArchetypeIndex,
        position: ComponentIndex,
    ) -> StorageResult<bool> {
        Ok(position < self.column(component, archetype)?.len())
    }
}

impl ComponentIndexStore for MemoryStorage {
    fn component_count(&self, component: ComponentTypeId, archetype: ArchetypeIndex) -> StorageResult<ComponentIndex> {
        self.check_column(component, archetype)?;
        Ok(self.counts.get(&(component, archetype)).copied().unwrap_or(0))
    }

    fn set_component_count(
        &mut self,
        component: ComponentTypeId,
        archetype: ArchetypeIndex,
        count: ComponentIndex,
    ) -> StorageResult<()> {
        self.check_column(component, archetype)?;
        let previous = self.counts.insert((component, archetype), count);
        self.record(Undo::Count {
            column: (component, archetype),
            previous,
        });
        Ok(())
    }
}

impl LocationStore for MemoryStorage {
    fn insert_location(
        &mut self,
        entity: EntityId,
        archetype: ArchetypeIndex,
        position: ComponentIndex,
    ) -> StorageResult<()> {
        let count = self.location_count;
        let previous = self.locations.insert(entity, Location::new(archetype, position));
        if previous.is_none() {
            self.location_count += 1;
        }
        self.record(Undo::Location {
            entity,
            previous,
            count,
        });
        Ok(())
    }

    fn set_location(&mut self, entity: EntityId, location: Location) -> StorageResult<()> {
        let slot = self
            .locations
            .get_mut(&entity)
            .ok_or(StorageError::EntityNotFound(entity))?;
        let previous = std::mem::replace(slot, location);
        let count = self.location_count;
        self.record(Undo::Location {
            entity,
            previous: Some(previous),
            count,
        });
        Ok(())
    }

    fn location(&self, entity: EntityId) -> StorageResult<Location> {
        self.locations
            .get(&entity)
            .copied()
            .ok_or(StorageError::EntityNotFound(entity))
    }

    fn remove_location(&mut self, entity: EntityId) -> StorageResult<Location> {
        let count = self.location_count;
        let previous = self
            .locations
            .remove(&entity)
            .ok_or(StorageError::EntityNotFound(entity))?;
        self.location_count -= 1;
        self.record(Undo::Location {
            entity,
            previous: Some(previous),
            count,
        });
        Ok(previous)
    }

    fn contains_location(&self, entity: EntityId) -> StorageResult<bool> {
        Ok(self.locations.contains_key(&entity))
    }

    fn location_count(&self) -> StorageResult<usize> {
        Ok(self.location_count)
    }
}

impl EntityLedger for MemoryStorage {
    fn next_entity_id(&mut self) -> StorageResult<EntityId> {
        let id = EntityId::new(self.next_entity);
        self.record(Undo::NextEntity(self.next_entity));
        self.next_entity += 1;
        Ok(id)
    }

    fn set_entry(&mut self, entity: EntityId, entry: &EntityEntry) -> StorageResult<()> {
        let previous = self.entries.insert(entity, entry.clone());
        self.record(Undo::Entry { entity, previous });
        Ok(())
    }

    fn entry(&self, entity: EntityId) -> StorageResult<EntityEntry> {
        self.entries
            .get(&entity)
            .cloned()
            .ok_or(StorageError::EntityNotFound(entity))
    }

    fn remove_entry(&mut self, entity: EntityId) -> StorageResult<EntityEntry> {
        let previous = self
            .entries
            .remove(&entity)
            .ok_or(StorageError::EntityNotFound(entity))?;
        self.record(Undo::Entry {
            entity,
            previous: Some(previous.clone()),
        });
        Ok(previous)
    }

    fn contains_entry(&self, entity: EntityId) -> StorageResult<bool> {
        Ok(self.entries.contains_key(&entity))
    }
}

impl StorageBackend for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        self.advertised.unwrap_or(Self::FULL_CAPABILITIES)
    }

    fn atomically<T, F>(&mut self, mut f: F) -> StorageResult<T>
    where
        F: FnMut(&mut Self) -> StorageResult<T>,
    {
        if self.journal.is_some() {
            return f(self);
        }
        self.journal = Some(Vec::new());
        let result = f(self);
        let journal = self.journal.take().unwrap_or_default();
        if result.is_err() {
            self.rollback(journal);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEALTH: ComponentTypeId = ComponentTypeId::new(1);
    const MANA: ComponentTypeId = ComponentTypeId::new(2);

    fn storage_with_archetype() -> (MemoryStorage, ArchetypeIndex) {
        let mut storage = MemoryStorage::new();
        let index = storage.archetype_for(&Layout::new([HEALTH])).unwrap();
        (storage, index)
    }

    #[test]
    fn test_component_counts_follow_pushes_and_removals() {
        let (mut storage, arch) = storage_with_archetype();
        assert_eq!(storage.component_count(HEALTH, arch).unwrap(), 0);
        assert_eq!(storage.push_component(HEALTH, arch, Bytes::from_static(b"a")).unwrap(), 0);
        assert_eq!(storage.push_component(HEALTH, arch, Bytes::from_static(b"b")).unwrap(), 1);
        assert_eq!(storage.component_count(HEALTH, arch).unwrap(), 2);

        let removed = storage.swap_remove_component(HEALTH, arch, 0).unwrap();
        assert_eq!(removed, Bytes::from_static(b"a"));
        assert_eq!(storage.component(HEALTH, arch, 0).unwrap(), Bytes::from_static(b"b"));
        assert_eq!(storage.component_count(HEALTH, arch).unwrap(), 1);
        assert!(!storage.contains_component(HEALTH, arch, 1).unwrap());
    }

    #[test]
    fn test_components_outside_layout_are_not_found() {
        let (mut storage, arch) = storage_with_archetype();
        let err = storage
            .push_component(MANA, arch, Bytes::from_static(b"x"))
            .unwrap_err();
        assert!(matches!(err, StorageError::ComponentNotInArchetype { .. }));
        let err = storage
            .component_count(HEALTH, ArchetypeIndex::new(9))
            .unwrap_err();
        assert!(matches!(err, StorageError::ArchetypeNotFound(_)));
    }

    #[test]
    fn test_layout_index_pointing_at_wrong_archetype_is_an_invariant_violation() {
        let (mut storage, health) = storage_with_archetype();
        let both = storage.archetype_for(&Layout::new([HEALTH, MANA])).unwrap();
        assert_eq!(storage.find_archetype(&Layout::new([MANA, HEALTH])).unwrap(), Some(both));

        storage.layouts.insert(Layout::new([HEALTH, MANA]), health);
        let err = storage.find_archetype(&Layout::new([HEALTH, MANA])).unwrap_err();
        assert!(matches!(err, StorageError::InvariantViolation(_)));
    }

    #[test]
    fn test_restricted_capabilities_never_exceed_the_backend() {
        let storage = MemoryStorage::new().with_capabilities(Capabilities::all());
        assert_eq!(storage.capabilities(), MemoryStorage::FULL_CAPABILITIES);
        assert!(!storage.capabilities().contains(Capabilities::PERSISTENT));
    }

    #[test]
    fn test_duplicate_layout_is_rejected() {
        let (mut storage, _) = storage_with_archetype();
        let err = storage.push_archetype(Layout::new([HEALTH])).unwrap_err();
        assert!(matches!(err, StorageError::InvalidLayout(_)));
    }

    #[test]
    fn test_failed_transaction_rolls_back_every_write() {
        let (mut storage, arch) = storage_with_archetype();
        storage.push_entity(arch, EntityId::new(0)).unwrap();
        storage.push_component(HEALTH, arch, Bytes::from_static(b"h0")).unwrap();
        storage.insert_location(EntityId::new(0), arch, 0).unwrap();

        let result: StorageResult<()> = storage.atomically(|s| {
            let id = s.next_entity_id()?;
            s.set_entry(id, &EntityEntry::empty())?;
            let other = s.archetype_for(&Layout::new([HEALTH, MANA]))?;
            s.push_entity(other, id)?;
            s.swap_remove_entity(arch, 0)?;
            s.swap_remove_component(HEALTH, arch, 0)?;
            s.remove_location(EntityId::new(0))?;
            s.set_component(HEALTH, arch, 5, Bytes::from_static(b"boom"))
        });
        assert!(result.is_err());

        assert_eq!(storage.archetype_count().unwrap(), 1);
        assert_eq!(storage.member(arch, 0).unwrap(), EntityId::new(0));
        assert_eq!(storage.component(HEALTH, arch, 0).unwrap(), Bytes::from_static(b"h0"));
        assert_eq!(storage.component_count(HEALTH, arch).unwrap(), 1);
        assert_eq!(storage.location(EntityId::new(0)).unwrap(), Location::new(arch, 0));
        assert_eq!(storage.location_count().unwrap(), 1);
        assert_eq!(storage.next_entity_id().unwrap(), EntityId::new(0));
        assert!(storage.find_archetype(&Layout::new([HEALTH, MANA])).unwrap().is_none());
    }

    #[test]
    fn test_set_location_requires_existing_record() {
        let mut storage = MemoryStorage::new();
        let err = storage
            .set_location(EntityId::new(3), Location::new(ArchetypeIndex::new(0), 0))
            .unwrap_err();
        assert!(matches!(err, StorageError::EntityNotFound(_)));
        assert_eq!(storage.location_count().unwrap(), 0);
    }
}
