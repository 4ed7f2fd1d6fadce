//! Storage backend over any [`KvStore`]
//!
//! Every logical mutation runs in a transaction overlay: reads go through
//! the overlay (so a transaction sees its own writes) and remember the
//! committed value they saw, writes are buffered. Commit sends one batch
//! guarded on everything read; a conflict re-runs the whole mutation.
//!
//! Component payloads live in a hash keyed by position next to an explicit
//! count, so removal is a true swap-remove: the tail payload is written into
//! the vacated position and the tail field is deleted.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::ecs::{Archetype, ArchetypeIndex, ComponentTypeId, EntityEntry, EntityId, Layout, LayoutFilter};
use crate::storage::{
    ArchetypeStore, Capabilities, ComponentIndex, ComponentIndexStore, ComponentStore, EntityLedger,
    Location, LocationStore, StorageBackend, StorageError, StorageResult,
};

use super::keys::{LAYOUT_FIELD, LEN_FIELD};
use super::{KvCapabilities, KvError, KvStore, Keys, Slot, WriteBatch};

pub const DEFAULT_MAX_RETRIES: u32 = 8;

#[derive(Default)]
struct Overlay {
    observed: HashMap<Slot, Option<Bytes>>,
    writes: BTreeMap<Slot, Option<Bytes>>,
}

impl Overlay {
    fn into_batch(self) -> WriteBatch {
        let mut batch = WriteBatch::new();
        for (slot, expected) in self.observed {
            batch.guard(slot, expected);
        }
        for (slot, value) in self.writes {
            match value {
                Some(value) => batch.put(slot, value),
                None => batch.delete(slot),
            };
        }
        batch
    }
}

pub struct KvStorage<S> {
    store: S,
    keys: Keys,
    max_retries: u32,
    overlay: RefCell<Option<Overlay>>,
}

impl<S: KvStore> KvStorage<S> {
    pub fn new(store: S, world_id: impl Into<String>) -> Self {
        Self {
            store,
            keys: Keys::new(world_id),
            max_retries: DEFAULT_MAX_RETRIES,
            overlay: RefCell::new(None),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn read(&self, slot: Slot) -> StorageResult<Option<Bytes>> {
        let mut overlay = self.overlay.borrow_mut();
        let Some(overlay) = overlay.as_mut() else {
            return Ok(self.store.read(&slot)?);
        };
        if let Some(value) = overlay.writes.get(&slot) {
            return Ok(value.clone());
        }
        if let Some(value) = overlay.observed.get(&slot) {
            return Ok(value.clone());
        }
        let value = self.store.read(&slot)?;
        overlay.observed.insert(slot, value.clone());
        Ok(value)
    }

    fn write(&mut self, slot: Slot, value: Option<Bytes>) -> StorageResult<()> {
        match self.overlay.get_mut() {
            Some(overlay) => {
                overlay.writes.insert(slot, value);
                Ok(())
            }
            None => Err(StorageError::invariant(format!(
                "write to {slot} outside of a transaction"
            ))),
        }
    }

    fn read_json<T: DeserializeOwned>(&self, slot: Slot, what: &'static str) -> StorageResult<Option<T>> {
        let Some(bytes) = self.read(slot.clone())? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StorageError::Decode {
                what,
                key: slot.to_string(),
                source,
            })
    }

    fn write_json<T: Serialize>(&mut self, slot: Slot, value: &T, what: &'static str) -> StorageResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|source| StorageError::Encode { what, source })?;
        self.write(slot, Some(Bytes::from(bytes)))
    }

    fn archetype_field(&self, archetype: ArchetypeIndex, field: impl Into<String>) -> Slot {
        Slot::field(self.keys.archetype(archetype), field)
    }

    fn payload_slot(&self, component: ComponentTypeId, archetype: ArchetypeIndex, position: ComponentIndex) -> Slot {
        Slot::field(self.keys.component_data(component, archetype), position.to_string())
    }

    fn check_column(&self, component: ComponentTypeId, archetype: ArchetypeIndex) -> StorageResult<()> {
        if self.archetype_layout(archetype)?.has_component(component) {
            Ok(())
        } else {
            Err(StorageError::ComponentNotInArchetype {
                component,
                archetype,
            })
        }
    }

    fn checked_position(
        &self,
        component: ComponentTypeId,
        archetype: ArchetypeIndex,
        position: ComponentIndex,
    ) -> StorageResult<ComponentIndex> {
        let count = self.component_count(component, archetype)?;
        if position >= count {
            return Err(StorageError::ComponentNotFound {
                component,
                archetype,
                position,
            });
        }
        Ok(count)
    }

    fn payload(&self, component: ComponentTypeId, archetype: ArchetypeIndex, position: ComponentIndex) -> StorageResult<Bytes> {
        self.read(self.payload_slot(component, archetype, position))?
            .ok_or_else(|| {
                StorageError::invariant(format!(
                    "component {component} in archetype {archetype} counts slot {position} but it holds no payload"
                ))
            })
    }
}

impl<S: KvStore> ArchetypeStore for KvStorage<S> {
    fn push_archetype(&mut self, layout: Layout) -> StorageResult<ArchetypeIndex> {
        self.atomically(|s| {
            if let Some(existing) = s.find_archetype(&layout)? {
                return Err(StorageError::InvalidLayout(format!(
                    "layout [{}] already belongs to archetype {existing}",
                    layout.signature()
                )));
            }
            let index = ArchetypeIndex::new(s.archetype_count()?);
            s.write_json(s.archetype_field(index, LAYOUT_FIELD), &layout, "archetype layout")?;
            s.write_json(s.archetype_field(index, LEN_FIELD), &0usize, "archetype length")?;
            let layouts = Slot::field(s.keys.archetype_layouts(), layout.signature());
            s.write_json(layouts, &index, "layout index")?;
            s.write_json(Slot::value(s.keys.archetype_len()), &(index.raw() + 1), "archetype count")?;
            Ok(index)
        })
    }

    fn find_archetype(&self, layout: &Layout) -> StorageResult<Option<ArchetypeIndex>> {
        let slot = Slot::field(self.keys.archetype_layouts(), layout.signature());
        self.read_json(slot, "layout index")
    }

    fn archetype(&self, index: ArchetypeIndex) -> StorageResult<Archetype> {
        let layout = self.archetype_layout(index)?;
        let count = self.member_count(index)?;
        let members = (0..count)
            .map(|position| self.member(index, position))
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(Archetype::with_members(index, layout, members))
    }

    fn archetype_layout(&self, index: ArchetypeIndex) -> StorageResult<Layout> {
        self.read_json(self.archetype_field(index, LAYOUT_FIELD), "archetype layout")?
            .ok_or(StorageError::ArchetypeNotFound(index))
    }

    fn archetype_count(&self) -> StorageResult<usize> {
        Ok(self
            .read_json(Slot::value(self.keys.archetype_len()), "archetype count")?
            .unwrap_or(0))
    }

    fn search_from(&self, filter: &LayoutFilter, start: ArchetypeIndex) -> StorageResult<Vec<ArchetypeIndex>> {
        let mut found = Vec::new();
        for raw in start.raw()..self.archetype_count()? {
            let index = ArchetypeIndex::new(raw);
            if filter.matches(&self.archetype_layout(index)?) {
                found.push(index);
            }
        }
        Ok(found)
    }

    fn push_entity(&mut self, index: ArchetypeIndex, entity: EntityId) -> StorageResult<ComponentIndex> {
        self.atomically(|s| {
            let position = s.member_count(index)?;
            s.write_json(s.archetype_field(index, position.to_string()), &entity, "archetype member")?;
            s.write_json(s.archetype_field(index, LEN_FIELD), &(position + 1), "archetype length")?;
            Ok(position)
        })
    }

    fn swap_remove_entity(&mut self, index: ArchetypeIndex, position: ComponentIndex) -> StorageResult<EntityId> {
        self.atomically(|s| {
            let removed = s.member(index, position)?;
            let last = s.member_count(index)? - 1;
            if position != last {
                let tail = s.member(index, last)?;
                s.write_json(s.archetype_field(index, position.to_string()), &tail, "archetype member")?;
            }
            s.write(s.archetype_field(index, last.to_string()), None)?;
            s.write_json(s.archetype_field(index, LEN_FIELD), &last, "archetype length")?;
            Ok(removed)
        })
    }

    fn member(&self, index: ArchetypeIndex, position: ComponentIndex) -> StorageResult<EntityId> {
        if position >= self.member_count(index)? {
            return Err(StorageError::MemberNotFound {
                archetype: index,
                position,
            });
        }
        self.read_json(self.archetype_field(index, position.to_string()), "archetype member")?
            .ok_or_else(|| {
                StorageError::invariant(format!(
                    "archetype {index} counts member {position} but has no record for it"
                ))
            })
    }

    fn member_count(&self, index: ArchetypeIndex) -> StorageResult<usize> {
        self.read_json(self.archetype_field(index, LEN_FIELD), "archetype length")?
            .ok_or(StorageError::ArchetypeNotFound(index))
    }
}

impl<S: KvStore> ComponentStore for KvStorage<S> {
    fn push_component(
        &mut self,
        component: ComponentTypeId,
        archetype: ArchetypeIndex,
        payload: Bytes,
    ) -> StorageResult<ComponentIndex> {
        self.atomically(|s| {
            let position = s.component_count(component, archetype)?;
            s.write(s.payload_slot(component, archetype, position), Some(payload.clone()))?;
            s.increment_component_count(component, archetype)?;
            Ok(position)
        })
    }

    fn component(
        &self,
        component: ComponentTypeId,
        archetype: ArchetypeIndex,
        position: ComponentIndex,
    ) -> StorageResult<Bytes> {
        self.checked_position(component, archetype, position)?;
        self.payload(component, archetype, position)
    }

    fn set_component(
        &mut self,
        component: ComponentTypeId,
        archetype: ArchetypeIndex,
        position: ComponentIndex,
        payload: Bytes,
    ) -> StorageResult<()> {
        self.atomically(|s| {
            s.checked_position(component, archetype, position)?;
            s.write(s.payload_slot(component, archetype, position), Some(payload.clone()))
        })
    }

    fn swap_remove_component(
        &mut self,
        component: ComponentTypeId,
        archetype: ArchetypeIndex,
        position: ComponentIndex,
    ) -> StorageResult<Bytes> {
        self.atomically(|s| {
            let count = s.checked_position(component, archetype, position)?;
            let removed = s.payload(component, archetype, position)?;
            let last = count - 1;
            if position != last {
                let tail = s.payload(component, archetype, last)?;
                s.write(s.payload_slot(component, archetype, position), Some(tail))?;
            }
            s.write(s.payload_slot(component, archetype, last), None)?;
            s.decrement_component_count(component, archetype)?;
            Ok(removed)
        })
    }

    fn contains_component(
        &self,
        component: ComponentTypeId,
        archetype: ArchetypeIndex,
        position: ComponentIndex,
    ) -> StorageResult<bool> {
        Ok(position < self.component_count(component, archetype)?)
    }
}

impl<S: KvStore> ComponentIndexStore for KvStorage<S> {
    fn component_count(&self, component: ComponentTypeId, archetype: ArchetypeIndex) -> StorageResult<ComponentIndex> {
        self.check_column(component, archetype)?;
        let slot = Slot::value(self.keys.component_index(component, archetype));
        Ok(self.read_json(slot, "component count")?.unwrap_or(0))
    }

    fn set_component_count(
        &mut self,
        component: ComponentTypeId,
        archetype: ArchetypeIndex,
        count: ComponentIndex,
    ) -> StorageResult<()> {
        self.atomically(|s| {
            s.check_column(component, archetype)?;
            let slot = Slot::value(s.keys.component_index(component, archetype));
            s.write_json(slot, &count, "component count")
        })
    }
}

impl<S: KvStore> LocationStore for KvStorage<S> {
    fn insert_location(
        &mut self,
        entity: EntityId,
        archetype: ArchetypeIndex,
        position: ComponentIndex,
    ) -> StorageResult<()> {
        self.atomically(|s| {
            let existed = s.contains_location(entity)?;
            let slot = Slot::value(s.keys.entity_location(entity));
            s.write_json(slot, &Location::new(archetype, position), "location")?;
            if !existed {
                let count = s.location_count()? + 1;
                s.write_json(Slot::value(s.keys.entity_location_len()), &count, "location count")?;
            }
            Ok(())
        })
    }

    fn set_location(&mut self, entity: EntityId, location: Location) -> StorageResult<()> {
        self.atomically(|s| {
            if !s.contains_location(entity)? {
                return Err(StorageError::EntityNotFound(entity));
            }
            s.write_json(Slot::value(s.keys.entity_location(entity)), &location, "location")
        })
    }

    fn location(&self, entity: EntityId) -> StorageResult<Location> {
        self.read_json(Slot::value(self.keys.entity_location(entity)), "location")?
            .ok_or(StorageError::EntityNotFound(entity))
    }

    fn remove_location(&mut self, entity: EntityId) -> StorageResult<Location> {
        self.atomically(|s| {
            let location = s.location(entity)?;
            s.write(Slot::value(s.keys.entity_location(entity)), None)?;
            let Some(count) = s.location_count()?.checked_sub(1) else {
                return Err(StorageError::invariant("location count is already zero"));
            };
            s.write_json(Slot::value(s.keys.entity_location_len()), &count, "location count")?;
            Ok(location)
        })
    }

    fn contains_location(&self, entity: EntityId) -> StorageResult<bool> {
        Ok(self.read(Slot::value(self.keys.entity_location(entity)))?.is_some())
    }

    fn location_count(&self) -> StorageResult<usize> {
        Ok(self
            .read_json(Slot::value(self.keys.entity_location_len()), "location count")?
            .unwrap_or(0))
    }
}

impl<S: KvStore> EntityLedger for KvStorage<S> {
    fn next_entity_id(&mut self) -> StorageResult<EntityId> {
        self.atomically(|s| {
            let slot = Slot::value(s.keys.next_entity_id());
            let next: u64 = s.read_json(slot.clone(), "next entity id")?.unwrap_or(0);
            s.write_json(slot, &(next + 1), "next entity id")?;
            Ok(EntityId::new(next))
        })
    }

    fn set_entry(&mut self, entity: EntityId, entry: &EntityEntry) -> StorageResult<()> {
        self.atomically(|s| s.write(Slot::value(s.keys.entity(entity)), Some(entry.as_bytes().clone())))
    }

    fn entry(&self, entity: EntityId) -> StorageResult<EntityEntry> {
        self.read(Slot::value(self.keys.entity(entity)))?
            .map(EntityEntry::from_bytes)
            .ok_or(StorageError::EntityNotFound(entity))
    }

    fn remove_entry(&mut self, entity: EntityId) -> StorageResult<EntityEntry> {
        self.atomically(|s| {
            let entry = s.entry(entity)?;
            s.write(Slot::value(s.keys.entity(entity)), None)?;
            Ok(entry)
        })
    }

    fn contains_entry(&self, entity: EntityId) -> StorageResult<bool> {
        Ok(self.read(Slot::value(self.keys.entity(entity)))?.is_some())
    }
}

impl<S: KvStore> StorageBackend for KvStorage<S> {
    fn name(&self) -> &'static str {
        self.store.name()
    }

    fn capabilities(&self) -> Capabilities {
        let store = self.store.capabilities();
        let mut capabilities = Capabilities::ARCHETYPE_SEARCH | Capabilities::SHARED;
        if store.contains(KvCapabilities::GUARDED_BATCH) {
            capabilities |= Capabilities::ATOMIC_MUTATIONS | Capabilities::ENTITY_LIFECYCLE;
        }
        if store.contains(KvCapabilities::PERSISTENT) {
            capabilities |= Capabilities::PERSISTENT;
        }
        capabilities
    }

    fn atomically<T, F>(&mut self, mut f: F) -> StorageResult<T>
    where
        F: FnMut(&mut Self) -> StorageResult<T>,
    {
        if self.overlay.get_mut().is_some() {
            return f(self);
        }
        if !self.store.capabilities().contains(KvCapabilities::GUARDED_BATCH) {
            return Err(StorageError::Unsupported {
                operation: "atomic mutation",
                backend: self.store.name(),
            });
        }
        let attempts = self.max_retries + 1;
        for attempt in 1..=attempts {
            *self.overlay.get_mut() = Some(Overlay::default());
            let result = f(self);
            let overlay = self.overlay.get_mut().take().unwrap_or_default();
            let value = result?;
            if overlay.writes.is_empty() {
                return Ok(value);
            }
            match self.store.commit(overlay.into_batch()) {
                Ok(()) => return Ok(value),
                Err(KvError::Conflict) => {
                    log::debug!(
                        "world {} commit conflicted (attempt {attempt}/{attempts}), retrying",
                        self.keys.world_id()
                    );
                }
                Err(err @ KvError::Transport(_)) => return Err(StorageError::CommitUncertain(err)),
                Err(err) => return Err(err.into()),
            }
        }
        log::warn!(
            "world {} gave up after {attempts} conflicting commits",
            self.keys.world_id()
        );
        Err(StorageError::Contention { attempts })
    }
}
