//! Storage contracts for archetypes, component data and entity indices
//!
//! Each trait covers one concern. A backend implements all of them plus
//! [`StorageBackend`], which adds the transaction boundary that keeps the
//! indices consistent across multi-step mutations. Every component-scoped
//! method takes the component type explicitly.

pub mod error;
pub mod kv;
pub mod memory;

use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ecs::{Archetype, ArchetypeIndex, ComponentTypeId, EntityEntry, EntityId, Layout, LayoutFilter};

pub use error::{ErrorKind, StorageError};
pub use kv::adapter::KvStorage;
pub use memory::MemoryStorage;

/// Offset into one archetype's per-component lists.
pub type ComponentIndex = usize;

pub type StorageResult<T> = Result<T, StorageError>;

/// Where an entity's data currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub archetype: ArchetypeIndex,
    pub position: ComponentIndex,
}

impl Location {
    pub fn new(archetype: ArchetypeIndex, position: ComponentIndex) -> Self {
        Self {
            archetype,
            position,
        }
    }
}

bitflags! {
    /// What a backend can do. Callers check these instead of discovering a
    /// gap through a failed call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        const ARCHETYPE_SEARCH = 1 << 0;
        const ENTITY_LIFECYCLE = 1 << 1;
        const ATOMIC_MUTATIONS = 1 << 2;
        /// Several handles may address the same data.
        const SHARED = 1 << 3;
        /// Data survives the process.
        const PERSISTENT = 1 << 4;
    }
}

pub trait ArchetypeStore {
    /// Appends a new archetype. Fails if one with this layout already exists.
    fn push_archetype(&mut self, layout: Layout) -> StorageResult<ArchetypeIndex>;
    fn find_archetype(&self, layout: &Layout) -> StorageResult<Option<ArchetypeIndex>>;
    fn archetype(&self, index: ArchetypeIndex) -> StorageResult<Archetype>;
    fn archetype_layout(&self, index: ArchetypeIndex) -> StorageResult<Layout>;
    fn archetype_count(&self) -> StorageResult<usize>;
    /// Indices from `start` onward whose layout passes `filter`, in creation
    /// order. Archetypes are never removed, so a caller that remembers the
    /// archetype count can later scan only what was added since.
    fn search_from(&self, filter: &LayoutFilter, start: ArchetypeIndex) -> StorageResult<Vec<ArchetypeIndex>>;
    fn push_entity(&mut self, index: ArchetypeIndex, entity: EntityId) -> StorageResult<ComponentIndex>;
    /// Removes the member at `position`, moving the last member into its slot.
    fn swap_remove_entity(&mut self, index: ArchetypeIndex, position: ComponentIndex) -> StorageResult<EntityId>;
    fn member(&self, index: ArchetypeIndex, position: ComponentIndex) -> StorageResult<EntityId>;
    fn member_count(&self, index: ArchetypeIndex) -> StorageResult<usize>;

    fn search(&self, filter: &LayoutFilter) -> StorageResult<Vec<ArchetypeIndex>> {
        self.search_from(filter, ArchetypeIndex::new(0))
    }

    fn archetype_for(&mut self, layout: &Layout) -> StorageResult<ArchetypeIndex> {
        match self.find_archetype(layout)? {
            Some(index) => Ok(index),
            None => {
                let index = self.push_archetype(layout.clone())?;
                log::debug!("created archetype {index} for layout [{}]", layout.signature());
                Ok(index)
            }
        }
    }
}

pub trait ComponentStore {
    /// Appends at the current count for `(component, archetype)`.
    fn push_component(
        &mut self,
        component: ComponentTypeId,
        archetype: ArchetypeIndex,
        payload: Bytes,
    ) -> StorageResult<ComponentIndex>;
    fn component(
        &self,
        component: ComponentTypeId,
        archetype: ArchetypeIndex,
        position: ComponentIndex,
    ) -> StorageResult<Bytes>;
    fn set_component(
        &mut self,
        component: ComponentTypeId,
        archetype: ArchetypeIndex,
        position: ComponentIndex,
        payload: Bytes,
    ) -> StorageResult<()>;
    /// Removes and returns the payload at `position`; the tail payload takes
    /// its place.
    fn swap_remove_component(
        &mut self,
        component: ComponentTypeId,
        archetype: ArchetypeIndex,
        position: ComponentIndex,
    ) -> StorageResult<Bytes>;
    fn contains_component(
        &self,
        component: ComponentTypeId,
        archetype: ArchetypeIndex,
        position: ComponentIndex,
    ) -> StorageResult<bool>;

    /// Moves one payload to the tail of `destination`, swap-removing the
    /// source slot. Returns the new position.
    fn move_component(
        &mut self,
        component: ComponentTypeId,
        source: ArchetypeIndex,
        position: ComponentIndex,
        destination: ArchetypeIndex,
    ) -> StorageResult<ComponentIndex> {
        let payload = self.swap_remove_component(component, source, position)?;
        self.push_component(component, destination, payload)
    }
}

/// Occupied length per `(component, archetype)`.
///
/// Component stores keep this in step with their lists; the setters are
/// exposed for stores built on top of these primitives.
pub trait ComponentIndexStore {
    fn component_count(&self, component: ComponentTypeId, archetype: ArchetypeIndex) -> StorageResult<ComponentIndex>;
    fn set_component_count(
        &mut self,
        component: ComponentTypeId,
        archetype: ArchetypeIndex,
        count: ComponentIndex,
    ) -> StorageResult<()>;

    fn increment_component_count(
        &mut self,
        component: ComponentTypeId,
        archetype: ArchetypeIndex,
    ) -> StorageResult<ComponentIndex> {
        let count = self.component_count(component, archetype)? + 1;
        self.set_component_count(component, archetype, count)?;
        Ok(count)
    }

    fn decrement_component_count(
        &mut self,
        component: ComponentTypeId,
        archetype: ArchetypeIndex,
    ) -> StorageResult<ComponentIndex> {
        let count = self.component_count(component, archetype)?;
        let Some(count) = count.checked_sub(1) else {
            return Err(StorageError::invariant(format!(
                "count for component {component} in archetype {archetype} is already zero"
            )));
        };
        self.set_component_count(component, archetype, count)?;
        Ok(count)
    }
}

pub trait LocationStore {
    /// Records a location, counting the entity if it had none.
    fn insert_location(
        &mut self,
        entity: EntityId,
        archetype: ArchetypeIndex,
        position: ComponentIndex,
    ) -> StorageResult<()>;
    /// Overwrites an existing location.
    fn set_location(&mut self, entity: EntityId, location: Location) -> StorageResult<()>;
    fn location(&self, entity: EntityId) -> StorageResult<Location>;
    fn remove_location(&mut self, entity: EntityId) -> StorageResult<Location>;
    fn contains_location(&self, entity: EntityId) -> StorageResult<bool>;
    fn location_count(&self) -> StorageResult<usize>;
}

pub trait EntityLedger {
    /// Issues an identifier that was never handed out before.
    fn next_entity_id(&mut self) -> StorageResult<EntityId>;
    fn set_entry(&mut self, entity: EntityId, entry: &EntityEntry) -> StorageResult<()>;
    fn entry(&self, entity: EntityId) -> StorageResult<EntityEntry>;
    fn remove_entry(&mut self, entity: EntityId) -> StorageResult<EntityEntry>;
    fn contains_entry(&self, entity: EntityId) -> StorageResult<bool>;
}

pub trait StorageBackend:
    ArchetypeStore + ComponentStore + ComponentIndexStore + LocationStore + EntityLedger
{
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Runs `f` as one all-or-nothing mutation.
    ///
    /// If `f` fails, none of its writes remain visible. Backends using
    /// optimistic locking may run `f` more than once. Calls nested inside
    /// `f` join the outer transaction.
    fn atomically<T, F>(&mut self, f: F) -> StorageResult<T>
    where
        Self: Sized,
        F: FnMut(&mut Self) -> StorageResult<T>;
}
