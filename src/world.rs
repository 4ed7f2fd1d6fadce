//! World storage: one handle per world over a [`StorageBackend`]
//!
//! Every entity always has a location. A fresh entity sits in the archetype
//! of the empty layout; adding or removing a component moves it to the
//! archetype of the new layout. A move touches the member list and every
//! component list of both archetypes plus up to two location records, so
//! each mutation here runs inside [`StorageBackend::atomically`].

use bytes::Bytes;

use crate::ecs::{
    Archetype, ArchetypeIndex, ComponentRegistry, ComponentTypeId, EntityEntry, EntityId, Layout,
    LayoutFilter,
};
use crate::storage::{Capabilities, Location, StorageBackend, StorageError, StorageResult};

pub struct WorldStorage<B> {
    world_id: String,
    registry: ComponentRegistry,
    backend: B,
}

impl<B: StorageBackend> WorldStorage<B> {
    pub fn new(world_id: impl Into<String>, registry: ComponentRegistry, backend: B) -> Self {
        let world_id = world_id.into();
        log::debug!(
            "world {world_id} opened on {} backend with {} component types",
            backend.name(),
            registry.len()
        );
        Self {
            world_id,
            registry,
            backend,
        }
    }

    pub fn world_id(&self) -> &str {
        &self.world_id
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn capabilities(&self) -> Capabilities {
        self.backend.capabilities()
    }

    fn require(&self, capability: Capabilities, operation: &'static str) -> StorageResult<()> {
        if self.backend.capabilities().contains(capability) {
            Ok(())
        } else {
            Err(StorageError::Unsupported {
                operation,
                backend: self.backend.name(),
            })
        }
    }

    fn check_registered(&self, component: ComponentTypeId) -> StorageResult<()> {
        if self.registry.contains(component) {
            Ok(())
        } else {
            Err(StorageError::InvalidLayout(format!(
                "component {component} is not registered"
            )))
        }
    }

    /// Issues an id, creates an empty entry and places the entity in the
    /// empty-layout archetype.
    pub fn new_entity(&mut self) -> StorageResult<EntityId> {
        self.create_entity(Vec::new())
    }

    /// Creates an entity directly in the archetype of its component set.
    pub fn create_entity(&mut self, components: Vec<(ComponentTypeId, Bytes)>) -> StorageResult<EntityId> {
        self.require(Capabilities::ENTITY_LIFECYCLE, "create entity")?;
        for (index, (component, _)) in components.iter().enumerate() {
            self.check_registered(*component)?;
            if components[..index].iter().any(|(earlier, _)| earlier == component) {
                return Err(StorageError::InvalidLayout(format!(
                    "component {component} given twice"
                )));
            }
        }
        let layout: Layout = components.iter().map(|(component, _)| *component).collect();

        self.backend.atomically(|b| {
            let entity = b.next_entity_id()?;
            b.set_entry(entity, &EntityEntry::empty())?;
            let archetype = b.archetype_for(&layout)?;
            let position = b.push_entity(archetype, entity)?;
            for (component, payload) in &components {
                let pushed = b.push_component(*component, archetype, payload.clone())?;
                expect_position(*component, archetype, pushed, position)?;
            }
            b.insert_location(entity, archetype, position)?;
            Ok(entity)
        })
    }

    /// Removes the entity, its location, its entry and every payload it owns.
    pub fn destroy(&mut self, entity: EntityId) -> StorageResult<()> {
        self.require(Capabilities::ENTITY_LIFECYCLE, "destroy entity")?;
        self.backend.atomically(|b| {
            let location = b.location(entity)?;
            let layout = b.archetype_layout(location.archetype)?;
            for &component in layout.components() {
                b.swap_remove_component(component, location.archetype, location.position)?;
            }
            detach_member(b, entity, location)?;
            b.remove_location(entity)?;
            b.remove_entry(entity)?;
            Ok(())
        })?;
        log::debug!("world {} destroyed entity {entity}", self.world_id);
        Ok(())
    }

    /// Adds `component` to the entity, moving it to the archetype of its new
    /// layout. If the entity already has the component the payload is
    /// overwritten in place.
    pub fn add_component(&mut self, entity: EntityId, component: ComponentTypeId, payload: Bytes) -> StorageResult<Location> {
        self.check_registered(component)?;
        self.backend.atomically(|b| {
            let location = b.location(entity)?;
            let layout = b.archetype_layout(location.archetype)?;
            if layout.has_component(component) {
                b.set_component(component, location.archetype, location.position, payload.clone())?;
                return Ok(location);
            }
            let destination = b.archetype_for(&layout.with(component))?;
            let (moved, _) = relocate(b, entity, location, &layout, destination, Some((component, payload.clone())))?;
            Ok(moved)
        })
    }

    /// Removes `component` from the entity and returns its payload. Removing
    /// the last component leaves the entity in the empty-layout archetype.
    pub fn remove_component(&mut self, entity: EntityId, component: ComponentTypeId) -> StorageResult<Bytes> {
        self.backend.atomically(|b| {
            let location = b.location(entity)?;
            let layout = b.archetype_layout(location.archetype)?;
            if !layout.has_component(component) {
                return Err(StorageError::ComponentNotInArchetype {
                    component,
                    archetype: location.archetype,
                });
            }
            let destination = b.archetype_for(&layout.without(component))?;
            let (_, mut dropped) = relocate(b, entity, location, &layout, destination, None)?;
            match dropped.pop() {
                Some((removed, payload)) if removed == component && dropped.is_empty() => Ok(payload),
                _ => Err(StorageError::invariant(format!(
                    "removing component {component} from entity {entity} dropped an unexpected set of payloads"
                ))),
            }
        })
    }

    pub fn set_component(&mut self, entity: EntityId, component: ComponentTypeId, payload: Bytes) -> StorageResult<()> {
        self.backend.atomically(|b| {
            let location = b.location(entity)?;
            b.set_component(component, location.archetype, location.position, payload.clone())
        })
    }

    pub fn component(&self, entity: EntityId, component: ComponentTypeId) -> StorageResult<Bytes> {
        let location = self.backend.location(entity)?;
        self.backend
            .component(component, location.archetype, location.position)
    }

    pub fn has_component(&self, entity: EntityId, component: ComponentTypeId) -> StorageResult<bool> {
        let location = self.backend.location(entity)?;
        Ok(self
            .backend
            .archetype_layout(location.archetype)?
            .has_component(component))
    }

    /// Every payload the entity owns, in component id order.
    pub fn components_of(&self, entity: EntityId) -> StorageResult<Vec<(ComponentTypeId, Bytes)>> {
        let location = self.backend.location(entity)?;
        let layout = self.backend.archetype_layout(location.archetype)?;
        layout
            .components()
            .iter()
            .map(|&component| {
                let payload = self
                    .backend
                    .component(component, location.archetype, location.position)?;
                Ok((component, payload))
            })
            .collect()
    }

    pub fn location(&self, entity: EntityId) -> StorageResult<Location> {
        self.backend.location(entity)
    }

    pub fn archetype_for(&mut self, layout: &Layout) -> StorageResult<ArchetypeIndex> {
        for &component in layout.components() {
            self.check_registered(component)?;
        }
        self.backend.atomically(|b| b.archetype_for(layout))
    }

    pub fn archetype(&self, index: ArchetypeIndex) -> StorageResult<Archetype> {
        self.backend.archetype(index)
    }

    pub fn search(&self, filter: &LayoutFilter) -> StorageResult<Vec<ArchetypeIndex>> {
        self.require(Capabilities::ARCHETYPE_SEARCH, "archetype search")?;
        self.backend.search(filter)
    }

    /// Like [`search`](Self::search), skipping archetypes before `start`.
    pub fn search_from(&self, filter: &LayoutFilter, start: ArchetypeIndex) -> StorageResult<Vec<ArchetypeIndex>> {
        self.require(Capabilities::ARCHETYPE_SEARCH, "archetype search")?;
        self.backend.search_from(filter, start)
    }

    /// Members of every archetype passing `filter`, archetype by archetype.
    pub fn entities_matching(&self, filter: &LayoutFilter) -> StorageResult<Vec<EntityId>> {
        let mut entities = Vec::new();
        for index in self.search(filter)? {
            entities.extend_from_slice(self.backend.archetype(index)?.entities());
        }
        Ok(entities)
    }

    pub fn entry(&self, entity: EntityId) -> StorageResult<EntityEntry> {
        self.backend.entry(entity)
    }

    pub fn set_entry(&mut self, entity: EntityId, entry: EntityEntry) -> StorageResult<()> {
        self.backend.atomically(|b| {
            if !b.contains_entry(entity)? {
                return Err(StorageError::EntityNotFound(entity));
            }
            b.set_entry(entity, &entry)
        })
    }

    pub fn entity_count(&self) -> StorageResult<usize> {
        self.backend.location_count()
    }

    /// Walks every archetype and checks that member lists, component lists,
    /// count indices, locations and entries all agree.
    pub fn verify(&self) -> StorageResult<()> {
        let b = &self.backend;
        let mut placed = 0;
        for raw in 0..b.archetype_count()? {
            let archetype = b.archetype(ArchetypeIndex::new(raw))?;
            let index = archetype.index();
            for &component in archetype.layout().components() {
                let count = b.component_count(component, index)?;
                if count != archetype.count() {
                    return Err(StorageError::invariant(format!(
                        "archetype {index} has {} members but {count} payloads of component {component}",
                        archetype.count()
                    )));
                }
            }
            for (position, &entity) in archetype.entities().iter().enumerate() {
                let location = match b.location(entity) {
                    Ok(location) => location,
                    Err(StorageError::EntityNotFound(_)) => {
                        return Err(StorageError::invariant(format!(
                            "entity {entity} is a member of archetype {index} but has no location"
                        )))
                    }
                    Err(err) => return Err(err),
                };
                if location != Location::new(index, position) {
                    return Err(StorageError::invariant(format!(
                        "entity {entity} sits at ({index}, {position}) but its location says ({}, {})",
                        location.archetype, location.position
                    )));
                }
                if !b.contains_entry(entity)? {
                    return Err(StorageError::invariant(format!(
                        "entity {entity} is placed but has no entry"
                    )));
                }
            }
            placed += archetype.count();
        }
        let counted = b.location_count()?;
        if counted != placed {
            return Err(StorageError::invariant(format!(
                "{placed} entities are placed but the location count is {counted}"
            )));
        }
        Ok(())
    }
}

fn expect_position(
    component: ComponentTypeId,
    archetype: ArchetypeIndex,
    actual: usize,
    expected: usize,
) -> StorageResult<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(StorageError::invariant(format!(
            "component {component} landed at {actual} in archetype {archetype}, member is at {expected}"
        )))
    }
}

/// Swap-removes `entity` from its archetype's member list and repoints the
/// member that took its slot.
fn detach_member<B: StorageBackend>(b: &mut B, entity: EntityId, location: Location) -> StorageResult<()> {
    let removed = b.swap_remove_entity(location.archetype, location.position)?;
    if removed != entity {
        return Err(StorageError::invariant(format!(
            "expected entity {entity} at ({}, {}) but found {removed}",
            location.archetype, location.position
        )));
    }
    if location.position < b.member_count(location.archetype)? {
        let shifted = b.member(location.archetype, location.position)?;
        b.set_location(shifted, location)?;
    }
    Ok(())
}

/// Moves `entity` from `from` into `destination`, carrying every component
/// both layouts share and appending `added`. Returns the new location and
/// the payloads of components the destination lacks.
fn relocate<B: StorageBackend>(
    b: &mut B,
    entity: EntityId,
    from: Location,
    layout: &Layout,
    destination: ArchetypeIndex,
    added: Option<(ComponentTypeId, Bytes)>,
) -> StorageResult<(Location, Vec<(ComponentTypeId, Bytes)>)> {
    let target = b.archetype_layout(destination)?;
    let position = b.push_entity(destination, entity)?;
    let mut dropped = Vec::new();
    for &component in layout.components() {
        if target.has_component(component) {
            let moved = b.move_component(component, from.archetype, from.position, destination)?;
            expect_position(component, destination, moved, position)?;
        } else {
            let payload = b.swap_remove_component(component, from.archetype, from.position)?;
            dropped.push((component, payload));
        }
    }
    if let Some((component, payload)) = added {
        let pushed = b.push_component(component, destination, payload)?;
        expect_position(component, destination, pushed, position)?;
    }
    detach_member(b, entity, from)?;
    let location = Location::new(destination, position);
    b.set_location(entity, location)?;
    Ok((location, dropped))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ecs::{ComponentSchema, Field, FieldKind};
    use crate::storage::kv::{KvCapabilities, KvError, KvStore, MemoryKv, Slot, WriteBatch};
    use crate::storage::{ArchetypeStore, ComponentIndexStore, ErrorKind, KvStorage, MemoryStorage};

    const HEALTH: ComponentTypeId = ComponentTypeId::new(0);
    const POSITION: ComponentTypeId = ComponentTypeId::new(1);
    const VELOCITY: ComponentTypeId = ComponentTypeId::new(2);

    fn registry() -> ComponentRegistry {
        let mut registry = ComponentRegistry::new();
        for (id, name) in [(HEALTH, "Health"), (POSITION, "Position"), (VELOCITY, "Velocity")] {
            registry
                .register(ComponentSchema::new(id, name, vec![Field::new("value", FieldKind::Int(64))]))
                .unwrap();
        }
        registry
    }

    fn memory_world() -> WorldStorage<MemoryStorage> {
        WorldStorage::new("1", registry(), MemoryStorage::new())
    }

    fn kv_world() -> WorldStorage<KvStorage<Arc<MemoryKv>>> {
        WorldStorage::new("1", registry(), KvStorage::new(Arc::new(MemoryKv::new()), "1"))
    }

    fn payload(text: &'static str) -> Bytes {
        Bytes::from_static(text.as_bytes())
    }

    fn new_entity_lands_in_empty_archetype<B: StorageBackend>(mut world: WorldStorage<B>) {
        let e = world.new_entity().unwrap();
        let empty = world.archetype_for(&Layout::empty()).unwrap();
        assert_eq!(world.location(e).unwrap(), Location::new(empty, 0));
        assert_eq!(world.entity_count().unwrap(), 1);
        assert!(world.entry(e).unwrap().is_empty());
        world.verify().unwrap();
    }

    fn single_component_scenario<B: StorageBackend>(mut world: WorldStorage<B>) {
        let e1 = world.new_entity().unwrap();
        world.add_component(e1, HEALTH, payload("h0")).unwrap();
        let archetype = world.archetype_for(&Layout::new([HEALTH])).unwrap();
        assert_eq!(world.location(e1).unwrap(), Location::new(archetype, 0));
        assert_eq!(world.component(e1, HEALTH).unwrap(), payload("h0"));
        world.verify().unwrap();
    }

    fn move_repoints_shifted_member<B: StorageBackend>(mut world: WorldStorage<B>) {
        let e1 = world.create_entity(vec![(HEALTH, payload("h1"))]).unwrap();
        let e2 = world.create_entity(vec![(HEALTH, payload("h2"))]).unwrap();
        let health = world.location(e1).unwrap().archetype;
        assert_eq!(world.location(e2).unwrap(), Location::new(health, 1));

        let moved = world.add_component(e1, POSITION, payload("p1")).unwrap();
        assert_eq!(world.location(e2).unwrap(), Location::new(health, 0));
        assert_eq!(world.archetype(health).unwrap().count(), 1);
        assert_eq!(world.location(e1).unwrap(), moved);
        assert_eq!(world.component(e1, HEALTH).unwrap(), payload("h1"));
        assert_eq!(world.component(e2, HEALTH).unwrap(), payload("h2"));
        assert_eq!(world.backend().component_count(HEALTH, health).unwrap(), 1);
        assert_eq!(world.backend().component_count(HEALTH, moved.archetype).unwrap(), 1);
        world.verify().unwrap();
    }

    fn remove_component_returns_payload<B: StorageBackend>(mut world: WorldStorage<B>) {
        let e = world
            .create_entity(vec![(POSITION, payload("p")), (VELOCITY, payload("v"))])
            .unwrap();
        assert_eq!(world.remove_component(e, VELOCITY).unwrap(), payload("v"));
        assert!(!world.has_component(e, VELOCITY).unwrap());
        assert_eq!(world.components_of(e).unwrap(), vec![(POSITION, payload("p"))]);
        assert_eq!(world.remove_component(e, POSITION).unwrap(), payload("p"));
        let empty = world.archetype_for(&Layout::empty()).unwrap();
        assert_eq!(world.location(e).unwrap().archetype, empty);
        let err = world.remove_component(e, POSITION).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        world.verify().unwrap();
    }

    fn destroy_cascades<B: StorageBackend>(mut world: WorldStorage<B>) {
        let a = world.create_entity(vec![(HEALTH, payload("a"))]).unwrap();
        let b = world.create_entity(vec![(HEALTH, payload("b"))]).unwrap();
        let c = world.create_entity(vec![(HEALTH, payload("c"))]).unwrap();
        world.destroy(a).unwrap();
        assert_eq!(world.location(c).unwrap().position, 0);
        assert_eq!(world.location(b).unwrap().position, 1);
        assert_eq!(world.component(c, HEALTH).unwrap(), payload("c"));
        assert_eq!(world.entity_count().unwrap(), 2);
        assert_eq!(world.location(a).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(world.entry(a).unwrap_err().kind(), ErrorKind::NotFound);
        world.verify().unwrap();
    }

    fn failed_mutation_leaves_no_trace<B: StorageBackend>(mut world: WorldStorage<B>) {
        let e = world.create_entity(vec![(HEALTH, payload("h"))]).unwrap();
        let ghost = EntityId::new(42);
        assert_eq!(
            world.add_component(ghost, POSITION, payload("p")).unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            world.create_entity(vec![(HEALTH, payload("x")), (HEALTH, payload("y"))]).unwrap_err().kind(),
            ErrorKind::InvalidLayout
        );
        assert_eq!(
            world.add_component(e, ComponentTypeId::new(99), payload("?")).unwrap_err().kind(),
            ErrorKind::InvalidLayout
        );
        assert_eq!(world.entity_count().unwrap(), 1);
        world.verify().unwrap();
    }

    fn search_finds_members<B: StorageBackend>(mut world: WorldStorage<B>) {
        let moving = world
            .create_entity(vec![(POSITION, payload("p")), (VELOCITY, payload("v"))])
            .unwrap();
        let still = world.create_entity(vec![(POSITION, payload("p"))]).unwrap();
        world.create_entity(vec![(HEALTH, payload("h"))]).unwrap();

        let mut with_position = world.entities_matching(&LayoutFilter::contains([POSITION])).unwrap();
        with_position.sort();
        assert_eq!(with_position, vec![moving, still]);
        assert_eq!(
            world.entities_matching(&LayoutFilter::exact([VELOCITY, POSITION])).unwrap(),
            vec![moving]
        );
    }

    macro_rules! on_both_backends {
        ($($scenario:ident),* $(,)?) => {
            mod memory {
                $(#[test] fn $scenario() { super::$scenario(super::memory_world()); })*
            }
            mod kv {
                $(#[test] fn $scenario() { super::$scenario(super::kv_world()); })*
            }
        };
    }

    on_both_backends!(
        new_entity_lands_in_empty_archetype,
        single_component_scenario,
        move_repoints_shifted_member,
        remove_component_returns_payload,
        destroy_cascades,
        failed_mutation_leaves_no_trace,
        search_finds_members,
    );

    #[test]
    fn test_add_existing_component_overwrites_in_place() {
        let mut world = memory_world();
        let e = world.create_entity(vec![(HEALTH, payload("old"))]).unwrap();
        let before = world.location(e).unwrap();
        let after = world.add_component(e, HEALTH, payload("new")).unwrap();
        assert_eq!(before, after);
        assert_eq!(world.component(e, HEALTH).unwrap(), payload("new"));
    }

    #[test]
    fn test_worlds_sharing_a_store_stay_apart() {
        let kv = Arc::new(MemoryKv::new());
        let mut first = WorldStorage::new("1", registry(), KvStorage::new(kv.clone(), "1"));
        let mut second = WorldStorage::new("2", registry(), KvStorage::new(kv, "2"));
        let a = first.create_entity(vec![(HEALTH, payload("first"))]).unwrap();
        let b = second.create_entity(vec![(HEALTH, payload("second"))]).unwrap();
        assert_eq!(a, b);
        assert_eq!(first.component(a, HEALTH).unwrap(), payload("first"));
        assert_eq!(second.component(b, HEALTH).unwrap(), payload("second"));
        assert_eq!(first.entity_count().unwrap(), 1);
    }

    #[test]
    fn test_missing_capabilities_are_reported_before_any_write() {
        let backend = MemoryStorage::new().with_capabilities(Capabilities::ATOMIC_MUTATIONS);
        let mut world = WorldStorage::new("1", registry(), backend);
        assert!(matches!(
            world.create_entity(vec![(HEALTH, payload("h"))]),
            Err(StorageError::Unsupported { operation: "create entity", .. })
        ));
        assert!(matches!(
            world.destroy(EntityId::new(0)),
            Err(StorageError::Unsupported { operation: "destroy entity", .. })
        ));
        assert_eq!(
            world.search(&LayoutFilter::All).unwrap_err().kind(),
            ErrorKind::Unsupported
        );
        assert_eq!(
            world
                .search_from(&LayoutFilter::All, ArchetypeIndex::new(0))
                .unwrap_err()
                .kind(),
            ErrorKind::Unsupported
        );
        assert_eq!(world.backend().archetype_count().unwrap(), 0);
    }

    /// Applies batches without checking guards.
    struct BestEffortKv(MemoryKv);

    impl KvStore for BestEffortKv {
        fn name(&self) -> &'static str {
            "best-effort"
        }

        fn capabilities(&self) -> KvCapabilities {
            KvCapabilities::empty()
        }

        fn read(&self, slot: &Slot) -> Result<Option<Bytes>, KvError> {
            self.0.read(slot)
        }

        fn commit(&self, batch: WriteBatch) -> Result<(), KvError> {
            self.0.commit(batch)
        }
    }

    #[test]
    fn test_store_without_guarded_batches_has_no_entity_lifecycle() {
        let backend = KvStorage::new(BestEffortKv(MemoryKv::new()), "1");
        let mut world = WorldStorage::new("1", registry(), backend);
        assert!(!world.capabilities().contains(Capabilities::ENTITY_LIFECYCLE));
        assert!(world.capabilities().contains(Capabilities::ARCHETYPE_SEARCH));
        assert!(matches!(
            world.new_entity(),
            Err(StorageError::Unsupported { operation: "create entity", .. })
        ));
        assert!(world.search(&LayoutFilter::All).unwrap().is_empty());
    }

    #[test]
    fn test_verify_reports_corrupt_location() {
        let mut world = memory_world();
        let a = world.create_entity(vec![(HEALTH, payload("a"))]).unwrap();
        world.create_entity(vec![(HEALTH, payload("b"))]).unwrap();
        let archetype = world.location(a).unwrap().archetype;
        crate::storage::LocationStore::set_location(&mut world.backend, a, Location::new(archetype, 1)).unwrap();
        assert_eq!(world.verify().unwrap_err().kind(), ErrorKind::InvariantViolation);
    }
}
