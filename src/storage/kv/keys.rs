//! World-scoped key scheme
//!
//! ```text
//! COMPD:WORLD-1:CID-0:A-5   component payloads, hash position -> bytes
//! CIDX:WORLD-1:CID-0:A-5    component count
//! LOC:WORLD-1:E-7           entity location
//! LOCL:WORLD-1              entity location count
//! ARCH:WORLD-1:A-5          archetype record, hash {layout, len, position -> entity}
//! ARCHL:WORLD-1             archetype count
//! ACI:WORLD-1               layout index, hash signature -> archetype
//! ENTITY:WORLD-1:E-7        entity entry bytes
//! ENTITY:WORLD-1:NEXTID     next entity id
//! ```

use crate::ecs::{ArchetypeIndex, ComponentTypeId, EntityId};

pub const LAYOUT_FIELD: &str = "layout";
pub const LEN_FIELD: &str = "len";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    world: String,
}

impl Keys {
    pub fn new(world_id: impl Into<String>) -> Self {
        Self {
            world: world_id.into(),
        }
    }

    pub fn world_id(&self) -> &str {
        &self.world
    }

    pub fn component_data(&self, component: ComponentTypeId, archetype: ArchetypeIndex) -> String {
        format!("COMPD:WORLD-{}:CID-{component}:A-{archetype}", self.world)
    }

    pub fn component_index(&self, component: ComponentTypeId, archetype: ArchetypeIndex) -> String {
        format!("CIDX:WORLD-{}:CID-{component}:A-{archetype}", self.world)
    }

    pub fn entity_location(&self, entity: EntityId) -> String {
        format!("LOC:WORLD-{}:E-{entity}", self.world)
    }

    pub fn entity_location_len(&self) -> String {
        format!("LOCL:WORLD-{}", self.world)
    }

    pub fn archetype(&self, archetype: ArchetypeIndex) -> String {
        format!("ARCH:WORLD-{}:A-{archetype}", self.world)
    }

    pub fn archetype_len(&self) -> String {
        format!("ARCHL:WORLD-{}", self.world)
    }

    pub fn archetype_layouts(&self) -> String {
        format!("ACI:WORLD-{}", self.world)
    }

    pub fn entity(&self, entity: EntityId) -> String {
        format!("ENTITY:WORLD-{}:E-{entity}", self.world)
    }

    pub fn next_entity_id(&self) -> String {
        format!("ENTITY:WORLD-{}:NEXTID", self.world)
    }
}
