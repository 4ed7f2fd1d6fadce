//! Entity, layout and archetype primitives
//!
//! Plain in-memory value types shared by every storage backend.

pub mod archetype;
pub mod entity;
pub mod layout;
pub mod schema;

pub use archetype::{Archetype, ArchetypeIndex};
pub use entity::{EntityEntry, EntityId};
pub use layout::{ComponentTypeId, Layout, LayoutFilter};
pub use schema::{ComponentRegistry, ComponentSchema, Field, FieldKind, SchemaError};
