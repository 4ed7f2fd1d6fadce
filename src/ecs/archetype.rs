//! Archetypes: the entities sharing one component layout

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{ComponentTypeId, EntityId, Layout};

/// Index of an archetype within a world. Assigned once, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchetypeIndex(usize);

impl ArchetypeIndex {
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> usize {
        self.0
    }
}

impl fmt::Display for ArchetypeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A layout plus the ordered list of its member entities.
///
/// `members[i]` is the entity whose components sit at position `i` of every
/// component list of this archetype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archetype {
    index: ArchetypeIndex,
    layout: Layout,
    members: Vec<EntityId>,
}

impl Archetype {
    pub fn new(index: ArchetypeIndex, layout: Layout) -> Self {
        Self {
            index,
            layout,
            members: Vec::new(),
        }
    }

    pub(crate) fn with_members(index: ArchetypeIndex, layout: Layout, members: Vec<EntityId>) -> Self {
        Self {
            index,
            layout,
            members,
        }
    }

    pub fn index(&self) -> ArchetypeIndex {
        self.index
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn entities(&self) -> &[EntityId] {
        &self.members
    }

    pub fn count(&self) -> usize {
        self.members.len()
    }

    /// Appends `entity`; its position is the returned index.
    pub fn push_entity(&mut self, entity: EntityId) -> usize {
        self.members.push(entity);
        self.members.len() - 1
    }

    /// Removes the member at `position` by moving the last member into it.
    ///
    /// When `position` was not the last slot, the former last member now
    /// lives at `position` and its location record must be rewritten.
    pub fn swap_remove(&mut self, position: usize) -> Option<EntityId> {
        if position >= self.members.len() {
            return None;
        }
        Some(self.members.swap_remove(position))
    }

    /// Same cardinality and every requested component is in the layout.
    pub fn layout_matches(&self, components: &[ComponentTypeId]) -> bool {
        if self.layout.len() != components.len() {
            return false;
        }
        components.iter().all(|c| self.layout.has_component(*c))
    }

    pub(crate) fn members_mut(&mut self) -> &mut Vec<EntityId> {
        &mut self.members
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(raw: &[u32]) -> Layout {
        Layout::new(raw.iter().copied().map(ComponentTypeId::new))
    }

    fn cids(raw: &[u32]) -> Vec<ComponentTypeId> {
        raw.iter().copied().map(ComponentTypeId::new).collect()
    }

    #[test]
    fn test_push_assigns_tail_positions() {
        let mut arch = Archetype::new(ArchetypeIndex::new(0), layout(&[1]));
        assert_eq!(arch.push_entity(EntityId::new(10)), 0);
        assert_eq!(arch.push_entity(EntityId::new(11)), 1);
        assert_eq!(arch.count(), 2);
    }

    #[test]
    fn test_swap_remove_moves_last_member() {
        let mut arch = Archetype::new(ArchetypeIndex::new(0), layout(&[1]));
        for raw in 0..3 {
            arch.push_entity(EntityId::new(raw));
        }
        assert_eq!(arch.swap_remove(0), Some(EntityId::new(0)));
        assert_eq!(arch.entities(), &[EntityId::new(2), EntityId::new(1)]);
        assert_eq!(arch.swap_remove(1), Some(EntityId::new(1)));
        assert_eq!(arch.entities(), &[EntityId::new(2)]);
        assert_eq!(arch.swap_remove(5), None);
    }

    #[test]
    fn test_layout_matching_checks_cardinality() {
        let arch = Archetype::new(ArchetypeIndex::new(0), layout(&[1, 2]));
        assert!(arch.layout_matches(&cids(&[2, 1])));
        assert!(!arch.layout_matches(&cids(&[1, 2, 3])));
        assert!(!arch.layout_matches(&cids(&[1])));
        assert!(!arch.layout_matches(&cids(&[1, 3])));
    }
}
