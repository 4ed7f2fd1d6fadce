//! Component layouts and layout filters

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a registered component type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentTypeId(u32);

impl ComponentTypeId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The set of component types that defines an archetype.
///
/// Stored sorted and deduplicated so that two layouts built from the same
/// set in any order compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Layout {
    components: Vec<ComponentTypeId>,
}

impl Layout {
    pub fn new(components: impl IntoIterator<Item = ComponentTypeId>) -> Self {
        let mut components: Vec<_> = components.into_iter().collect();
        components.sort_unstable();
        components.dedup();
        Self { components }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn components(&self) -> &[ComponentTypeId] {
        &self.components
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn has_component(&self, component: ComponentTypeId) -> bool {
        self.components.binary_search(&component).is_ok()
    }

    pub fn with(&self, component: ComponentTypeId) -> Self {
        Self::new(self.components.iter().copied().chain([component]))
    }

    pub fn without(&self, component: ComponentTypeId) -> Self {
        Self {
            components: self
                .components
                .iter()
                .copied()
                .filter(|c| *c != component)
                .collect(),
        }
    }

    /// Canonical text form, e.g. `"0,3,7"`. Used as the layout index key.
    pub fn signature(&self) -> String {
        self.components
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromIterator<ComponentTypeId> for Layout {
    fn from_iter<I: IntoIterator<Item = ComponentTypeId>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// Predicate over layouts used to search archetypes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutFilter {
    All,
    /// Layout holds at least these components.
    Contains(Vec<ComponentTypeId>),
    /// Layout holds exactly these components.
    Exact(Vec<ComponentTypeId>),
    Not(Box<LayoutFilter>),
    And(Box<LayoutFilter>, Box<LayoutFilter>),
    Or(Box<LayoutFilter>, Box<LayoutFilter>),
}

impl LayoutFilter {
    pub fn contains(components: impl IntoIterator<Item = ComponentTypeId>) -> Self {
        Self::Contains(components.into_iter().collect())
    }

    pub fn exact(components: impl IntoIterator<Item = ComponentTypeId>) -> Self {
        Self::Exact(components.into_iter().collect())
    }

    pub fn not(self) -> Self {
        Self::Not(Box::new(self))
    }

    pub fn and(self, other: LayoutFilter) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: LayoutFilter) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    pub fn matches(&self, layout: &Layout) -> bool {
        match self {
            LayoutFilter::All => true,
            LayoutFilter::Contains(components) => {
                components.iter().all(|c| layout.has_component(*c))
            }
            LayoutFilter::Exact(components) => *layout == Layout::new(components.iter().copied()),
            LayoutFilter::Not(inner) => !inner.matches(layout),
            LayoutFilter::And(a, b) => a.matches(layout) && b.matches(layout),
            LayoutFilter::Or(a, b) => a.matches(layout) || b.matches(layout),
        }
    }
}
