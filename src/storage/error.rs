use thiserror::Error;

use crate::ecs::{ArchetypeIndex, ComponentTypeId, EntityId};

use super::kv::KvError;

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidLayout,
    Unsupported,
    BackendIo,
    InvariantViolation,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("entity {0} not found")]
    EntityNotFound(EntityId),
    #[error("archetype {0} not found")]
    ArchetypeNotFound(ArchetypeIndex),
    #[error("archetype {archetype} has no member at position {position}")]
    MemberNotFound {
        archetype: ArchetypeIndex,
        position: usize,
    },
    #[error("archetype {archetype} does not store component {component}")]
    ComponentNotInArchetype {
        component: ComponentTypeId,
        archetype: ArchetypeIndex,
    },
    #[error("component {component} has no slot {position} in archetype {archetype}")]
    ComponentNotFound {
        component: ComponentTypeId,
        archetype: ArchetypeIndex,
        position: usize,
    },
    #[error("invalid layout: {0}")]
    InvalidLayout(String),
    #[error("operation `{operation}` is not supported by the {backend} backend")]
    Unsupported {
        operation: &'static str,
        backend: &'static str,
    },
    #[error(transparent)]
    Backend(#[from] KvError),
    #[error("failed to decode {what} stored at {key}: {source}")]
    Decode {
        what: &'static str,
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    /// The store failed while committing; the batch may or may not have landed.
    #[error("commit outcome unknown: {0}")]
    CommitUncertain(#[source] KvError),
    #[error("gave up after {attempts} conflicting attempts")]
    Contention { attempts: u32 },
    #[error("storage invariant violated: {0}")]
    InvariantViolation(String),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::EntityNotFound(_)
            | StorageError::ArchetypeNotFound(_)
            | StorageError::MemberNotFound { .. }
            | StorageError::ComponentNotInArchetype { .. }
            | StorageError::ComponentNotFound { .. } => ErrorKind::NotFound,
            StorageError::InvalidLayout(_) => ErrorKind::InvalidLayout,
            StorageError::Unsupported { .. } => ErrorKind::Unsupported,
            StorageError::Backend(_)
            | StorageError::Decode { .. }
            | StorageError::Encode { .. }
            | StorageError::CommitUncertain(_)
            | StorageError::Contention { .. } => ErrorKind::BackendIo,
            StorageError::InvariantViolation(_) => ErrorKind::InvariantViolation,
        }
    }

    /// Whether the same logical mutation may be run again: the failure left
    /// nothing committed and the backend has not already spent its retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Backend(err) => err.is_retryable(),
            _ => false,
        }
    }

    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        let message = message.into();
        log::error!("storage invariant violated: {message}");
        StorageError::InvariantViolation(message)
    }
}
