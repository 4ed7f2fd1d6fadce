//! Key-value store abstraction used by the remote storage adapter
//!
//! A store exposes plain values and hash fields, and commits writes as one
//! guarded batch: every guard must still hold when the batch lands or the
//! whole batch is rejected with [`KvError::Conflict`].

pub mod adapter;
pub mod keys;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use bytes::Bytes;
use thiserror::Error;

pub use adapter::KvStorage;
pub use keys::Keys;
pub use memory::MemoryKv;
#[cfg(feature = "redis")]
pub use self::redis::RedisKv;

/// One addressable value: a whole key or one field of a hash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Slot {
    Value(String),
    Field(String, String),
}

impl Slot {
    pub fn value(key: impl Into<String>) -> Self {
        Slot::Value(key.into())
    }

    pub fn field(key: impl Into<String>, field: impl Into<String>) -> Self {
        Slot::Field(key.into(), field.into())
    }

    pub fn key(&self) -> &str {
        match self {
            Slot::Value(key) | Slot::Field(key, _) => key,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Value(key) => write!(f, "{key}"),
            Slot::Field(key, field) => write!(f, "{key}[{field}]"),
        }
    }
}

/// Writes applied together, conditional on the guards.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    guards: Vec<(Slot, Option<Bytes>)>,
    writes: Vec<(Slot, Option<Bytes>)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `slot` to still hold `expected` (`None` = absent) at commit.
    pub fn guard(&mut self, slot: Slot, expected: Option<Bytes>) -> &mut Self {
        self.guards.push((slot, expected));
        self
    }

    pub fn put(&mut self, slot: Slot, value: Bytes) -> &mut Self {
        self.writes.push((slot, Some(value)));
        self
    }

    pub fn delete(&mut self, slot: Slot) -> &mut Self {
        self.writes.push((slot, None));
        self
    }

    pub fn guards(&self) -> &[(Slot, Option<Bytes>)] {
        &self.guards
    }

    pub fn writes(&self) -> &[(Slot, Option<Bytes>)] {
        &self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct KvCapabilities: u32 {
        /// `commit` checks guards and applies writes atomically.
        const GUARDED_BATCH = 1 << 0;
        const PERSISTENT = 1 << 1;
    }
}

#[derive(Debug, Error)]
pub enum KvError {
    #[error("a guarded value changed before the batch was committed")]
    Conflict,
    #[error("key-value transport failure: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("{key} holds the wrong kind of value for this operation")]
    WrongType { key: String },
    #[error("key-value store lock poisoned")]
    Poisoned,
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, KvError::Conflict | KvError::Transport(_))
    }
}

pub trait KvStore {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> KvCapabilities;

    fn read(&self, slot: &Slot) -> Result<Option<Bytes>, KvError>;

    fn commit(&self, batch: WriteBatch) -> Result<(), KvError>;
}

impl<S: KvStore + ?Sized> KvStore for Arc<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn capabilities(&self) -> KvCapabilities {
        (**self).capabilities()
    }

    fn read(&self, slot: &Slot) -> Result<Option<Bytes>, KvError> {
        (**self).read(slot)
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), KvError> {
        (**self).commit(batch)
    }
}
