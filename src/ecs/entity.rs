//! Entity identifiers and ledger entries

use std::fmt;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Entity identifier, unique for the lifetime of a world and issued in
/// increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(u64);

impl EntityId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata kept per entity outside of its component data.
///
/// The storage layer treats the contents as opaque bytes; `encode` and
/// `decode` are conveniences for callers that keep a structured record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityEntry {
    data: Bytes,
}

impl EntityEntry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn encode<T: Serialize>(record: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::from_bytes(serde_json::to_vec(record)?))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
