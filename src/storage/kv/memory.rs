//! Process-local key-value store with the same semantics as a remote one

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;

use super::{KvCapabilities, KvError, KvStore, Slot, WriteBatch};

#[derive(Default)]
struct State {
    values: HashMap<String, Bytes>,
    hashes: HashMap<String, HashMap<String, Bytes>>,
}

impl State {
    fn read(&self, slot: &Slot) -> Result<Option<Bytes>, KvError> {
        match slot {
            Slot::Value(key) => {
                if self.hashes.contains_key(key) {
                    return Err(KvError::WrongType { key: key.clone() });
                }
                Ok(self.values.get(key).cloned())
            }
            Slot::Field(key, field) => {
                if self.values.contains_key(key) {
                    return Err(KvError::WrongType { key: key.clone() });
                }
                Ok(self.hashes.get(key).and_then(|hash| hash.get(field)).cloned())
            }
        }
    }

    fn write(&mut self, slot: &Slot, value: Option<&Bytes>) {
        match (slot, value) {
            (Slot::Value(key), Some(value)) => {
                self.values.insert(key.clone(), value.clone());
            }
            (Slot::Value(key), None) => {
                self.values.remove(key);
            }
            (Slot::Field(key, field), Some(value)) => {
                self.hashes
                    .entry(key.clone())
                    .or_default()
                    .insert(field.clone(), value.clone());
            }
            (Slot::Field(key, field), None) => {
                if let Some(hash) = self.hashes.get_mut(key) {
                    hash.remove(field);
                    if hash.is_empty() {
                        self.hashes.remove(key);
                    }
                }
            }
        }
    }
}

/// Shareable between handles (wrap in `Arc`); every world addresses it
/// through its own key prefix.
#[derive(Default)]
pub struct MemoryKv {
    state: Mutex<State>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, KvError> {
        self.state.lock().map_err(|_| KvError::Poisoned)
    }

    /// Every key currently holding data, sorted.
    pub fn keys(&self) -> Result<Vec<String>, KvError> {
        let state = self.lock()?;
        let keys: BTreeSet<String> = state
            .values
            .keys()
            .chain(state.hashes.keys())
            .cloned()
            .collect();
        Ok(keys.into_iter().collect())
    }

    pub fn hash_len(&self, key: &str) -> Result<usize, KvError> {
        Ok(self.lock()?.hashes.get(key).map(HashMap::len).unwrap_or(0))
    }
}

impl KvStore for MemoryKv {
    fn name(&self) -> &'static str {
        "memory-kv"
    }

    fn capabilities(&self) -> KvCapabilities {
        KvCapabilities::GUARDED_BATCH
    }

    fn read(&self, slot: &Slot) -> Result<Option<Bytes>, KvError> {
        self.lock()?.read(slot)
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), KvError> {
        let mut state = self.lock()?;
        for (slot, expected) in batch.guards() {
            if state.read(slot)? != *expected {
                return Err(KvError::Conflict);
            }
        }
        for (slot, value) in batch.writes() {
            state.write(slot, value.as_ref());
        }
        Ok(())
    }
}
