//! Redis-backed [`KvStore`]
//!
//! Guarded batches map onto `WATCH` + `MULTI`/`EXEC`: the guard keys are
//! watched, their values re-checked, and the writes sent as one atomic
//! pipeline. A nil `EXEC` reply means a watched key changed.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;

use super::{KvCapabilities, KvError, KvStore, Slot, WriteBatch};

impl From<::redis::RedisError> for KvError {
    fn from(err: ::redis::RedisError) -> Self {
        KvError::Transport(Box::new(err))
    }
}

pub struct RedisKv {
    connection: Mutex<::redis::Connection>,
}

impl RedisKv {
    pub fn open(url: &str) -> Result<Self, KvError> {
        let client = ::redis::Client::open(url)?;
        let connection = client.get_connection()?;
        log::info!("connected to redis at {url}");
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, ::redis::Connection>, KvError> {
        self.connection.lock().map_err(|_| KvError::Poisoned)
    }
}

fn fetch(connection: &mut ::redis::Connection, slot: &Slot) -> Result<Option<Bytes>, KvError> {
    let value: Option<Vec<u8>> = match slot {
        Slot::Value(key) => ::redis::cmd("GET").arg(key).query(connection)?,
        Slot::Field(key, field) => ::redis::cmd("HGET").arg(key).arg(field).query(connection)?,
    };
    Ok(value.map(Bytes::from))
}

impl KvStore for RedisKv {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn capabilities(&self) -> KvCapabilities {
        KvCapabilities::GUARDED_BATCH | KvCapabilities::PERSISTENT
    }

    fn read(&self, slot: &Slot) -> Result<Option<Bytes>, KvError> {
        fetch(&mut self.lock()?, slot)
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), KvError> {
        let mut connection = self.lock()?;
        let watched: BTreeSet<&str> = batch.guards().iter().map(|(slot, _)| slot.key()).collect();
        if !watched.is_empty() {
            ::redis::cmd("WATCH").arg(watched.into_iter().collect::<Vec<_>>()).query::<()>(&mut *connection)?;
        }
        for (slot, expected) in batch.guards() {
            if fetch(&mut connection, slot)? != *expected {
                ::redis::cmd("UNWATCH").query::<()>(&mut *connection)?;
                return Err(KvError::Conflict);
            }
        }

        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for (slot, value) in batch.writes() {
            match (slot, value) {
                (Slot::Value(key), Some(value)) => pipe.set(key, value.to_vec()).ignore(),
                (Slot::Value(key), None) => pipe.del(key).ignore(),
                (Slot::Field(key, field), Some(value)) => pipe.hset(key, field, value.to_vec()).ignore(),
                (Slot::Field(key, field), None) => pipe.hdel(key, field).ignore(),
            };
        }
        let reply: Option<()> = pipe.query(&mut *connection)?;
        match reply {
            Some(()) => Ok(()),
            None => Err(KvError::Conflict),
        }
    }
}
