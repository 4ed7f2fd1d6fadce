//! Tick driver
//!
//! Each tick drains the transaction sources, applies every queued
//! transaction to the world in order and records one receipt per
//! transaction. Failures a caller can act on (unknown entity, bad layout,
//! missing capability) become failed receipts. A backend failure that left
//! nothing committed is retried; any other backend failure stops the run.
//! Invariant violations stop it at once and the tick's receipts are dropped.
//!
//! Optimistic-lock conflicts are retried inside the backend's
//! [`StorageBackend::atomically`], so contention reaching the engine is
//! already final.
//!
//! When a tick aborts, the transaction that failed goes back to the front of
//! the queue ahead of the untried ones, and the tick number is not advanced.
//! Transactions applied earlier in the aborted tick stay committed.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::ecs::{ComponentTypeId, EntityId};
use crate::receipt::{Receipt, ReceiptHistory};
use crate::snapshot::{SnapshotError, SnapshotWriter};
use crate::storage::{ErrorKind, StorageBackend, StorageError, StorageResult};
use crate::world::WorldStorage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    CreateEntity {
        components: Vec<(ComponentTypeId, Bytes)>,
    },
    AddComponent {
        entity: EntityId,
        component: ComponentTypeId,
        payload: Bytes,
    },
    SetComponent {
        entity: EntityId,
        component: ComponentTypeId,
        payload: Bytes,
    },
    RemoveComponent {
        entity: EntityId,
        component: ComponentTypeId,
    },
    DestroyEntity {
        entity: EntityId,
    },
}

impl Mutation {
    fn apply<B: StorageBackend>(&self, world: &mut WorldStorage<B>) -> StorageResult<serde_json::Value> {
        match self {
            Mutation::CreateEntity { components } => {
                let entity = world.create_entity(components.clone())?;
                Ok(json!({ "entity": entity }))
            }
            Mutation::AddComponent {
                entity,
                component,
                payload,
            } => {
                let location = world.add_component(*entity, *component, payload.clone())?;
                Ok(json!({ "archetype": location.archetype, "position": location.position }))
            }
            Mutation::SetComponent {
                entity,
                component,
                payload,
            } => {
                world.set_component(*entity, *component, payload.clone())?;
                Ok(json!({ "entity": entity }))
            }
            Mutation::RemoveComponent { entity, component } => {
                let removed = world.remove_component(*entity, *component)?;
                Ok(json!({ "removedBytes": removed.len() }))
            }
            Mutation::DestroyEntity { entity } => {
                world.destroy(*entity)?;
                Ok(json!({ "entity": entity }))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub hash: String,
    pub mutation: Mutation,
}

impl Transaction {
    pub fn new(hash: impl Into<String>, mutation: Mutation) -> Self {
        Self {
            hash: hash.into(),
            mutation,
        }
    }
}

/// Produces the transactions applied at the start of each tick.
pub trait TransactionSource<B: StorageBackend> {
    fn name(&self) -> &str;
    fn transactions(&mut self, tick: u64, world: &WorldStorage<B>) -> StorageResult<Vec<Transaction>>;
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("tick {tick}: backend failed after {attempts} attempts: {source}")]
    Backend {
        tick: u64,
        attempts: u32,
        #[source]
        source: StorageError,
    },
    #[error("tick {tick} aborted: {source}")]
    Invariant {
        tick: u64,
        #[source]
        source: StorageError,
    },
    #[error("transaction source `{name}` failed: {source}")]
    Source {
        name: String,
        #[source]
        source: StorageError,
    },
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_retries: u32,
    pub verify_each_tick: bool,
    pub receipt_history_size: u64,
    pub snapshot_interval_ticks: u64,
    pub snapshot_dir: PathBuf,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_retries: 8,
            verify_each_tick: true,
            receipt_history_size: 10,
            snapshot_interval_ticks: 0,
            snapshot_dir: PathBuf::from("snapshots"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TickSummary {
    pub world_id: String,
    pub tick: u64,
    pub applied: usize,
    pub failed: usize,
    pub entity_count: usize,
    pub archetype_count: usize,
    pub duration_ms: f64,
    pub snapshot_path: Option<PathBuf>,
}

enum Outcome {
    Applied(serde_json::Value),
    Rejected(StorageError),
}

pub struct EngineBuilder<B> {
    settings: EngineSettings,
    sources: Vec<Box<dyn TransactionSource<B> + Send>>,
}

impl<B: StorageBackend> EngineBuilder<B> {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            sources: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: impl TransactionSource<B> + Send + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    pub fn build(self, world: WorldStorage<B>) -> Engine<B> {
        Engine {
            receipts: ReceiptHistory::new(self.settings.receipt_history_size),
            snapshot_writer: SnapshotWriter::new(
                &self.settings.snapshot_dir,
                self.settings.snapshot_interval_ticks,
            ),
            queue: VecDeque::new(),
            sources: self.sources,
            settings: self.settings,
            world,
        }
    }
}

pub struct Engine<B> {
    world: WorldStorage<B>,
    receipts: ReceiptHistory,
    queue: VecDeque<Transaction>,
    sources: Vec<Box<dyn TransactionSource<B> + Send>>,
    snapshot_writer: SnapshotWriter,
    settings: EngineSettings,
}

impl<B: StorageBackend> Engine<B> {
    pub fn world(&self) -> &WorldStorage<B> {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut WorldStorage<B> {
        &mut self.world
    }

    pub fn receipts(&self) -> &ReceiptHistory {
        &self.receipts
    }

    pub fn current_tick(&self) -> u64 {
        self.receipts.current_tick()
    }

    /// Queues a transaction for the next tick.
    pub fn submit(&mut self, transaction: Transaction) {
        self.queue.push_back(transaction);
    }

    /// Transactions waiting for the next tick.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn tick(&mut self) -> Result<TickSummary, EngineError> {
        let started = Instant::now();
        let tick = self.receipts.current_tick();
        for source in &mut self.sources {
            let produced = source
                .transactions(tick, &self.world)
                .map_err(|source_err| EngineError::Source {
                    name: source.name().to_string(),
                    source: source_err,
                })?;
            self.queue.extend(produced);
        }

        let mut applied = 0;
        let mut failed = 0;
        while let Some(transaction) = self.queue.pop_front() {
            match self.apply(tick, &transaction) {
                Ok(Outcome::Applied(result)) => {
                    applied += 1;
                    self.receipts.add_receipt(Receipt::success(transaction.hash, result));
                }
                Ok(Outcome::Rejected(err)) => {
                    failed += 1;
                    log::warn!("tick {tick}: transaction {} failed: {err}", transaction.hash);
                    self.receipts.add_receipt(Receipt::failure(transaction.hash, err));
                }
                Err(err) => {
                    let dropped = self.receipts.discard_pending();
                    log::error!(
                        "tick {tick} aborted at transaction {}, {dropped} receipts discarded: {err}",
                        transaction.hash
                    );
                    self.queue.push_front(transaction);
                    return Err(err);
                }
            }
        }

        if self.settings.verify_each_tick {
            if let Err(err) = self.world.verify() {
                return Err(self.abort(tick, err));
            }
        }
        let entity_count = match self.world.entity_count() {
            Ok(count) => count,
            Err(err) => return Err(self.abort(tick, err)),
        };
        let archetype_count = match self.world.backend().archetype_count() {
            Ok(count) => count,
            Err(err) => return Err(self.abort(tick, err)),
        };

        self.receipts.next_tick();
        let snapshot_path = self.snapshot_writer.maybe_write(&self.world, tick)?;
        let summary = TickSummary {
            world_id: self.world.world_id().to_string(),
            tick,
            applied,
            failed,
            entity_count,
            archetype_count,
            duration_ms: started.elapsed().as_secs_f64() * 1_000.0,
            snapshot_path,
        };
        log::info!(
            "world {} tick {tick}: {applied} applied, {failed} failed, {entity_count} entities in {archetype_count} archetypes",
            summary.world_id
        );
        Ok(summary)
    }

    /// Applies one transaction, re-running it only after failures that left
    /// nothing committed.
    fn apply(&mut self, tick: u64, transaction: &Transaction) -> Result<Outcome, EngineError> {
        let attempts = self.settings.max_retries + 1;
        let mut attempt = 1;
        loop {
            let err = match transaction.mutation.apply(&mut self.world) {
                Ok(result) => return Ok(Outcome::Applied(result)),
                Err(err) => err,
            };
            if err.is_retryable() && attempt < attempts {
                log::debug!(
                    "tick {tick}: transaction {} hit {err}, retrying ({attempt}/{attempts})",
                    transaction.hash
                );
                attempt += 1;
                continue;
            }
            return match err.kind() {
                ErrorKind::NotFound | ErrorKind::InvalidLayout | ErrorKind::Unsupported => {
                    Ok(Outcome::Rejected(err))
                }
                ErrorKind::BackendIo => Err(EngineError::Backend {
                    tick,
                    attempts: attempt,
                    source: err,
                }),
                ErrorKind::InvariantViolation => Err(EngineError::Invariant { tick, source: err }),
            };
        }
    }

    fn abort(&mut self, tick: u64, err: StorageError) -> EngineError {
        let dropped = self.receipts.discard_pending();
        log::error!("tick {tick} aborted, {dropped} receipts discarded: {err}");
        if err.kind() == ErrorKind::InvariantViolation {
            EngineError::Invariant { tick, source: err }
        } else {
            EngineError::Backend {
                tick,
                attempts: 1,
                source: err,
            }
        }
    }

    pub fn run(&mut self, ticks: u64) -> Result<Vec<TickSummary>, EngineError> {
        let mut summaries = Vec::new();
        self.run_with_hook(ticks, |summary, _| summaries.push(summary.clone()))?;
        Ok(summaries)
    }

    pub fn run_with_hook<F>(&mut self, ticks: u64, mut hook: F) -> Result<(), EngineError>
    where
        F: FnMut(&TickSummary, &ReceiptHistory),
    {
        for _ in 0..ticks {
            let summary = self.tick()?;
            hook(&summary, &self.receipts);
        }
        Ok(())
    }
}
