use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use archstore::config::{Config, ConfigLoader, WorldTask};
use archstore::ecs::{ComponentTypeId, EntityId};
use archstore::engine::{EngineBuilder, EngineError, EngineSettings, Mutation, Transaction, TransactionSource};
use archstore::snapshot::load_snapshot;
use archstore::storage::kv::{KvCapabilities, KvError, KvStore, MemoryKv, Slot, WriteBatch};
use archstore::storage::{ErrorKind, KvStorage, Location, MemoryStorage, StorageBackend, StorageError, StorageResult};
use archstore::workload::WorkloadGenerator;
use archstore::world::WorldStorage;
use bytes::Bytes;
use tempfile::tempdir;

const HEALTH: ComponentTypeId = ComponentTypeId::new(0);

fn demo_config() -> Config {
    ConfigLoader::new(".")
        .load("configs/demo.yaml")
        .expect("demo config should load")
}

struct TickHook {
    settings: EngineSettings,
    ticks: u64,
}

impl WorldTask for TickHook {
    type Output = Vec<u64>;

    fn run<B>(self, world: WorldStorage<B>) -> anyhow::Result<Vec<u64>>
    where
        B: StorageBackend + Send + 'static,
    {
        let generator = WorkloadGenerator::new(9, vec![HEALTH, ComponentTypeId::new(1)], 8);
        let mut engine = EngineBuilder::new(self.settings).with_source(generator).build(world);
        let mut ticks = Vec::new();
        engine.run_with_hook(self.ticks, |summary, receipts| {
            assert_eq!(receipts.current_tick(), summary.tick + 1);
            ticks.push(summary.tick);
        })?;
        Ok(ticks)
    }
}

#[test]
fn engine_runs_hook_each_tick() {
    let config = demo_config();
    let temp = tempdir().expect("tempdir");
    let mut settings = config.engine_settings();
    settings.snapshot_dir = temp.path().to_path_buf();
    let ticks = config
        .open_world(TickHook { settings, ticks: 6 })
        .expect("run succeeds");

    assert_eq!(ticks, vec![0, 1, 2, 3, 4, 5]);
}

#[test]
fn failed_transactions_become_receipts() {
    let config = demo_config();
    let world = WorldStorage::new("1", config.registry().unwrap(), archstore::storage::MemoryStorage::new());
    let mut engine = EngineBuilder::new(EngineSettings::default()).build(world);

    engine.submit(Transaction::new(
        "0x01",
        Mutation::CreateEntity {
            components: vec![(HEALTH, Bytes::from_static(b"{\"hp\":3}"))],
        },
    ));
    engine.submit(Transaction::new(
        "0x02",
        Mutation::DestroyEntity {
            entity: EntityId::new(404),
        },
    ));
    engine.submit(Transaction::new(
        "0x03",
        Mutation::AddComponent {
            entity: EntityId::new(0),
            component: ComponentTypeId::new(250),
            payload: Bytes::from_static(b"?"),
        },
    ));
    let summary = engine.tick().unwrap();
    assert_eq!(summary.applied, 1);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.entity_count, 1);

    let list = engine.receipts().list(0);
    assert_eq!((list.start_tick, list.end_tick), (0, 1));
    let hashes: Vec<&str> = list.receipts.iter().map(|r| r.tx_hash.as_str()).collect();
    assert_eq!(hashes, vec!["0x01", "0x02", "0x03"]);
    assert!(list.receipts[0].errors.is_empty());
    assert_eq!(list.receipts[0].result, Some(serde_json::json!({ "entity": 0 })));
    assert!(list.receipts[1].errors[0].contains("404"));
    assert!(!list.receipts[2].errors.is_empty());
}

#[test]
fn receipt_window_follows_history_size() {
    let config = demo_config();
    let world = WorldStorage::new("1", config.registry().unwrap(), archstore::storage::MemoryStorage::new());
    let settings = EngineSettings {
        receipt_history_size: 3,
        ..EngineSettings::default()
    };
    let generator = WorkloadGenerator::new(2, config.component_ids(), 4);
    let mut engine = EngineBuilder::new(settings).with_source(generator).build(world);
    engine.run(8).unwrap();

    let list = engine.receipts().list(0);
    assert_eq!((list.start_tick, list.end_tick), (5, 8));
    assert_eq!(list.receipts.len(), 12);
    assert!(engine.receipts().list(100).receipts.is_empty());
}

#[test]
fn snapshots_written_on_interval() {
    let config = demo_config();
    let temp = tempdir().expect("tempdir");
    let settings = EngineSettings {
        snapshot_interval_ticks: 2,
        snapshot_dir: temp.path().to_path_buf(),
        ..EngineSettings::default()
    };
    let world = WorldStorage::new(
        "snap",
        config.registry().unwrap(),
        archstore::storage::KvStorage::new(archstore::storage::kv::MemoryKv::new(), "snap"),
    );
    let generator = WorkloadGenerator::new(4, config.component_ids(), 6);
    let mut engine = EngineBuilder::new(settings).with_source(generator).build(world);
    let summaries = engine.run(4).unwrap();

    let written: Vec<_> = summaries
        .iter()
        .filter_map(|summary| summary.snapshot_path.clone())
        .collect();
    assert_eq!(written.len(), 2);
    assert!(written[0].ends_with("snap/tick_000001.json"));

    let snapshot = load_snapshot(&written[1]).unwrap();
    assert_eq!(snapshot.tick, 3);
    assert_eq!(snapshot.entity_count, summaries[3].entity_count);
    let placed: usize = snapshot.archetypes.iter().map(|a| a.members.len()).sum();
    assert_eq!(placed, snapshot.entity_count);
}

/// In-memory store that can be told to fail reads or reject commits, and
/// counts commit attempts.
#[derive(Default)]
struct ScriptedKv {
    inner: MemoryKv,
    failing_reads: AtomicU32,
    conflicting_commits: AtomicU32,
    commits: AtomicU32,
}

impl ScriptedKv {
    fn failing_reads(count: u32) -> Arc<Self> {
        let kv = Self::default();
        kv.failing_reads.store(count, Ordering::SeqCst);
        Arc::new(kv)
    }

    fn always_conflicting() -> Arc<Self> {
        let kv = Self::default();
        kv.conflicting_commits.store(u32::MAX, Ordering::SeqCst);
        Arc::new(kv)
    }

    fn commits(&self) -> u32 {
        self.commits.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

impl KvStore for ScriptedKv {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn capabilities(&self) -> KvCapabilities {
        KvCapabilities::GUARDED_BATCH
    }

    fn read(&self, slot: &Slot) -> Result<Option<Bytes>, KvError> {
        if take_one(&self.failing_reads) {
            return Err(KvError::Transport(format!("read of {slot} timed out").into()));
        }
        self.inner.read(slot)
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), KvError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.conflicting_commits) {
            return Err(KvError::Conflict);
        }
        self.inner.commit(batch)
    }
}

fn scripted_world(kv: &Arc<ScriptedKv>, max_retries: u32) -> WorldStorage<KvStorage<Arc<ScriptedKv>>> {
    let backend = KvStorage::new(kv.clone(), "1").with_max_retries(max_retries);
    WorldStorage::new("1", demo_config().registry().unwrap(), backend)
}

fn create_health(hash: &str) -> Transaction {
    Transaction::new(
        hash,
        Mutation::CreateEntity {
            components: vec![(HEALTH, Bytes::from_static(b"{\"hp\":1}"))],
        },
    )
}

#[test]
fn contention_is_retried_once_per_mutation() {
    let kv = ScriptedKv::always_conflicting();
    let settings = EngineSettings {
        max_retries: 8,
        ..EngineSettings::default()
    };
    let mut engine = EngineBuilder::new(settings).build(scripted_world(&kv, 8));
    engine.submit(create_health("0x01"));

    let err = engine.tick().unwrap_err();
    assert_eq!(kv.commits(), 9);
    match err {
        EngineError::Backend { tick, attempts, source } => {
            assert_eq!((tick, attempts), (0, 1));
            assert!(matches!(source, StorageError::Contention { attempts: 9 }));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn read_failures_are_retried_until_the_budget_runs_out() {
    let kv = ScriptedKv::failing_reads(u32::MAX);
    let settings = EngineSettings {
        max_retries: 2,
        ..EngineSettings::default()
    };
    let mut engine = EngineBuilder::new(settings).build(scripted_world(&kv, 2));
    engine.submit(create_health("0x01"));
    engine.submit(create_health("0x02"));

    let err = engine.tick().unwrap_err();
    match err {
        EngineError::Backend { tick, attempts, source } => {
            assert_eq!((tick, attempts), (0, 3));
            assert_eq!(source.kind(), ErrorKind::BackendIo);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(kv.commits(), 0);
    assert_eq!(engine.current_tick(), 0);
    assert_eq!(engine.pending(), 2);
}

#[test]
fn transient_read_failure_commits_exactly_once() {
    let kv = ScriptedKv::failing_reads(2);
    let mut engine = EngineBuilder::new(EngineSettings::default()).build(scripted_world(&kv, 8));
    engine.submit(create_health("0x01"));

    let summary = engine.tick().unwrap();
    assert_eq!((summary.applied, summary.failed, summary.entity_count), (1, 0, 1));
    assert_eq!(kv.commits(), 1);
}

#[test]
fn invariant_violation_aborts_tick_and_discards_its_receipts() {
    let kv = Arc::new(MemoryKv::new());
    let world = WorldStorage::new(
        "1",
        demo_config().registry().unwrap(),
        KvStorage::new(kv.clone(), "1"),
    );
    let mut engine = EngineBuilder::new(EngineSettings::default()).build(world);
    engine.submit(create_health("0x01"));
    engine.submit(create_health("0x02"));
    engine.tick().unwrap();

    let first = EntityId::new(0);
    let archetype = engine.world().location(first).unwrap().archetype;
    let mut corrupt = WriteBatch::new();
    corrupt.put(
        Slot::value("LOC:WORLD-1:E-0"),
        Bytes::from(serde_json::to_vec(&Location::new(archetype, 1)).unwrap()),
    );
    kv.commit(corrupt).unwrap();

    engine.submit(create_health("0x03"));
    engine.submit(Transaction::new("0x04", Mutation::DestroyEntity { entity: first }));
    engine.submit(create_health("0x05"));
    let err = engine.tick().unwrap_err();
    assert!(matches!(err, EngineError::Invariant { tick: 1, .. }));

    assert_eq!(engine.current_tick(), 1);
    assert_eq!(engine.pending(), 2);
    let list = engine.receipts().list(0);
    assert_eq!((list.start_tick, list.end_tick), (0, 1));
    let hashes: Vec<&str> = list.receipts.iter().map(|r| r.tx_hash.as_str()).collect();
    assert_eq!(hashes, vec!["0x01", "0x02"]);
    // 0x03 committed on its own before the abort.
    assert_eq!(engine.world().entity_count().unwrap(), 3);
}

struct FailsAt(u64);

impl TransactionSource<MemoryStorage> for FailsAt {
    fn name(&self) -> &str {
        "fails-at"
    }

    fn transactions(&mut self, tick: u64, _world: &WorldStorage<MemoryStorage>) -> StorageResult<Vec<Transaction>> {
        if tick == self.0 {
            return Err(StorageError::EntityNotFound(EntityId::new(tick)));
        }
        Ok(vec![create_health(&format!("0x{tick:02x}"))])
    }
}

#[test]
fn unbounded_run_stops_at_first_error() {
    let world = WorldStorage::new("1", demo_config().registry().unwrap(), MemoryStorage::new());
    let mut engine = EngineBuilder::new(EngineSettings::default())
        .with_source(FailsAt(3))
        .build(world);

    let err = engine.run(u64::MAX).unwrap_err();
    assert!(matches!(err, EngineError::Source { ref name, .. } if name == "fails-at"));
    assert_eq!(engine.current_tick(), 3);
    assert_eq!(engine.world().entity_count().unwrap(), 3);
}
