//! Deterministic mutation stream for demos and long-running checks

use bytes::Bytes;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use serde_json::json;

use crate::ecs::{ComponentTypeId, EntityId, LayoutFilter};
use crate::engine::{Mutation, Transaction, TransactionSource};
use crate::storage::{StorageBackend, StorageResult};
use crate::world::WorldStorage;

/// Destroyed entities kept around as stale targets.
const STALE_TARGETS: usize = 32;

fn default_transactions_per_tick() -> usize {
    16
}

fn default_ticks() -> u64 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkloadConfig {
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_ticks")]
    pub ticks: u64,
    #[serde(default = "default_transactions_per_tick")]
    pub transactions_per_tick: usize,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            ticks: default_ticks(),
            transactions_per_tick: default_transactions_per_tick(),
        }
    }
}

pub struct WorkloadGenerator {
    rng: ChaCha8Rng,
    components: Vec<ComponentTypeId>,
    transactions_per_tick: usize,
    destroyed: Vec<EntityId>,
}

impl WorkloadGenerator {
    pub fn new(seed: u64, components: Vec<ComponentTypeId>, transactions_per_tick: usize) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            components,
            transactions_per_tick,
            destroyed: Vec::new(),
        }
    }

    pub fn from_config(config: &WorkloadConfig, components: Vec<ComponentTypeId>) -> Self {
        Self::new(config.seed, components, config.transactions_per_tick)
    }

    fn payload(&mut self, component: ComponentTypeId) -> Bytes {
        let value: i64 = self.rng.gen_range(-1_000..1_000);
        Bytes::from(json!({ "component": component, "value": value }).to_string())
    }

    fn random_component(&mut self) -> Option<ComponentTypeId> {
        self.components.choose(&mut self.rng).copied()
    }

    fn create(&mut self) -> Mutation {
        let mut chosen: Vec<ComponentTypeId> = self
            .components
            .iter()
            .copied()
            .filter(|_| self.rng.gen_bool(0.5))
            .collect();
        chosen.sort();
        let components = chosen
            .into_iter()
            .map(|component| (component, self.payload(component)))
            .collect();
        Mutation::CreateEntity { components }
    }

    fn next_mutation(&mut self, live: &[EntityId]) -> Mutation {
        if !self.destroyed.is_empty() && self.rng.gen_bool(0.05) {
            let index = self.rng.gen_range(0..self.destroyed.len());
            return Mutation::DestroyEntity {
                entity: self.destroyed.swap_remove(index),
            };
        }
        let Some(&entity) = live.choose(&mut self.rng) else {
            return self.create();
        };
        let Some(component) = self.random_component() else {
            return self.create();
        };
        match self.rng.gen_range(0..100) {
            0..=24 => self.create(),
            25..=49 => Mutation::AddComponent {
                entity,
                component,
                payload: self.payload(component),
            },
            50..=74 => Mutation::SetComponent {
                entity,
                component,
                payload: self.payload(component),
            },
            75..=91 => Mutation::RemoveComponent { entity, component },
            _ => {
                if self.destroyed.len() == STALE_TARGETS {
                    self.destroyed.remove(0);
                }
                self.destroyed.push(entity);
                Mutation::DestroyEntity { entity }
            }
        }
    }
}

impl<B: StorageBackend> TransactionSource<B> for WorkloadGenerator {
    fn name(&self) -> &str {
        "workload"
    }

    fn transactions(&mut self, tick: u64, world: &WorldStorage<B>) -> StorageResult<Vec<Transaction>> {
        let mut live = world.entities_matching(&LayoutFilter::All)?;
        live.sort();
        let mut transactions = Vec::with_capacity(self.transactions_per_tick);
        for sequence in 0..self.transactions_per_tick {
            let mutation = self.next_mutation(&live);
            let salt: u32 = self.rng.gen();
            let hash = format!("0x{tick:08x}{sequence:04x}{salt:08x}");
            transactions.push(Transaction::new(hash, mutation));
        }
        Ok(transactions)
    }
}
