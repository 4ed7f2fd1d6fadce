pub mod config;
pub mod ecs;
pub mod engine;
pub mod receipt;
pub mod snapshot;
pub mod storage;
pub mod web;
pub mod workload;
pub mod world;

pub use config::{Config, ConfigLoader};
pub use engine::{Engine, EngineBuilder, EngineSettings, Mutation, TickSummary, Transaction};
pub use storage::{Capabilities, ErrorKind, Location, StorageBackend, StorageError};
pub use world::WorldStorage;
