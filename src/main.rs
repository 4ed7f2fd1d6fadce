use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use archstore::{
    config::{Config, ConfigLoader, WorldTask},
    engine::EngineBuilder,
    storage::StorageBackend,
    web::{self, WebServerConfig},
    workload::WorkloadGenerator,
    world::WorldStorage,
};

#[derive(Debug, Parser)]
#[command(author, version, about = "Archetype storage engine runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the configured workload and print a summary
    Run {
        /// Path to the world configuration YAML file
        #[arg(long, default_value = "configs/demo.yaml")]
        config: PathBuf,

        /// Override tick count (uses the workload default when omitted)
        #[arg(long)]
        ticks: Option<u64>,
    },
    /// Run the workload in the background and serve receipt queries over HTTP
    Serve {
        #[arg(long, default_value = "configs/demo.yaml")]
        config: PathBuf,

        #[arg(long)]
        ticks: Option<u64>,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

struct RunWorkload {
    config: Config,
    ticks: u64,
}

impl WorldTask for RunWorkload {
    type Output = ();

    fn run<B>(self, world: WorldStorage<B>) -> Result<()>
    where
        B: StorageBackend + Send + 'static,
    {
        let backend = world.backend().name();
        let workload = WorkloadGenerator::from_config(&self.config.workload, self.config.component_ids());
        let mut engine = EngineBuilder::new(self.config.engine_settings())
            .with_source(workload)
            .build(world);
        let summaries = engine.run(self.ticks)?;

        let applied: usize = summaries.iter().map(|summary| summary.applied).sum();
        let failed: usize = summaries.iter().map(|summary| summary.failed).sum();
        println!(
            "World '{}' ({backend}) completed {} ticks: {applied} transactions applied, {failed} rejected, {} live entities in {} archetypes",
            engine.world().world_id(),
            self.ticks,
            engine.world().entity_count()?,
            engine.world().backend().archetype_count()?,
        );
        Ok(())
    }
}

fn init_logging(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let loader = ConfigLoader::new(".");
    match cli.command {
        Command::Run { config, ticks } => {
            let config = loader.load(&config)?;
            init_logging(&config.log_level);
            let ticks = ticks.unwrap_or(config.workload.ticks);
            config.open_world(RunWorkload {
                config: config.clone(),
                ticks,
            })
        }
        Command::Serve {
            config,
            ticks,
            host,
            port,
        } => {
            let config = loader.load(&config)?;
            init_logging(&config.log_level);
            let ticks = ticks.unwrap_or(config.workload.ticks);
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(web::run(WebServerConfig {
                config,
                ticks,
                host,
                port,
            }))
        }
    }
}
