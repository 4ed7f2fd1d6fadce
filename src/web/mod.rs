use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::broadcast, task::JoinHandle};
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};

use crate::{
    config::{Config, WorldTask},
    engine::{EngineBuilder, TickSummary},
    receipt::{ReceiptHistory, ReceiptList},
    storage::StorageBackend,
    workload::WorkloadGenerator,
    world::WorldStorage,
};

#[derive(Clone, Serialize)]
pub struct StateEnvelope {
    pub world_id: String,
    pub total_ticks: u64,
    pub latest: Option<TickSummary>,
    pub completed: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListReceiptsRequest {
    #[serde(rename = "startTick", default)]
    pub start_tick: u64,
}

#[derive(Clone)]
struct AppState {
    broadcaster: broadcast::Sender<String>,
    latest: Arc<Mutex<Option<TickSummary>>>,
    receipts: Arc<Mutex<ReceiptHistory>>,
    world_id: String,
    total_ticks: u64,
    simulation_done: Arc<AtomicBool>,
}

pub struct WebServerConfig {
    pub config: Config,
    pub ticks: u64,
    pub host: String,
    pub port: u16,
}

/// Runs the engine on a blocking task, publishing each tick into the shared
/// state the handlers read.
struct SimulationTask {
    config: Config,
    state: AppState,
}

impl WorldTask for SimulationTask {
    type Output = JoinHandle<Result<()>>;

    fn run<B>(self, world: WorldStorage<B>) -> Result<Self::Output>
    where
        B: StorageBackend + Send + 'static,
    {
        let SimulationTask { config, state } = self;
        let workload = WorkloadGenerator::from_config(&config.workload, config.component_ids());
        let mut engine = EngineBuilder::new(config.engine_settings())
            .with_source(workload)
            .build(world);
        let ticks = state.total_ticks;

        Ok(tokio::task::spawn_blocking(move || -> Result<()> {
            let outcome = engine.run_with_hook(ticks, |summary, receipts| {
                if let Ok(mut guard) = state.latest.lock() {
                    *guard = Some(summary.clone());
                }
                if let Ok(mut guard) = state.receipts.lock() {
                    *guard = receipts.clone();
                }
                if let Ok(payload) = serde_json::to_string(summary) {
                    let _ = state.broadcaster.send(payload);
                }
            });
            state.simulation_done.store(true, Ordering::SeqCst);
            outcome?;
            Ok(())
        }))
    }
}

pub async fn run(config: WebServerConfig) -> Result<()> {
    let WebServerConfig {
        config,
        ticks,
        host,
        port,
    } = config;

    let (tx, _) = broadcast::channel::<String>(512);
    let state = AppState {
        broadcaster: tx,
        latest: Arc::new(Mutex::new(None)),
        receipts: Arc::new(Mutex::new(ReceiptHistory::new(config.receipt_history_size))),
        world_id: config.world_id.clone(),
        total_ticks: ticks,
        simulation_done: Arc::new(AtomicBool::new(false)),
    };

    let world_id = config.world_id.clone();
    let sim_handle = config.open_world(SimulationTask {
        config: config.clone(),
        state: state.clone(),
    })?;

    tokio::spawn(async move {
        match sim_handle.await {
            Ok(Ok(())) => log::info!("simulation of world {world_id} completed"),
            Ok(Err(err)) => log::error!("simulation of world {world_id} failed: {err:#}"),
            Err(err) => log::error!("simulation task for world {world_id} failed: {err}"),
        }
    });

    let router = Router::new()
        .route("/query/receipts/list", post(list_receipts))
        .route("/api/state", get(latest_state))
        .route("/api/events", get(stream_events))
        .with_state(Arc::new(state));

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;
    log::info!("serving world queries at http://{addr} (Ctrl+C to stop)");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    log::info!("shutting down query server");
}

async fn list_receipts(
    State(state): State<Arc<AppState>>,
    request: Option<Json<ListReceiptsRequest>>,
) -> Result<Json<ReceiptList>, StatusCode> {
    let start_tick = request.map(|Json(body)| body.start_tick).unwrap_or(0);
    let receipts = state
        .receipts
        .lock()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(receipts.list(start_tick)))
}

async fn latest_state(State(state): State<Arc<AppState>>) -> Result<Json<StateEnvelope>, StatusCode> {
    let latest = state
        .latest
        .lock()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();
    Ok(Json(StateEnvelope {
        world_id: state.world_id.clone(),
        total_ticks: state.total_ticks,
        latest,
        completed: state.simulation_done.load(Ordering::SeqCst),
    }))
}

async fn stream_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.broadcaster.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(payload) => Some(Ok(Event::default().data(payload))),
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(2))
            .text("keep-alive"),
    )
}
