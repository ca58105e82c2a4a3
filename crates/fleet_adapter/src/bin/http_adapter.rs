#![forbid(unsafe_code)]

use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use fleet_adapter::{
    AdapterError, AdapterHealthResponse, AdapterRuntime, ErrorResponse, LiveQuery,
    MapFeaturesRequest, PositionAck, RecordEventResponse, TimelineQuery,
};
use fleet_contracts::capability::CapabilityRules;
use fleet_contracts::event::Event;
use fleet_contracts::position::PositionSample;
use fleet_engines::aggregator::{LiveDelivery, LiveDriver, LiveVehicle};
use fleet_engines::projection::FeatureCollection;
use fleet_os::dispatch::ActionRequest;
use fleet_os::live_state::{run_event_poll_loop, run_registry_poll_loop, spawn_push_listener};
use fleet_os::sync_manager::{EventRequest, SyncOutcome};
use fleet_storage::event_store::SubscriptionFilter;
use tracing_subscriber::EnvFilter;

type Rejection = (StatusCode, Json<ErrorResponse>);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let bind = env::var("FLEET_HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let addr: SocketAddr = bind.parse()?;
    let sync_worker_enabled = parse_sync_worker_enabled_from_env();

    let runtime = Arc::new(AdapterRuntime::default_from_env()?);
    let config = runtime.config().clone();

    let push = spawn_push_listener(
        runtime.state(),
        runtime.store().subscribe(SubscriptionFilter::all()),
    );
    let event_poll = tokio::spawn(run_event_poll_loop(
        runtime.state(),
        runtime.store().clone(),
        runtime.clock(),
        Duration::from_millis(config.event_poll_interval_ms),
    ));
    let registry_poll = tokio::spawn(run_registry_poll_loop(
        runtime.state(),
        runtime.registry().clone(),
        runtime.clock(),
        Duration::from_millis(config.registry_poll_interval_ms),
    ));
    let sync_every = Duration::from_millis(config.sync_interval_ms);
    let sync_worker = sync_worker_enabled.then(|| {
        let runtime_for_worker = runtime.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sync_every);
            loop {
                ticker.tick().await;
                match runtime_for_worker.run_sync_pass().await {
                    Ok(outcome) if outcome.synced + outcome.failed > 0 => {
                        tracing::info!(?outcome, "offline sync pass finished");
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "offline sync pass failed"),
                }
            }
        })
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/events", post(record_event))
        .route("/v1/events/timeline", get(timeline))
        .route("/v1/positions", post(observe_position))
        .route("/v1/live/drivers", get(live_drivers))
        .route("/v1/live/vehicles", get(live_vehicles))
        .route("/v1/live/deliveries", get(live_deliveries))
        .route("/v1/map/features", post(map_features))
        .route("/v1/capabilities/:mode", get(capabilities))
        .route("/v1/actions", post(dispatch_action))
        .route("/v1/sync", post(run_sync))
        .route("/v1/sync/requeue", post(requeue_dead_letters))
        .with_state(runtime);

    tracing::info!(
        %addr,
        sync_worker_enabled,
        sync_interval_ms = config.sync_interval_ms,
        "fleet_adapter_http listening"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    push.abort();
    event_poll.abort();
    registry_poll.abort();
    if let Some(worker) = sync_worker {
        worker.abort();
    }
    tracing::info!("fleet_adapter_http stopped");
    Ok(())
}

fn parse_sync_worker_enabled_from_env() -> bool {
    match env::var("FLEET_SYNC_WORKER_ENABLED") {
        Ok(v) => !matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "off" | "no"
        ),
        Err(_) => true,
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
}

fn reject(err: AdapterError) -> Rejection {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    }
    (status, Json(ErrorResponse::from(&err)))
}

async fn healthz(State(runtime): State<Arc<AdapterRuntime>>) -> Json<AdapterHealthResponse> {
    Json(runtime.health_report())
}

async fn record_event(
    State(runtime): State<Arc<AdapterRuntime>>,
    Json(req): Json<EventRequest>,
) -> Result<(StatusCode, Json<RecordEventResponse>), Rejection> {
    let resp = runtime.record_event(req).await.map_err(reject)?;
    let status = if resp.event_id.is_local() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(resp)))
}

async fn timeline(
    State(runtime): State<Arc<AdapterRuntime>>,
    Query(q): Query<TimelineQuery>,
) -> Result<Json<Vec<Event>>, Rejection> {
    runtime.timeline(&q).map(Json).map_err(reject)
}

async fn observe_position(
    State(runtime): State<Arc<AdapterRuntime>>,
    Json(sample): Json<PositionSample>,
) -> Result<Json<PositionAck>, Rejection> {
    runtime.observe_position(sample).map(Json).map_err(reject)
}

async fn live_drivers(
    State(runtime): State<Arc<AdapterRuntime>>,
    Query(q): Query<LiveQuery>,
) -> Result<Json<Vec<LiveDriver>>, Rejection> {
    runtime.live_drivers(&q).map(Json).map_err(reject)
}

async fn live_vehicles(
    State(runtime): State<Arc<AdapterRuntime>>,
    Query(q): Query<LiveQuery>,
) -> Result<Json<Vec<LiveVehicle>>, Rejection> {
    runtime.live_vehicles(&q).map(Json).map_err(reject)
}

async fn live_deliveries(
    State(runtime): State<Arc<AdapterRuntime>>,
    Query(q): Query<LiveQuery>,
) -> Result<Json<Vec<LiveDelivery>>, Rejection> {
    runtime.live_deliveries(&q).map(Json).map_err(reject)
}

async fn map_features(
    State(runtime): State<Arc<AdapterRuntime>>,
    Json(req): Json<MapFeaturesRequest>,
) -> Json<FeatureCollection> {
    Json(runtime.map_features(&req))
}

async fn capabilities(
    State(runtime): State<Arc<AdapterRuntime>>,
    Path(mode): Path<String>,
) -> Result<Json<CapabilityRules>, Rejection> {
    runtime.capability_rules(&mode).map(Json).map_err(reject)
}

async fn dispatch_action(
    State(runtime): State<Arc<AdapterRuntime>>,
    Json(req): Json<ActionRequest>,
) -> Result<Json<RecordEventResponse>, Rejection> {
    runtime.dispatch_action(req).await.map(Json).map_err(reject)
}

async fn run_sync(
    State(runtime): State<Arc<AdapterRuntime>>,
) -> Result<Json<SyncOutcome>, Rejection> {
    runtime.run_sync_pass().await.map(Json).map_err(reject)
}

async fn requeue_dead_letters(
    State(runtime): State<Arc<AdapterRuntime>>,
) -> Result<Json<serde_json::Value>, Rejection> {
    let rearmed = runtime.requeue_dead_letters().map_err(reject)?;
    Ok(Json(serde_json::json!({ "status": "ok", "requeued": rearmed })))
}
