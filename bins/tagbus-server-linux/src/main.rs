use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tagbus_core::{CalcError, FunctionTable, ProjectConfig};
use tagbus_protocol::DiscoveryResponse;
use tagbus_server::{Bus, BusHandle, DriverCatalog, RpcTable, ServerConfig, TagBusServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tagbus_server=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Tag bus server starting...");

    let project = match std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TAGBUS_PROJECT").ok())
    {
        Some(path) => {
            tracing::info!("Loading project {}", path);
            ProjectConfig::from_path(&path)?
        }
        None => {
            tracing::warn!("No project given, starting with built-in drivers only");
            ProjectConfig::default()
        }
    };

    let env_ip = std::env::var("IP").ok().and_then(|s| s.parse::<IpAddr>().ok());
    let env_port = std::env::var("PORT").ok().and_then(|s| s.parse::<u16>().ok());
    let ws_addr = project.server.listen_addr(env_ip, env_port);
    let http_addr = http_addr_for(ws_addr)?;

    let bus = Bus::load(&project, &functions(), &DriverCatalog::new(), RpcTable::new())?;
    let bus_handle = bus.handle();
    let bus_task = bus.spawn();

    let config = ServerConfig {
        name: project.server.name().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        bind_addr: ws_addr,
    };
    let server = TagBusServer::new(config, bus_handle.clone());

    let ws_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            tracing::error!("WebSocket server error: {}", e);
        }
    });

    let http_state = ApiState {
        bus: bus_handle.clone(),
        ws_addr,
        http_addr,
    };
    let http_handle = tokio::spawn(async move {
        if let Err(e) = start_http_server(http_state).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    tracing::info!("Tag bus server ready");
    tracing::info!("   WebSocket: ws://{}/stream", ws_addr);
    tracing::info!("   HTTP API:  http://{}/api/tags", http_addr);
    tracing::info!("   Discovery: http://{}/tagbus", http_addr);

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = ws_handle => {
            tracing::warn!("WebSocket server stopped");
        }
        _ = http_handle => {
            tracing::warn!("HTTP server stopped");
        }
    }

    bus_handle.shutdown();
    if let Err(e) = bus_task.await {
        tracing::error!("Bus task failed: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// The HTTP API listens on the port after the WebSocket port.
fn http_addr_for(ws_addr: SocketAddr) -> anyhow::Result<SocketAddr> {
    let port = ws_addr.port().checked_add(1).ok_or_else(|| {
        anyhow::anyhow!(
            "WebSocket port {} leaves no port for the HTTP API",
            ws_addr.port()
        )
    })?;
    Ok(SocketAddr::new(ws_addr.ip(), port))
}

/// Functions available to project files by name.
fn functions() -> FunctionTable {
    let mut functions = FunctionTable::new();
    functions.register_calc("press_avg", |ctx| {
        let readings: Vec<f64> = ["press1", "press2", "press3"]
            .iter()
            .filter_map(|id| ctx.number_of(id))
            .collect();
        if readings.is_empty() {
            return Err(CalcError::Failed("no numeric pressure readings".to_string()));
        }
        Ok(json!(readings.iter().sum::<f64>() / readings.len() as f64))
    });
    functions
}

#[derive(Clone)]
struct ApiState {
    bus: BusHandle,
    ws_addr: SocketAddr,
    http_addr: SocketAddr,
}

#[derive(Debug, Deserialize)]
struct TagsQuery {
    pattern: Option<String>,
}

/// Start the HTTP query API
async fn start_http_server(state: ApiState) -> anyhow::Result<()> {
    let addr = state.http_addr;

    let app = Router::new()
        .route("/tagbus", get(discovery_handler))
        .route("/api/tags", get(tags_handler))
        .route("/api/tags/:id", get(tag_handler))
        .route("/api/drivers", get(drivers_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Discovery endpoint handler
async fn discovery_handler(State(state): State<ApiState>) -> Json<DiscoveryResponse> {
    Json(DiscoveryResponse::new(
        &state.http_addr.ip().to_string(),
        state.http_addr.port(),
        state.ws_addr.port(),
    ))
}

async fn tags_handler(
    State(state): State<ApiState>,
    Query(query): Query<TagsQuery>,
) -> Result<Json<Value>, StatusCode> {
    let data = match query.pattern {
        Some(pattern) => json!({ "pattern": pattern }),
        None => Value::Null,
    };
    call(&state.bus, "query_tags", data, StatusCode::BAD_REQUEST).await
}

async fn tag_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    call(
        &state.bus,
        "read_tag",
        json!({ "tagid": id }),
        StatusCode::NOT_FOUND,
    )
    .await
}

async fn drivers_handler(State(state): State<ApiState>) -> Result<Json<Value>, StatusCode> {
    call(
        &state.bus,
        "query_driver_info",
        Value::Null,
        StatusCode::INTERNAL_SERVER_ERROR,
    )
    .await
}

/// Run an app call, mapping a failed result to `status`.
async fn call(
    bus: &BusHandle,
    name: &str,
    data: Value,
    status: StatusCode,
) -> Result<Json<Value>, StatusCode> {
    let result = bus.app_call(name, data).await;
    match result.error {
        None => Ok(Json(result.result)),
        Some(e) => {
            tracing::debug!("HTTP {} failed: {}", name, e);
            Err(status)
        }
    }
}
