//! [`GatewayServer`] – HTTP + WebSocket front door for viewers.
//!
//! | Route | Purpose |
//! |---|---|
//! | `GET /` | embedded live viewer page |
//! | `GET /ws` | viewer WebSocket; server pushes telemetry frames |
//! | `GET /healthz` | liveness plus current viewer count |
//! | `GET /api/v1/vehicles` | paginated vehicle listing |
//! | `GET /api/v1/vehicles/{id}` | one vehicle record |
//! | `POST /api/v1/vehicles/{vin}/control` | `{"action":"START"\|"STOP"}` → command bus |
//!
//! CORS is wide open; the dashboard is served from another origin.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use fleetcast_types::{ConnectionWriteError, DispatchError, LookupError, StartupError};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::dispatcher::CommandDispatcher;
use crate::registry::{ConnectionRegistry, ViewerSink};
use crate::vehicles::{DEFAULT_LOOKUP_TIMEOUT, VehicleDirectory, with_deadline};

/// Default TCP port for the gateway.
pub const DEFAULT_PORT: u16 = 8081;

/// Page size the listing endpoint uses when none (or an invalid one) is given.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Compiled-in viewer page.
const VIEWER_HTML: &str = include_str!("viewer.html");

// ---------------------------------------------------------------------------
// GatewayServer
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct AppState {
    registry: Arc<ConnectionRegistry>,
    dispatcher: CommandDispatcher,
    vehicles: Arc<dyn VehicleDirectory>,
    lookup_timeout: Duration,
    cancel: CancellationToken,
}

/// Viewer-facing HTTP + WebSocket server.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use fleetcast_gateway::{CommandDispatcher, ConnectionRegistry, GatewayServer, InMemoryVehicleDirectory, RegistryConfig};
/// use fleetcast_middleware::LocalBus;
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() {
///     let registry = ConnectionRegistry::new(RegistryConfig::default());
///     let dispatcher = CommandDispatcher::new(Arc::new(LocalBus::default()));
///     let vehicles = Arc::new(InMemoryVehicleDirectory::default());
///     GatewayServer::new(registry, dispatcher, vehicles, CancellationToken::new())
///         .run()
///         .await
///         .expect("gateway failed");
/// }
/// ```
pub struct GatewayServer {
    state: AppState,
    port: u16,
}

impl GatewayServer {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        dispatcher: CommandDispatcher,
        vehicles: Arc<dyn VehicleDirectory>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state: AppState {
                registry,
                dispatcher,
                vehicles,
                lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
                cancel,
            },
            port: DEFAULT_PORT,
        }
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Override the per-request vehicle lookup deadline.
    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.state.lookup_timeout = timeout;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Build the axum router.
    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Bind `0.0.0.0:<port>`.
    pub async fn bind(&self) -> Result<TcpListener, StartupError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        TcpListener::bind(addr).await.map_err(|e| StartupError::Bind {
            addr: addr.to_string(),
            reason: e.to_string(),
        })
    }

    /// Serve on an already bound listener until the cancellation token fires.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "gateway listening");
        }
        let router = self.router();
        let cancel = self.state.cancel.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        info!("gateway stopped");
        Ok(())
    }

    /// Bind and serve.
    pub async fn run(self) -> Result<(), StartupError> {
        let listener = self.bind().await?;
        let addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        self.serve(listener).await.map_err(|e| StartupError::Bind {
            addr,
            reason: e.to_string(),
        })
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .route("/api/v1/vehicles", get(list_vehicles))
        .route("/api/v1/vehicles/{id}", get(get_vehicle))
        .route("/api/v1/vehicles/{id}/control", post(control_vehicle))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "code": status.as_u16(), "error": message.into() })),
    )
        .into_response()
}

fn lookup_error(err: LookupError) -> Response {
    let status = match err {
        LookupError::NotFound(_) => StatusCode::NOT_FOUND,
        LookupError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        LookupError::DeadlineExceeded(_) | LookupError::Cancelled | LookupError::Upstream(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    json_error(status, err.to_string())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index() -> Html<&'static str> {
    Html(VIEWER_HTML)
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "viewers": state.registry.len() }))
}

async fn get_vehicle(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let lookup = state.vehicles.get_vehicle(&id);
    match with_deadline(state.lookup_timeout, &state.cancel, lookup).await {
        Ok(vehicle) => Json(json!({ "code": 200, "message": "success", "data": vehicle })).into_response(),
        Err(e) => {
            warn!(vehicle_id = %id, error = %e, "vehicle lookup failed");
            lookup_error(e)
        }
    }
}

/// Positive integer query value, or `default`.
fn positive_param(query: &HashMap<String, String>, key: &str, default: u32) -> u32 {
    query
        .get(key)
        .and_then(|raw| raw.parse::<i64>().ok())
        .filter(|&n| n > 0)
        .map_or(default, |n| u32::try_from(n).unwrap_or(u32::MAX))
}

async fn list_vehicles(State(state): State<AppState>, Query(query): Query<HashMap<String, String>>) -> Response {
    let page = positive_param(&query, "page", 1);
    let page_size = positive_param(&query, "pageSize", DEFAULT_PAGE_SIZE);
    let lookup = state.vehicles.list_vehicles(page, page_size);
    match with_deadline(state.lookup_timeout, &state.cancel, lookup).await {
        Ok(listing) => Json(json!({
            "code": 200,
            "data": { "items": listing.items, "total": listing.total },
        }))
        .into_response(),
        Err(e) => {
            warn!(page, page_size, error = %e, "vehicle listing failed");
            lookup_error(e)
        }
    }
}

#[derive(Deserialize)]
struct ControlRequest {
    #[serde(default)]
    action: String,
}

async fn control_vehicle(
    State(state): State<AppState>,
    Path(vin): Path<String>,
    body: Result<Json<ControlRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(request)) = body else {
        return json_error(StatusCode::BAD_REQUEST, "Invalid request body");
    };
    match state.dispatcher.dispatch(&vin, &request.action).await {
        Ok(command) => Json(json!({
            "code": 200,
            "message": "Command sent successfully",
            "data": { "vin": command.device_id(), "action": command.action() },
        }))
        .into_response(),
        Err(DispatchError::Validation(e)) => {
            debug!(vin = %vin, error = %e, "rejected control request");
            json_error(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e @ DispatchError::Publish(_)) => {
            warn!(vin = %vin, error = %e, "command publish failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket viewers
// ---------------------------------------------------------------------------

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| viewer_session(socket, state))
}

/// Outbound half of a viewer socket.
struct WsSink {
    inner: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl ViewerSink for WsSink {
    async fn send_text(&mut self, payload: Arc<str>) -> Result<(), ConnectionWriteError> {
        self.inner
            .send(Message::Text(payload.as_ref().into()))
            .await
            .map_err(|e| ConnectionWriteError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.inner.close().await;
    }
}

/// Register the viewer and watch the inbound half for liveness only.
async fn viewer_session(socket: WebSocket, state: AppState) {
    let (sink, mut inbound) = socket.split();
    let id = state.registry.add(WsSink { inner: sink });

    loop {
        tokio::select! {
            _ = state.cancel.cancelled() => break,
            frame = inbound.next() => match frame {
                None | Some(Ok(Message::Close(_))) => break,
                Some(Err(e)) => {
                    debug!(viewer = %id, error = %e, "viewer socket error");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    state.registry.remove(id);
}
