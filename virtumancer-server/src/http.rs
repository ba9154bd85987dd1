//! HTTP surface: REST routes under `/api/v1` plus the WebSocket upgrades.

use std::sync::Arc;

use axum::extract::{Json, Path, State};
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use virtumancer_driver::HostSystemInfo;
use virtumancer_store::{HardwareView, HostRow, VmRow};

use crate::console;
use crate::error::ControlError;
use crate::service::{AddHostRequest, ControlPlaneService};
use crate::session;

/// JSON error body.
#[derive(Serialize)]
struct ApiError {
    error: String,
    message: String,
}

impl ApiError {
    fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

type ErrorReply = (StatusCode, Json<ApiError>);

fn reply_error(err: ControlError) -> ErrorReply {
    let (status, code) = if err.is_invalid() {
        (StatusCode::BAD_REQUEST, "bad_request")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "internal")
    };
    (status, Json(ApiError::new(code, &err.to_string())))
}

/// Build the application router.
pub fn router(service: Arc<ControlPlaneService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let api = Router::new()
        .route("/hosts", get(list_hosts).post(add_host))
        .route("/hosts/:id", delete(remove_host))
        .route("/hosts/:id/info", get(host_info))
        .route("/hosts/:id/vms", get(list_vms))
        .route("/hosts/:id/vms/:name/stats", get(vm_stats))
        .route("/hosts/:id/vms/:name/hardware", get(vm_hardware))
        .route("/hosts/:id/vms/:name/console", get(console::vnc_handler))
        .route("/hosts/:id/vms/:name/spice", get(console::spice_handler))
        .route("/hosts/:id/vms/:name/:verb", post(vm_lifecycle))
        .route("/ws", get(session::ws_handler));

    Router::new()
        .nest("/api/v1", api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn list_hosts(
    State(service): State<Arc<ControlPlaneService>>,
) -> Result<Json<Vec<HostRow>>, ErrorReply> {
    service.list_hosts().await.map(Json).map_err(reply_error)
}

async fn add_host(
    State(service): State<Arc<ControlPlaneService>>,
    Json(request): Json<AddHostRequest>,
) -> Result<impl IntoResponse, ErrorReply> {
    let host = service.add_host(request).await.map_err(reply_error)?;
    Ok((StatusCode::CREATED, Json(host)))
}

async fn remove_host(
    State(service): State<Arc<ControlPlaneService>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ErrorReply> {
    service.remove_host(&id).await.map_err(reply_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn host_info(
    State(service): State<Arc<ControlPlaneService>>,
    Path(id): Path<String>,
) -> Result<Json<HostSystemInfo>, ErrorReply> {
    service.host_info(&id).await.map(Json).map_err(reply_error)
}

async fn list_vms(
    State(service): State<Arc<ControlPlaneService>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<VmRow>>, ErrorReply> {
    service.list_vms(&id).await.map(Json).map_err(reply_error)
}

async fn vm_stats(
    State(service): State<Arc<ControlPlaneService>>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Json<virtumancer_driver::VmSample>, ErrorReply> {
    service
        .vm_stats(&id, &name)
        .await
        .map(Json)
        .map_err(reply_error)
}

async fn vm_hardware(
    State(service): State<Arc<ControlPlaneService>>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Json<HardwareView>, ErrorReply> {
    service.vm_hardware(&id, &name).await.map(Json).map_err(|e| {
        if e.is_not_found() {
            (
                StatusCode::NOT_FOUND,
                Json(ApiError::new("not_found", &e.to_string())),
            )
        } else {
            reply_error(e)
        }
    })
}

async fn vm_lifecycle(
    State(service): State<Arc<ControlPlaneService>>,
    Path((id, name, verb)): Path<(String, String, String)>,
) -> Result<StatusCode, ErrorReply> {
    service
        .lifecycle(&id, &name, &verb)
        .await
        .map_err(reply_error)?;
    Ok(StatusCode::NO_CONTENT)
}
