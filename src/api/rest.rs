//! REST API Handlers
//!
//! Implements the REST endpoints for device listing and the pool
//! lifecycle: initial setup, expansion, device replacement, failsafe
//! transition, the recovery check, and the status polls. Validation
//! rejections map to 400, a busy lifecycle slot maps to 409, everything
//! else to 500.

use crate::domain::types::RaidType;
use crate::error::Error;
use crate::raid::RaidManager;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Initial setup request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupRequest {
    /// Stable ids of the devices to build the pool from
    pub raid_devices: Vec<String>,
    /// Redundancy level: "storage" or "failsafe"
    pub raid_type: RaidType,
}

/// Single-device request body, shared by expansion and transition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    pub device: String,
}

/// In-place device replacement request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceRequest {
    /// Stable id of the member to replace
    pub old_device: String,
    /// Stable id of the device taking its place
    pub new_device: String,
}

/// Generic accepted-operation response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub accepted: bool,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    manager: RaidManager,
}

impl RestRouter {
    pub fn new(manager: RaidManager) -> Self {
        Self { manager }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            manager: self.manager,
        };

        Router::new()
            // Device endpoints
            .route("/v1/internal-storage/devices", get(list_devices))
            // Lifecycle endpoints
            .route("/v1/raid/setup", post(setup))
            .route("/v1/raid/setup-status", get(setup_status))
            .route("/v1/raid/status", get(raid_status))
            .route("/v1/raid/devices", post(add_device))
            .route("/v1/raid/replace", post(replace_device))
            .route("/v1/raid/recovery", get(recovery_status))
            .route("/v1/raid/transition", post(transition))
            .route(
                "/v1/raid/transition/acknowledge-error",
                post(acknowledge_transition_error),
            )
            // Health endpoint
            .route("/health", get(health_check))
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    manager: RaidManager,
}

fn error_response(e: Error) -> axum::response::Response {
    let status = if e.is_validation() {
        StatusCode::BAD_REQUEST
    } else if e.is_conflict() {
        StatusCode::CONFLICT
    } else {
        error!("request failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    };
    let code = match status {
        StatusCode::BAD_REQUEST => "validation_failed",
        StatusCode::CONFLICT => "operation_in_flight",
        _ => "internal_error",
    };
    (
        status,
        Json(ApiErrorResponse {
            error: code.into(),
            message: e.to_string(),
        }),
    )
        .into_response()
}

// =============================================================================
// Handlers
// =============================================================================

/// List attached internal storage devices
async fn list_devices(State(state): State<AppState>) -> impl IntoResponse {
    match state.manager.get_devices().await {
        Ok(devices) => (StatusCode::OK, Json(devices)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Accept an initial pool setup
async fn setup(
    State(state): State<AppState>,
    Json(request): Json<SetupRequest>,
) -> impl IntoResponse {
    info!(
        devices = request.raid_devices.len(),
        raid_type = %request.raid_type,
        "setup requested"
    );
    match state
        .manager
        .setup(request.raid_devices, request.raid_type)
        .await
    {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(AcceptedResponse { accepted: true }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// Poll the initial setup across the reboot boundary
async fn setup_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.manager.check_initial_raid_setup_status().await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Live aggregate pool status
async fn raid_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.manager.get_status().await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Add a device to a storage-mode pool
async fn add_device(
    State(state): State<AppState>,
    Json(request): Json<DeviceRequest>,
) -> impl IntoResponse {
    info!(device = %request.device, "expansion requested");
    match state.manager.add_device(&request.device).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(AcceptedResponse { accepted: true }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// Replace a pool member in place
async fn replace_device(
    State(state): State<AppState>,
    Json(request): Json<ReplaceRequest>,
) -> impl IntoResponse {
    info!(old = %request.old_device, new = %request.new_device, "replacement requested");
    match state
        .manager
        .replace_device(&request.old_device, &request.new_device)
        .await
    {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(AcceptedResponse { accepted: true }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// Boot-time mount-failure recovery check
async fn recovery_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.manager.check_recovery().await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Begin the storage-to-failsafe transition
async fn transition(
    State(state): State<AppState>,
    Json(request): Json<DeviceRequest>,
) -> impl IntoResponse {
    info!(device = %request.device, "failsafe transition requested");
    match state.manager.transition_to_failsafe(&request.device).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(AcceptedResponse { accepted: true }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// Clear a terminal transition error
async fn acknowledge_transition_error(State(state): State<AppState>) -> impl IntoResponse {
    match state.manager.acknowledge_transition_error() {
        Ok(()) => (
            StatusCode::OK,
            Json(AcceptedResponse { accepted: true }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::hardware::StaticProber;
    use crate::pool::MemoryBackend;
    use crate::raid::ManagerConfig;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_app() -> (Router, Arc<StaticProber>, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(ConfigStore::open(dir.path().join("homepool.yaml")).unwrap());
        let prober = Arc::new(StaticProber::new());
        let backend = Arc::new(MemoryBackend::new());
        let manager = RaidManager::new(
            config,
            prober.clone(),
            backend,
            ManagerConfig {
                poll_interval: Duration::from_millis(2),
                data_dir: dir.path().to_path_buf(),
                mount_failure_log: dir.path().join("data-mount-error.log"),
            },
        )
        .unwrap();
        (RestRouter::new(manager).build(), prober, dir)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _, _dir) = test_app();
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_list_devices() {
        let (app, prober, _dir) = test_app();
        prober.upsert_device("nvme-A-1", Some(1), 2_000_000_000_000);

        let response = app
            .oneshot(
                Request::get("/v1/internal-storage/devices")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json[0]["id"], "nvme-A-1");
        assert_eq!(json[0]["slot"], 1);
        assert_eq!(json[0]["rawSizeBytes"], 2_000_000_000_000u64);
    }

    #[tokio::test]
    async fn test_status_absent_shape() {
        let (app, _, _dir) = test_app();
        let response = app
            .oneshot(Request::get("/v1/raid/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["exists"], false);
        assert_eq!(json["status"], "ABSENT");
        // Optional sections are omitted entirely, not null
        assert!(json.get("raidType").is_none());
        assert!(json.get("failsafeTransitionStatus").is_none());
    }

    #[tokio::test]
    async fn test_setup_validation_maps_to_400() {
        let (app, _, _dir) = test_app();
        let response = app
            .oneshot(
                Request::post("/v1/raid/setup")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"raidDevices":[],"raidType":"storage"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let json = body_json(response).await;
        assert_eq!(json["error"], "validation_failed");
    }

    #[tokio::test]
    async fn test_setup_accepted() {
        let (app, prober, _dir) = test_app();
        prober.upsert_device("nvme-A-1", Some(1), 2_000_000_000_000);

        let response = app
            .oneshot(
                Request::post("/v1/raid/setup")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"raidDevices":["nvme-A-1"],"raidType":"storage"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_transition_without_pool_maps_to_400() {
        let (app, _, _dir) = test_app();
        let response = app
            .oneshot(
                Request::post("/v1/raid/transition")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"device":"nvme-B-2"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_replace_without_pool_maps_to_400() {
        let (app, _, _dir) = test_app();
        let response = app
            .oneshot(
                Request::post("/v1/raid/replace")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"oldDevice":"nvme-A-1","newDevice":"nvme-B-2"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let json = body_json(response).await;
        assert_eq!(json["error"], "validation_failed");
    }

    #[tokio::test]
    async fn test_recovery_reports_clean_boot() {
        let (app, _, _dir) = test_app();
        let response = app
            .oneshot(Request::get("/v1/raid/recovery").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["mountFailed"], false);
        assert!(json["devices"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_acknowledge_is_idempotent() {
        let (app, _, _dir) = test_app();
        let response = app
            .oneshot(
                Request::post("/v1/raid/transition/acknowledge-error")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
