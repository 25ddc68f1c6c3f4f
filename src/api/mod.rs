//! HTTP API for health checks, swap lookups, registration and admin calls

use crate::config::ApiConfig;
use crate::error::{RouterError, RouterResult};
use crate::swap::{SwapKey, SwapRecord, SwapResult};
use crate::worker::verify::Registration;
use crate::worker::{AdminCall, AdminService, VerifyEngine, WorkerContext, Workers};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    ctx: WorkerContext,
    verify: Arc<VerifyEngine>,
    admin: Arc<AdminService>,
    started: Instant,
}

impl AppState {
    pub fn new(workers: &Workers) -> Self {
        Self {
            ctx: workers.context().clone(),
            verify: workers.verify.clone(),
            admin: workers.admin.clone(),
            started: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/chains", get(get_chains))
        .route("/stats", get(get_stats))
        .route("/swap/register", post(register_swap))
        .route("/swap/:chain_id/:tx_id/:log_index", get(get_swap))
        .route("/admin", post(admin_call))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server until shutdown
pub async fn run_server(config: ApiConfig, state: AppState) -> RouterResult<()> {
    let shutdown = state.ctx.shutdown.clone();
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RouterError::Internal(format!("bind api {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
        .map_err(|e| RouterError::Internal(format!("api server: {}", e)))?;

    Ok(())
}

fn error_response(err: RouterError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        RouterError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        RouterError::SwapNotFound { .. }
        | RouterError::ResultNotFound { .. }
        | RouterError::ChainNotFound { .. } => StatusCode::NOT_FOUND,
        RouterError::Admin(_) | RouterError::Bridge(_) | RouterError::NoncePassed { .. } => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - store and every chain reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.ctx.store.health_check().await;
    let chain_health = state.ctx.registry.health_check().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);

    let ready = store_ok && chains_ok;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready,
            store: store_ok,
            chains: chains_ok,
            details: chain_health
                .into_iter()
                .map(|(chain_id, healthy)| ChainHealth { chain_id, healthy })
                .collect(),
        }),
    )
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let settings = &state.ctx.settings;
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        identifier: settings.router.identifier.clone(),
        role: format!("{:?}", settings.router.role).to_lowercase(),
        parallel_swap: settings.router.parallel_swap,
        uptime_seconds: state.started.elapsed().as_secs(),
        chains: state.ctx.registry.chain_ids(),
        paused_chains: state.ctx.registry.paused_chains(),
    })
}

async fn get_chains(State(state): State<AppState>) -> impl IntoResponse {
    let registry = &state.ctx.registry;
    let chains = registry
        .chain_ids()
        .into_iter()
        .map(|chain_id| ChainInfo {
            chain_id,
            latest_block: registry.cached_latest_block(chain_id),
            paused: registry.is_paused(chain_id),
            reswap: registry.is_reswap_supported(chain_id),
        })
        .collect();
    Json(ChainsResponse { chains })
}

async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.ctx.store.stats().await {
        Ok(stats) => Ok(Json(stats)),
        Err(e) => Err(error_response(e)),
    }
}

async fn get_swap(
    State(state): State<AppState>,
    Path((chain_id, tx_id, log_index)): Path<(u64, String, u32)>,
) -> impl IntoResponse {
    let key = SwapKey::new(chain_id, &tx_id, log_index);
    let record = match state.ctx.store.find_swap(&key).await {
        Ok(record) => record,
        Err(e) => return Err(error_response(e)),
    };
    let result = match state.ctx.store.find_result(&key).await {
        Ok(result) => Some(result),
        Err(RouterError::ResultNotFound { .. }) => None,
        Err(e) => return Err(error_response(e)),
    };
    Ok(Json(SwapResponse { record, result }))
}

async fn register_swap(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> impl IntoResponse {
    match state
        .verify
        .register(req.chain_id, &req.tx_id, req.log_index)
        .await
    {
        Ok(registrations) => Ok(Json(
            registrations
                .into_iter()
                .map(RegisterResponse::from)
                .collect::<Vec<_>>(),
        )),
        Err(e) => Err(error_response(e)),
    }
}

async fn admin_call(State(state): State<AppState>, Json(call): Json<AdminCall>) -> impl IntoResponse {
    let id = Uuid::new_v4();
    info!("Admin request {} method {}", id, call.method);
    match state.admin.call(&call).await {
        Ok(result) => (
            StatusCode::OK,
            Json(AdminResponse {
                id,
                result: Some(result),
                error: None,
            }),
        ),
        Err(e) => {
            warn!("Admin request {} rejected: {}", id, e);
            let (status, Json(body)) = error_response(e);
            (
                status,
                Json(AdminResponse {
                    id,
                    result: None,
                    error: Some(body.error),
                }),
            )
        }
    }
}

// Request and response types

#[derive(Deserialize)]
struct RegisterRequest {
    chain_id: u64,
    tx_id: String,
    #[serde(default)]
    log_index: Option<u32>,
}

#[derive(Serialize)]
struct RegisterResponse {
    log_index: Option<u32>,
    key: Option<String>,
    created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<Registration> for RegisterResponse {
    fn from(r: Registration) -> Self {
        Self {
            log_index: r.log_index,
            key: r.key.map(|k| k.to_string()),
            created: r.created,
            error: r.error,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct AdminResponse {
    id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    store: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: u64,
    healthy: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    identifier: String,
    role: String,
    parallel_swap: bool,
    uptime_seconds: u64,
    chains: Vec<u64>,
    paused_chains: Vec<u64>,
}

#[derive(Serialize)]
struct ChainInfo {
    chain_id: u64,
    latest_block: u64,
    paused: bool,
    reswap: bool,
}

#[derive(Serialize)]
struct ChainsResponse {
    chains: Vec<ChainInfo>,
}

#[derive(Serialize)]
struct SwapResponse {
    record: SwapRecord,
    result: Option<SwapResult>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::RecordStatus;
    use crate::test_utils::{sample_record, TestHarness};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_and_status() {
        let h = TestHarness::new();
        let app = router(AppState::new(&h.workers));

        let (status, body) = send(app.clone(), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        h.ctx.registry.pause(56);
        let (_, body) = send(app, get("/status")).await;
        assert_eq!(body["identifier"], "SWAP_ROUTER_TEST");
        assert_eq!(body["role"], "server");
        assert_eq!(body["paused_chains"], serde_json::json!([56]));
    }

    #[tokio::test]
    async fn test_register_then_lookup_swap() {
        let h = TestHarness::new();
        let app = router(AppState::new(&h.workers));
        let record = sample_record(RecordStatus::Detected);
        h.src.add_swap(record.to_swap_info());

        let (status, body) = send(
            app.clone(),
            post_json(
                "/swap/register",
                serde_json::json!({ "chain_id": 1, "tx_id": record.tx_id }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["created"], true);

        let uri = format!("/swap/1/{}/{}", record.tx_id, record.log_index);
        let (status, body) = send(app.clone(), get(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["record"]["status"], "detected");
        assert!(body["result"].is_null());

        let (status, _) = send(app, get("/swap/1/0xmissing/0")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unsigned_admin_call_is_rejected() {
        let h = TestHarness::new();
        let app = router(AppState::new(&h.workers));
        let call = serde_json::json!({
            "method": "maintain",
            "params": ["pause", "56"],
            "timestamp": crate::swap::now(),
            "signature": "0x00",
        });

        let (status, body) = send(app, post_json("/admin", call)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].as_str().unwrap().contains("invalid signature"));
        assert!(body["id"].is_string());
        assert!(!h.ctx.registry.is_paused(56));
    }
}
