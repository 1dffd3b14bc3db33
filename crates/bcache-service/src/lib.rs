//! HTTP front end for the planner: `POST /get_plan` runs the pipeline over
//! a JSON-encoded window and returns the resulting ops, `POST /report`
//! accepts executor-side feedback, and `GET /healthz` is a liveness probe.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bcache_model::{
    AdmissionEntry, EvictionVictim, HeatRow, KVRequest, Knobs, LayerLat, PipelineFlags, PlanOp, TenantCap, TierCap,
};
use bcache_planner::{admission_core, eviction_core, plan_window};
use serde::{Deserialize, Serialize};

/// Wire request for `POST /get_plan`, matching `spec.md` §4.H's contract:
/// `requests, heat, tier_caps, tenant_caps, layer_lat, now_ms, knobs`.
#[derive(Debug, Deserialize)]
pub struct GetPlanRequest {
    pub requests: Vec<KVRequest>,
    #[serde(default)]
    pub heat: Vec<HeatRow>,
    #[serde(default)]
    pub tenant_caps: Vec<TenantCap>,
    #[serde(default)]
    pub tier_caps: Vec<TierCap>,
    #[serde(default)]
    pub layer_lat: Vec<LayerLat>,
    #[serde(default)]
    pub now_ms: f64,
    #[serde(default)]
    pub knobs: Knobs,
}

/// Wire response for `POST /get_plan`: `{plan, evict, admission}` per
/// `spec.md` §4.H.
#[derive(Debug, Serialize)]
pub struct GetPlanResponse {
    pub plan: Vec<PlanOp>,
    pub evict: Vec<EvictionVictim>,
    pub admission: Vec<AdmissionEntry>,
    pub dropped_degenerate: u64,
    pub dropped_by_tenant_cap: u64,
    pub dropped_by_tier_cap: u64,
    pub dropped_by_op_cap: u64,
    pub dropped_by_min_io: u64,
}

#[derive(Debug)]
pub enum ApiError {
    InvalidInput(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<axum::extract::rejection::JsonRejection> for ApiError {
    fn from(rejection: axum::extract::rejection::JsonRejection) -> Self {
        ApiError::InvalidInput(rejection.body_text())
    }
}

#[derive(Clone, Default)]
pub struct AppState {
    inner: Arc<()>,
}

async fn get_plan(
    State(_state): State<AppState>,
    body: Result<Json<GetPlanRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<GetPlanResponse>, ApiError> {
    let Json(req) = body?;

    if req.knobs.page_bytes == 0 {
        return Err(ApiError::InvalidInput("knobs.page_bytes must be non-zero".into()));
    }

    let (plan, stats) = plan_window(
        &req.requests,
        &req.heat,
        &req.tenant_caps,
        &req.tier_caps,
        &req.layer_lat,
        &req.knobs,
        &PipelineFlags::default(),
        req.now_ms,
        1,
        0,
    )
    .map_err(|e| ApiError::InvalidInput(e.to_string()))?;

    let admission = if req.knobs.enable_admission {
        admission_core(&req.heat, req.knobs.reuse_threshold)
    } else {
        Vec::new()
    };

    let evict = if req.knobs.enable_eviction {
        req.tier_caps
            .iter()
            .filter_map(|cap| {
                cap.target_free_bytes
                    .map(|target| eviction_core(&cap.node, cap.tier, &req.heat, cap.free_bytes, target))
            })
            .flatten()
            .collect()
    } else {
        Vec::new()
    };

    Ok(Json(GetPlanResponse {
        plan,
        evict,
        admission,
        dropped_degenerate: stats.dropped_degenerate,
        dropped_by_tenant_cap: stats.dropped_by_tenant_cap,
        dropped_by_tier_cap: stats.dropped_by_tier_cap,
        dropped_by_op_cap: stats.dropped_by_op_cap,
        dropped_by_min_io: stats.dropped_by_min_io,
    }))
}

async fn report(
    State(_state): State<AppState>,
    body: Result<Json<serde_json::Value>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(payload) = body?;
    tracing::debug!(?payload, "received executor report");
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "not found" })))
}

pub fn router() -> Router {
    Router::new()
        .route("/get_plan", post(get_plan))
        .route("/report", post(report))
        .route("/healthz", get(healthz))
        .fallback(not_found)
        .with_state(AppState::default())
}

pub async fn serve(addr: SocketAddr) -> std::io::Result<()> {
    tracing::info!(%addr, "starting plan service");
    axum::Server::bind(&addr)
        .serve(router().into_make_service())
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
}
