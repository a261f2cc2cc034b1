use std::net::SocketAddr;
use std::sync::Arc;

use assay_core::sync::{PullRequest, PullResponse, PushBatch, PushSummary};
use assay_core::{SyncService, Timestamp};
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{
    extract_bearer_token, is_staff_role, SharedKeyGate, StaffJwtVerifier, SyncCredential, SyncGate,
};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::rate_limit::{EndpointRateLimiter, ProtectedEndpoint, RateLimitMetricsSnapshot};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    sync: SyncService,
    gate: Arc<dyn SyncGate>,
    staff_verifier: Option<Arc<StaffJwtVerifier>>,
    endpoint_rate_limiter: Arc<EndpointRateLimiter>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, sync: SyncService) -> Self {
        Self {
            sync,
            gate: Arc::new(SharedKeyGate::from_config(&config)),
            staff_verifier: config
                .jwt
                .as_ref()
                .map(|jwt| Arc::new(StaffJwtVerifier::from_config(jwt))),
            endpoint_rate_limiter: Arc::new(EndpointRateLimiter::from_config(config.as_ref())),
            config,
        }
    }
}

/// Fingerprint of an admitted sync caller, used for rate limiting.
#[derive(Debug, Clone)]
struct SyncCaller(String);

#[derive(Debug, Clone)]
struct StaffUser {
    phone: String,
    role: String,
}

pub fn app_router(state: AppState) -> Router {
    let sync_routes = Router::new()
        .route("/sync/changes", get(pull_changes))
        .route("/sync/push", post(push_changes))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_sync_key,
        ));

    let staff_routes = Router::new()
        .route("/assays/{id}/mark-ready", put(mark_ready))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_staff));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", sync_routes.merge(staff_routes))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    rate_limit: RateLimitMetricsSnapshot,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        rate_limit: state.endpoint_rate_limiter.metrics_snapshot(),
    })
}

async fn require_sync_key(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let credential = SyncCredential::from_request(
        request.headers(),
        peer,
        state.config.sync_trust_forwarded_for,
    );
    if !state.gate.allows(&credential) {
        tracing::warn!(
            client = %credential.fingerprint(),
            key_present = credential.key.is_some(),
            "Rejected sync credential"
        );
        return Err(AppError::unauthorized("Sync credential rejected"));
    }
    let caller = SyncCaller(credential.fingerprint());
    request.extensions_mut().insert(caller);
    Ok(next.run(request).await)
}

async fn require_staff(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let verifier = state
        .staff_verifier
        .as_ref()
        .ok_or_else(|| AppError::config("JWT_SECRET_KEY is not configured on the backend"))?;
    let token = extract_bearer_token(request.headers())?;
    let phone = verifier.verify_access_token(token)?;

    let role = state
        .sync
        .role_for_phone(&phone)
        .await?
        .ok_or_else(|| AppError::forbidden("No staff account for this token"))?;
    if !is_staff_role(&role) {
        return Err(AppError::forbidden("Role may not change assay readiness"));
    }

    request.extensions_mut().insert(StaffUser { phone, role });
    Ok(next.run(request).await)
}

#[derive(Debug, Deserialize)]
struct ChangesQuery {
    since: Option<String>,
    entities: Option<String>,
    limit: Option<usize>,
}

async fn pull_changes(
    State(state): State<AppState>,
    Extension(caller): Extension<SyncCaller>,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<PullResponse>, AppError> {
    state
        .endpoint_rate_limiter
        .check(ProtectedEndpoint::SyncPull, &caller.0)
        .await?;

    let since = match query.since.as_deref() {
        Some(raw) => Timestamp::parse(raw)
            .map_err(|error| AppError::bad_request(format!("`since`: {error}")))?,
        None => Timestamp::EPOCH,
    };
    let mut request = PullRequest::since(since);
    if let Some(raw) = query.entities.as_deref() {
        let kinds = PullRequest::parse_entities(raw)
            .map_err(|error| AppError::bad_request(error.to_string()))?;
        if !kinds.is_empty() {
            request = request.with_entities(kinds);
        }
    }
    if let Some(limit) = query.limit {
        if limit == 0 {
            return Err(AppError::bad_request("`limit` must be at least 1"));
        }
        request = request.with_limit(limit);
    }

    let change_set = state.sync.pull(&request).await?;
    tracing::info!(
        endpoint = "sync_pull",
        client = %caller.0,
        since = %since,
        rows = change_set.len(),
        has_more = change_set.has_more,
        "Served change set"
    );
    Ok(Json(PullResponse::new(change_set, Timestamp::now())))
}

async fn push_changes(
    State(state): State<AppState>,
    Extension(caller): Extension<SyncCaller>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<PushSummary>, AppError> {
    state
        .endpoint_rate_limiter
        .check(ProtectedEndpoint::SyncPush, &caller.0)
        .await?;

    let batch = PushBatch::from_json(&body)?;
    if batch.len() > state.config.sync_max_push_rows {
        return Err(AppError::bad_request(format!(
            "push batch has {} rows; the limit is {}",
            batch.len(),
            state.config.sync_max_push_rows
        )));
    }

    let summary = state.sync.push(&batch).await?;
    tracing::info!(
        endpoint = "sync_push",
        client = %caller.0,
        applied = summary.applied,
        ignored = summary.ignored,
        rejected = summary.rejected,
        "Applied push batch"
    );
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
struct MarkReadyQuery {
    ready: Option<bool>,
}

#[derive(Debug, Serialize)]
struct MarkReadyResponse {
    id: i64,
    ready: bool,
    changed: bool,
    modified: Timestamp,
    notifications_created: usize,
}

async fn mark_ready(
    State(state): State<AppState>,
    Extension(staff): Extension<StaffUser>,
    Path(id): Path<i64>,
    Query(query): Query<MarkReadyQuery>,
) -> Result<Json<MarkReadyResponse>, AppError> {
    state
        .endpoint_rate_limiter
        .check(ProtectedEndpoint::MarkReady, &staff.phone)
        .await?;

    let change = state.sync.set_ready(id, query.ready).await?;
    tracing::info!(
        endpoint = "mark_ready",
        assay_id = id,
        role = %staff.role,
        ready = change.ready(),
        changed = change.changed,
        "Updated assay readiness"
    );
    Ok(Json(MarkReadyResponse {
        id,
        ready: change.ready(),
        changed: change.changed,
        modified: change.assay.modified,
        notifications_created: change.effects.notifications_created,
    }))
}
