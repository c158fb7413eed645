//! HTTP front-end for the Dirigent engine
//!
//! Routes:
//! - POST /v1/requests            submit an envelope
//! - GET  /v1/requests            lookup by idempotency key
//! - GET  /v1/requests/{id}       fetch a record
//! - GET  /v1/requests/{id}/audit query the audit trail
//! - POST /v1/callbacks/{backend} fold an async backend update
//! - GET  /v1/registry            registered translators and adapters
//! - GET  /v1/metrics             counters + histograms snapshot (unauthenticated)
//! - GET  /healthz                liveness (unauthenticated)

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use dirigent_config::{
    context_provider, BackendMap, PolicyFile, ServerConfig, StoreKind,
};
use dirigent_core::engine::{Engine, EngineError};
use dirigent_core::policy::{PolicyGate, ProfileRule, Violation};
use dirigent_core::registry::Registry;
use dirigent_core::store::{AuditSink, RequestStore, StoreError};
use dirigent_core::telemetry::Metrics;
use dirigent_core::types::{RequestRecord, RequestStatus};
use dirigent_runtime::{CallbackError, CallbackIngester, Runner};
use dirigent_stores::{
    InMemoryAuditSink, InMemoryRequestStore, SqliteAuditSink, SqliteRequestStore,
};

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
    store: Arc<dyn RequestStore>,
    audit: Arc<dyn AuditSink>,
    runner: Arc<Runner>,
    ingester: Arc<CallbackIngester>,
    metrics: Arc<Metrics>,
    registry: Arc<Registry>,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            code: code.to_string(),
            message: message.into(),
        }),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct SubmitLinks {
    #[serde(rename = "self")]
    self_link: String,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    request_id: String,
    status: RequestStatus,
    idempotent_replay: bool,
    links: SubmitLinks,
}

#[derive(Debug, Serialize)]
struct DeniedResponse {
    request_id: String,
    status: RequestStatus,
    violations: Vec<Violation>,
}

#[derive(Debug, Serialize)]
struct RecordResponse {
    record: RequestRecord,
}

#[derive(Debug, Deserialize)]
struct LookupParams {
    idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuditParams {
    limit: Option<usize>,
}

/// Run the server until it terminates.
///
/// The registry carries the embedder's translators and adapters; the stock
/// binary starts with an empty one and serves admission, lookup, callbacks,
/// and metrics against it.
pub async fn run_server(
    config: ServerConfig,
    policy: PolicyFile,
    backends: BackendMap,
    secrets: BackendMap,
    registry: Registry,
) -> anyhow::Result<()> {
    let (store, audit): (Arc<dyn RequestStore>, Arc<dyn AuditSink>) = match config.store {
        StoreKind::Memory => (
            Arc::new(InMemoryRequestStore::new()),
            Arc::new(InMemoryAuditSink::new()),
        ),
        StoreKind::Durable => {
            if let Some(parent) = config.db_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create data dir {}", parent.display()))?;
            }
            let request_store = SqliteRequestStore::connect(&config.db_path)
                .await
                .context("open durable request store")?;
            let audit_sink = SqliteAuditSink::from_pool(request_store.pool())
                .await
                .context("open durable audit sink")?;
            (Arc::new(request_store), Arc::new(audit_sink))
        }
    };

    let rules = policy
        .profiles
        .into_iter()
        .map(|profile| {
            Arc::new(ProfileRule::new(profile)) as Arc<dyn dirigent_core::policy::PolicyRule>
        })
        .collect();
    let gate = PolicyGate::with_rules(config.policy_mode, rules);
    let provider = Arc::new(context_provider(&backends, &secrets));

    let registry = Arc::new(registry);
    let metrics = Arc::new(Metrics::new());
    let engine = Arc::new(Engine::new(
        registry.clone(),
        store.clone(),
        audit.clone(),
        gate,
        provider,
        metrics.clone(),
    ));
    let runner = Arc::new(Runner::new(engine.clone(), store.clone(), metrics.clone()));
    tokio::spawn(runner.clone().run());
    let ingester = Arc::new(CallbackIngester::new(
        store.clone(),
        audit.clone(),
        engine.locks(),
        metrics.clone(),
        runner.clone(),
    ));

    let state = AppState {
        engine,
        store,
        audit,
        runner,
        ingester,
        metrics,
        registry,
        api_key: config.api_key.clone(),
    };

    let listen = SocketAddr::from(([0, 0, 0, 0], config.port));
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .context("bind server listener failed")?;
    tracing::info!(listen = %listen, "dirigent-server listening");
    axum::serve(listener, app)
        .await
        .context("server terminated with error")
}

fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/requests", post(submit_request).get(lookup_request))
        .route("/v1/requests/{id}", get(get_request))
        .route("/v1/requests/{id}/audit", get(get_audit))
        .route("/v1/callbacks/{backend}", post(ingest_callback))
        .route("/v1/registry", get(get_registry))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/healthz", get(health))
        .route("/v1/metrics", get(get_metrics))
        .merge(protected)
        .with_state(state)
}

/// Bearer token or `x-api-key`; a missing configured key disables auth.
async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.api_key else {
        return next.run(request).await;
    };
    let headers = request.headers();
    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string)
        });
    if provided.as_deref() == Some(expected.as_str()) {
        next.run(request).await
    } else {
        error_response(StatusCode::UNAUTHORIZED, "unauthorized", "missing or invalid API key")
    }
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({"ok": true}))
}

async fn get_metrics(State(state): State<AppState>) -> Response {
    Json(state.metrics.snapshot()).into_response()
}

async fn submit_request(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    match state.engine.submit(body).await {
        Ok(outcome) if outcome.status == RequestStatus::Denied => (
            StatusCode::FORBIDDEN,
            Json(DeniedResponse {
                request_id: outcome.request_id,
                status: outcome.status,
                violations: outcome.violations,
            }),
        )
            .into_response(),
        Ok(outcome) => {
            state.runner.poke();
            (
                StatusCode::ACCEPTED,
                Json(SubmitResponse {
                    links: SubmitLinks {
                        self_link: format!("/v1/requests/{}", outcome.request_id),
                    },
                    request_id: outcome.request_id,
                    status: outcome.status,
                    idempotent_replay: outcome.idempotent_replay,
                }),
            )
                .into_response()
        }
        Err(err) => map_engine_error(err),
    }
}

fn map_engine_error(err: EngineError) -> Response {
    match err {
        EngineError::InvalidEnvelope(inner) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_envelope", inner.to_string())
        }
        EngineError::IdempotencyConflict { key, request_id } => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "code": "idempotency_conflict",
                "message": format!("idempotency key '{key}' already used with a different request"),
                "request_id": request_id,
            })),
        )
            .into_response(),
        err @ (EngineError::NoTranslator { .. }
        | EngineError::ValidationFailed(_)
        | EngineError::TranslateFailed(_)
        | EngineError::InvalidPlan(_)) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "engine_error", err.to_string())
        }
        EngineError::Store(inner) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "store_error", inner.to_string())
        }
    }
}

async fn lookup_request(
    State(state): State<AppState>,
    Query(params): Query<LookupParams>,
) -> Response {
    let Some(key) = params.idempotency_key.filter(|k| !k.trim().is_empty()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "missing_parameter",
            "query parameter 'idempotency_key' is required",
        );
    };
    match state.store.find_by_idempotency_key(&key).await {
        Ok(Some(record)) => Json(RecordResponse { record }).into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no request for idempotency key '{key}'"),
        ),
        Err(err) => map_store_error(err),
    }
}

async fn get_request(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.get(&id).await {
        Ok(Some(record)) => Json(RecordResponse { record }).into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no request '{id}'"),
        ),
        Err(err) => map_store_error(err),
    }
}

async fn get_audit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<AuditParams>,
) -> Response {
    match state.store.get(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return error_response(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("no request '{id}'"),
            );
        }
        Err(err) => return map_store_error(err),
    }
    let limit = params.limit.unwrap_or(1000);
    match state.audit.query(&id, limit).await {
        Ok(events) => Json(serde_json::json!({
            "request_id": id,
            "events": events,
        }))
        .into_response(),
        Err(StoreError::Unsupported(_)) => error_response(
            StatusCode::NOT_IMPLEMENTED,
            "unsupported",
            "the configured audit sink does not support queries",
        ),
        Err(err) => map_store_error(err),
    }
}

async fn ingest_callback(
    State(state): State<AppState>,
    Path(backend): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    match state.ingester.ingest(&backend, &body).await {
        Ok(outcome) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "request_id": outcome.request_id,
                "task_id": outcome.task_id,
                "status": outcome.status,
            })),
        )
            .into_response(),
        Err(CallbackError::Invalid(message)) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_callback", message)
        }
        Err(err @ CallbackError::UnknownExternalId { .. }) => {
            error_response(StatusCode::NOT_FOUND, "unknown_external_id", err.to_string())
        }
        Err(err @ CallbackError::RequestGone(_)) => {
            error_response(StatusCode::NOT_FOUND, "request_gone", err.to_string())
        }
        Err(CallbackError::Store(inner)) => map_store_error(inner),
    }
}

async fn get_registry(State(state): State<AppState>) -> Response {
    let translators: Vec<Value> = state
        .registry
        .list_translators()
        .into_iter()
        .map(|(kind, version)| {
            serde_json::json!({"type": kind, "type_version": version})
        })
        .collect();
    Json(serde_json::json!({
        "translators": translators,
        "adapters": state.registry.list_adapters(),
    }))
    .into_response()
}

fn map_store_error(err: StoreError) -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string())
}
