// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! HTTP API handlers for the flag service.
//!
//! - `GET /healthz` - Service health check
//! - `GET /metrics` - Prometheus metrics export
//! - `GET /check` - Evaluate one flag for a user/tenant
//! - `POST /check/bulk` - Evaluate several flags for a user/tenant
//! - `GET|POST /flags` - List and create definitions
//! - `GET|PUT|DELETE /flags/:key` - Read, update and delete a definition
//! - `POST /flags/:key/enable|disable|clone` - Lifecycle actions
//! - `GET /flags/:key/statistics` - Usage and relationship summary
//!
//! Evaluation routes never fail because of flag data: unknown flags, broken
//! dependencies and store outages all answer `enabled: false`.

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tower_http::trace::TraceLayer;

use crate::error::AppError;
use crate::evaluator::Evaluator;
use crate::metrics::Metrics;
use crate::model::{
    BulkCheckRequest, BulkCheckResponse, CheckQuery, CloneFlagRequest, CreateFlagRequest,
    DeleteFlagResponse, EvaluationContext, FeatureFlag, FlagCheckResponse, FlagStatistics,
    StatusChangeRequest, UpdateFlagRequest,
};
use crate::store::{FlagRegistry, FlagSnapshot, UpdateOutcome};
use crate::usage::UsageRecorder;
use crate::validation::{validate_definition, validate_key, validate_references, ValidationError};

/// Largest number of keys accepted by one bulk check.
pub const MAX_BULK_KEYS: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub flags: FlagRegistry,
    pub metrics: Metrics,
    pub usage: UsageRecorder,
    pub max_dependency_depth: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/check", get(check_flag))
        .route("/check/bulk", post(bulk_check))
        .route("/flags", get(list_flags).post(create_flag))
        .route(
            "/flags/:key",
            get(get_flag).put(update_flag).delete(delete_flag),
        )
        .route("/flags/:key/enable", post(enable_flag))
        .route("/flags/:key/disable", post(disable_flag))
        .route("/flags/:key/clone", post(clone_flag))
        .route("/flags/:key/statistics", get(flag_statistics))
        .layer(middleware::from_fn_with_state(state.clone(), track_duration))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn track_duration(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let start = Instant::now();
    let response = next.run(request).await;
    state
        .metrics
        .record_request_duration(start.elapsed().as_secs_f64());
    response
}

/// Health check endpoint
pub async fn health() -> Result<Json<serde_json::Value>, AppError> {
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": "fleet-flags",
        "version": env!("CARGO_PKG_VERSION"),
    })))
}

/// Metrics endpoint
pub async fn metrics(State(state): State<AppState>) -> Result<String, AppError> {
    state.metrics.export()
}

/// Evaluate one flag
pub async fn check_flag(
    State(state): State<AppState>,
    Query(query): Query<CheckQuery>,
) -> Result<Json<FlagCheckResponse>, AppError> {
    if query.key.trim().is_empty() {
        return Err(AppError::bad_request("key query parameter is required"));
    }

    let context = EvaluationContext {
        user_id: query.user_id,
        tenant_id: query.tenant_id,
    };
    let keys = [query.key];
    let mut results = evaluate_keys(&state, &keys, &context).await;

    let response = results
        .remove(&keys[0])
        .unwrap_or_else(FlagCheckResponse::disabled);

    Ok(Json(response))
}

/// Evaluate several flags against one context
pub async fn bulk_check(
    State(state): State<AppState>,
    Json(request): Json<BulkCheckRequest>,
) -> Result<Json<BulkCheckResponse>, AppError> {
    if request.keys.is_empty() {
        return Err(AppError::bad_request("keys cannot be empty"));
    }

    if request.keys.len() > MAX_BULK_KEYS {
        return Err(AppError::bad_request(format!(
            "at most {MAX_BULK_KEYS} keys may be checked at once"
        )));
    }

    if request.keys.iter().any(|key| key.trim().is_empty()) {
        return Err(AppError::bad_request("keys must not be blank"));
    }

    let context = EvaluationContext {
        user_id: request.user_id,
        tenant_id: request.tenant_id,
    };
    let results = evaluate_keys(&state, &request.keys, &context).await;

    Ok(Json(results))
}

async fn evaluate_keys(
    state: &AppState,
    keys: &[String],
    context: &EvaluationContext,
) -> BulkCheckResponse {
    let snapshot = match state.flags.snapshot_for(keys).await {
        Ok(snapshot) => snapshot,
        Err(error) => {
            state.metrics.record_lookup_failure();
            tracing::warn!(error = %error, "flag lookup failed, answering disabled");
            FlagSnapshot::default()
        }
    };

    let evaluator =
        Evaluator::new(&snapshot, Utc::now()).with_max_depth(state.max_dependency_depth);

    let mut results = BulkCheckResponse::new();
    for key in keys {
        let evaluation = evaluator.evaluate_key(key, context);
        state
            .metrics
            .record_evaluation(evaluation.reason, evaluation.malformed_variants);

        if evaluation.enabled {
            if let Some(flag) = snapshot.get(key) {
                state.usage.record(flag, context.user_id());
            }
        }

        results.insert(key.clone(), evaluation.to_response());
    }

    results
}

/// List every definition
pub async fn list_flags(State(state): State<AppState>) -> Result<Json<Vec<FeatureFlag>>, AppError> {
    let flags = state.flags.list().await?;
    state.metrics.update_flag_count(flags.len());
    Ok(Json(flags))
}

/// Create a definition. New flags always start disabled.
pub async fn create_flag(
    State(state): State<AppState>,
    Json(request): Json<CreateFlagRequest>,
) -> Result<(StatusCode, Json<FeatureFlag>), AppError> {
    let flag = request.into_flag(Utc::now());
    validate_definition(&flag)?;

    let existing = state.flags.snapshot_all().await?;
    if existing.get(&flag.key).is_some() {
        return Err(ValidationError::DuplicateKey(flag.key).into());
    }
    validate_references(&flag, &existing)?;

    if !state.flags.insert(flag.clone()).await? {
        return Err(ValidationError::DuplicateKey(flag.key).into());
    }

    state.metrics.record_admin_mutation("create");
    tracing::info!(flag = %flag.key, "flag created");

    Ok((StatusCode::CREATED, Json(flag)))
}

pub async fn get_flag(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<FeatureFlag>, AppError> {
    Ok(Json(load(&state, &key).await?))
}

/// Partially update a definition
pub async fn update_flag(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(request): Json<UpdateFlagRequest>,
) -> Result<Json<FeatureFlag>, AppError> {
    let mut flag = load(&state, &key).await?;
    let read_at = flag.updated_at;
    request.apply(&mut flag, Utc::now());
    validate_definition(&flag)?;

    let existing = state.flags.snapshot_all().await?;
    validate_references(&flag, &existing)?;

    save(&state, &flag, read_at).await?;

    state.metrics.record_admin_mutation("update");
    tracing::info!(flag = %key, "flag updated");

    Ok(Json(flag))
}

/// Delete a definition. Flags that depended on it will evaluate disabled.
pub async fn delete_flag(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<DeleteFlagResponse>, AppError> {
    let existing = state.flags.snapshot_all().await?;
    let dependents = dependents_of(&existing, &key);

    if !state.flags.delete(&key).await? {
        return Err(AppError::not_found(format!("flag {key} not found")));
    }

    if !dependents.is_empty() {
        tracing::warn!(
            flag = %key,
            dependents = %dependents.join(","),
            "deleted flag still referenced as a dependency"
        );
    }

    state.metrics.record_admin_mutation("delete");
    tracing::info!(flag = %key, "flag deleted");

    Ok(Json(DeleteFlagResponse { key, deleted: true }))
}

pub async fn enable_flag(
    State(state): State<AppState>,
    Path(key): Path<String>,
    request: Option<Json<StatusChangeRequest>>,
) -> Result<Json<FeatureFlag>, AppError> {
    let actor = request.and_then(|Json(body)| body.actor);
    let mut flag = load(&state, &key).await?;
    let read_at = flag.updated_at;
    flag.enable(actor.clone(), Utc::now());
    save(&state, &flag, read_at).await?;

    state.metrics.record_admin_mutation("enable");
    tracing::info!(flag = %key, actor = ?actor, "flag enabled");

    Ok(Json(flag))
}

pub async fn disable_flag(
    State(state): State<AppState>,
    Path(key): Path<String>,
    request: Option<Json<StatusChangeRequest>>,
) -> Result<Json<FeatureFlag>, AppError> {
    let actor = request.and_then(|Json(body)| body.actor);
    let mut flag = load(&state, &key).await?;
    let read_at = flag.updated_at;
    flag.disable(actor.clone(), Utc::now());
    save(&state, &flag, read_at).await?;

    state.metrics.record_admin_mutation("disable");
    tracing::info!(flag = %key, actor = ?actor, "flag disabled");

    Ok(Json(flag))
}

/// Copy a definition under a new key
pub async fn clone_flag(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(request): Json<CloneFlagRequest>,
) -> Result<(StatusCode, Json<FeatureFlag>), AppError> {
    validate_key(&request.new_key)?;

    let source = load(&state, &key).await?;
    let copy = source.duplicate(request.new_key, Utc::now());

    if !state.flags.insert(copy.clone()).await? {
        return Err(ValidationError::DuplicateKey(copy.key).into());
    }

    state.metrics.record_admin_mutation("clone");
    tracing::info!(flag = %key, clone = %copy.key, actor = ?request.actor, "flag cloned");

    Ok((StatusCode::CREATED, Json(copy)))
}

pub async fn flag_statistics(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<FlagStatistics>, AppError> {
    let flag = load(&state, &key).await?;
    let usage = state.flags.usage_summary(&key).await?;
    let existing = state.flags.snapshot_all().await?;

    let mut children: Vec<String> = existing
        .iter()
        .filter(|other| other.parent_key.as_deref() == Some(key.as_str()))
        .map(|other| other.key.clone())
        .collect();
    children.sort();

    Ok(Json(FlagStatistics {
        status: flag.status,
        rollout_percentage: flag.rollout_percentage,
        track_usage: flag.track_usage,
        usage_count: usage.usage_count,
        last_used_at: usage.last_used_at,
        unique_users: usage.unique_users,
        recent_usage: usage.recent,
        variant_count: flag.variants.len(),
        dependency_count: flag.dependencies.len(),
        dependents: dependents_of(&existing, &key),
        children,
        key,
    }))
}

async fn load(state: &AppState, key: &str) -> Result<FeatureFlag, AppError> {
    state
        .flags
        .get(key)
        .await?
        .ok_or_else(|| AppError::not_found(format!("flag {key} not found")))
}

/// Write back a definition read at `read_at`. A concurrent change in between is a conflict.
async fn save(state: &AppState, flag: &FeatureFlag, read_at: DateTime<Utc>) -> Result<(), AppError> {
    match state.flags.update(flag.clone(), read_at).await? {
        UpdateOutcome::Updated => Ok(()),
        UpdateOutcome::NotFound => Err(AppError::not_found(format!("flag {} not found", flag.key))),
        UpdateOutcome::Stale => Err(AppError::conflict(format!(
            "flag {} was changed by another request, reload and retry",
            flag.key
        ))),
    }
}

fn dependents_of(snapshot: &FlagSnapshot, key: &str) -> Vec<String> {
    let mut dependents: Vec<String> = snapshot
        .iter()
        .filter(|other| other.dependencies.contains(key))
        .map(|other| other.key.clone())
        .collect();
    dependents.sort();
    dependents
}
