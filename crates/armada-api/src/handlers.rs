//! Ledger handlers.
//!
//! The generic handlers serve every resource kind through `Ledger<R>`; they
//! are instantiated once per kind in [`crate::build_router`]. Mutating calls
//! carry the caller's `metadata {id, version}` and return the record as it
//! stands after the write.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use armada_state::*;

use crate::error::{ApiError, ApiResult};
use crate::{ApiResponse, ApiState};

type Reply<T> = ApiResult<Json<ApiResponse<T>>>;

// ── Query and request bodies ───────────────────────────────────

/// List query. Lists are comma-separated; `fields` holds `name:value` pairs.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListQuery {
    pub ids: Option<String>,
    pub names: Option<String>,
    pub states: Option<String>,
    pub exclude_states: Option<String>,
    pub fields: Option<String>,
    pub version: Option<u64>,
    pub version_gte: Option<u64>,
    pub version_lte: Option<u64>,
    pub include_deleted: bool,
    pub limit: Option<usize>,
}

fn split(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_state<S: DeserializeOwned>(raw: &str) -> ApiResult<S> {
    serde_json::from_value(serde_json::Value::String(raw.to_ascii_uppercase()))
        .map_err(|_| ApiError::bad_request(format!("unknown state: {raw}")))
}

impl ListQuery {
    pub fn into_filter<S: DeserializeOwned + PartialEq>(self) -> ApiResult<Filter<S>> {
        let mut filter = Filter::new()
            .include_deleted(self.include_deleted)
            .version(VersionRange {
                gte: self.version_gte,
                lte: self.version_lte,
                eq: self.version,
            });
        if let Some(ids) = &self.ids {
            filter = filter.ids(split(ids));
        }
        if let Some(names) = &self.names {
            filter = filter.names(split(names));
        }
        if let Some(states) = &self.states {
            filter = filter.states(split(states).map(parse_state).collect::<ApiResult<Vec<S>>>()?);
        }
        if let Some(states) = &self.exclude_states {
            filter = filter.exclude_states(split(states).map(parse_state).collect::<ApiResult<Vec<S>>>()?);
        }
        if let Some(fields) = &self.fields {
            for pair in split(fields) {
                let (name, value) = pair
                    .split_once(':')
                    .ok_or_else(|| ApiError::bad_request(format!("field filter must be name:value, got {pair}")))?;
                filter = filter.field(name, value);
            }
        }
        if let Some(limit) = self.limit {
            filter = filter.limit(limit);
        }
        Ok(filter)
    }
}

/// Version the caller last read, for deletes and removals.
#[derive(Debug, Deserialize)]
pub struct VersionQuery {
    pub version: u64,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest<S> {
    pub metadata: Metadata,
    pub status: Status<S>,
}

#[derive(Debug, Deserialize)]
pub struct AddRuntimeInstanceRequest {
    pub metadata: Metadata,
    pub runtime_instance: RuntimeInstance,
}

#[derive(Debug, Deserialize)]
pub struct UpdateActiveStateRequest {
    pub metadata: Metadata,
    pub is_active: bool,
}

#[derive(Debug, Deserialize)]
pub struct AddOperationRequest {
    pub metadata: Metadata,
    pub operation: Operation,
}

#[derive(Debug, Deserialize)]
pub struct AddDeploymentRequest {
    pub metadata: Metadata,
    pub deployment: Deployment,
}

/// The path id wins over the body, so a request cannot touch another record.
fn pinned(id: String, metadata: Metadata) -> Metadata {
    Metadata::new(id, metadata.version)
}

// ── Generic ledger operations ──────────────────────────────────

/// GET /api/v1/{kind}
pub async fn list_records<R: LedgerRecord>(State(state): State<ApiState>, Query(query): Query<ListQuery>) -> Reply<Vec<R>> {
    let filter = query.into_filter()?;
    Ok(ApiResponse::ok(state.store.ledger::<R>().list(&filter)?))
}

/// POST /api/v1/{kind}
pub async fn create_record<R: LedgerRecord>(
    State(state): State<ApiState>,
    Json(record): Json<R>,
) -> ApiResult<(StatusCode, Json<ApiResponse<R>>)> {
    let created = state.store.ledger::<R>().create(record)?;
    Ok((StatusCode::CREATED, ApiResponse::ok(created)))
}

/// GET /api/v1/{kind}/{id}
pub async fn get_record<R: LedgerRecord>(State(state): State<ApiState>, Path(id): Path<String>) -> Reply<R> {
    Ok(ApiResponse::ok(state.store.ledger::<R>().get(&id)?))
}

/// GET /api/v1/{kind}/by-name/{name}
pub async fn get_record_by_name<R: LedgerRecord>(State(state): State<ApiState>, Path(name): Path<String>) -> Reply<R> {
    Ok(ApiResponse::ok(state.store.ledger::<R>().get_by_name(&name)?))
}

/// PUT /api/v1/{kind}/{id}/status
pub async fn update_record_status<R: LedgerRecord>(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateStatusRequest<R::State>>,
) -> Reply<R> {
    let updated = state
        .store
        .ledger::<R>()
        .update_status(&pinned(id, req.metadata), req.status)?;
    Ok(ApiResponse::ok(updated))
}

/// DELETE /api/v1/{kind}/{id}?version=N
pub async fn delete_record<R: LedgerRecord>(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<VersionQuery>,
) -> Reply<R> {
    let deleted = state
        .store
        .ledger::<R>()
        .delete(&Metadata::new(id, query.version))?;
    Ok(ApiResponse::ok(deleted))
}

// ── Meta-instance aggregate ────────────────────────────────────

/// POST /api/v1/meta-instances/{id}/runtime-instances
pub async fn add_runtime_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<AddRuntimeInstanceRequest>,
) -> Reply<MetaInstance> {
    let meta = state
        .store
        .meta_instances()
        .add_runtime_instance(&pinned(id, req.metadata), req.runtime_instance)?;
    Ok(ApiResponse::ok(meta))
}

/// PUT /api/v1/meta-instances/{id}/runtime-instances/{rt}/status
pub async fn update_runtime_status(
    State(state): State<ApiState>,
    Path((id, rt)): Path<(String, String)>,
    Json(req): Json<UpdateStatusRequest<RuntimeState>>,
) -> Reply<MetaInstance> {
    let meta = state
        .store
        .meta_instances()
        .update_runtime_status(&pinned(id, req.metadata), &rt, req.status)?;
    Ok(ApiResponse::ok(meta))
}

/// PUT /api/v1/meta-instances/{id}/runtime-instances/{rt}/active
pub async fn update_runtime_active_state(
    State(state): State<ApiState>,
    Path((id, rt)): Path<(String, String)>,
    Json(req): Json<UpdateActiveStateRequest>,
) -> Reply<MetaInstance> {
    let meta = state
        .store
        .meta_instances()
        .update_runtime_active_state(&pinned(id, req.metadata), &rt, req.is_active)?;
    Ok(ApiResponse::ok(meta))
}

/// DELETE /api/v1/meta-instances/{id}/runtime-instances/{rt}?version=N
pub async fn remove_runtime_instance(
    State(state): State<ApiState>,
    Path((id, rt)): Path<(String, String)>,
    Query(query): Query<VersionQuery>,
) -> Reply<MetaInstance> {
    let meta = state
        .store
        .meta_instances()
        .remove_runtime_instance(&Metadata::new(id, query.version), &rt)?;
    Ok(ApiResponse::ok(meta))
}

/// POST /api/v1/meta-instances/{id}/operations
pub async fn add_operation(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<AddOperationRequest>,
) -> Reply<MetaInstance> {
    let meta = state
        .store
        .meta_instances()
        .add_operation(&pinned(id, req.metadata), req.operation)?;
    Ok(ApiResponse::ok(meta))
}

/// PUT /api/v1/meta-instances/{id}/operations/{op}/status
pub async fn update_operation_status(
    State(state): State<ApiState>,
    Path((id, op)): Path<(String, String)>,
    Json(req): Json<UpdateStatusRequest<OperationState>>,
) -> Reply<MetaInstance> {
    let meta = state
        .store
        .meta_instances()
        .update_operation_status(&pinned(id, req.metadata), &op, req.status)?;
    Ok(ApiResponse::ok(meta))
}

/// DELETE /api/v1/meta-instances/{id}/operations/{op}?version=N
pub async fn remove_operation(
    State(state): State<ApiState>,
    Path((id, op)): Path<(String, String)>,
    Query(query): Query<VersionQuery>,
) -> Reply<MetaInstance> {
    let meta = state
        .store
        .meta_instances()
        .remove_operation(&Metadata::new(id, query.version), &op)?;
    Ok(ApiResponse::ok(meta))
}

// ── Deployments ────────────────────────────────────────────────

/// POST /api/v1/deployment-plans/{id}/deployments
pub async fn add_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<AddDeploymentRequest>,
) -> Reply<DeploymentPlan> {
    let plan = state
        .store
        .deployment_plans()
        .add_deployment(&pinned(id, req.metadata), req.deployment)?;
    Ok(ApiResponse::ok(plan))
}

/// PUT /api/v1/deployment-plans/{id}/deployments/{dep}/status
pub async fn update_deployment_status(
    State(state): State<ApiState>,
    Path((id, dep)): Path<(String, String)>,
    Json(req): Json<UpdateStatusRequest<DeploymentState>>,
) -> Reply<DeploymentPlan> {
    let plan = state
        .store
        .deployment_plans()
        .update_deployment_status(&pinned(id, req.metadata), &dep, req.status)?;
    Ok(ApiResponse::ok(plan))
}
