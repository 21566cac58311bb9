//! Workflow triggers: reconcile, request, approve, cancel.
//!
//! Reconciliation and operations run as background tasks; these handlers
//! start them or deliver signals to them and answer right away.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use armada_state::*;
use armada_workflow::ReconcileOutcome;

use crate::error::{ApiError, ApiResult};
use crate::{ApiResponse, ApiState};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReconcileQuery {
    /// Block until the pass finishes and return its outcome.
    pub wait: bool,
}

/// Reconcile answer: the outcome when waited for, otherwise an acknowledgement.
#[derive(Debug, Serialize)]
pub struct ReconcileStatus {
    pub plan_id: String,
    pub deployment_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ReconcileOutcome>,
}

#[derive(Debug, Deserialize)]
pub struct OperationRequest {
    #[serde(rename = "type")]
    pub op_type: OperationType,
    /// Idempotency key; a fresh one is generated when absent.
    #[serde(default)]
    pub intent_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CancelQuery {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelledDeployment {
    pub deployment_id: String,
    pub cancelled_operations: usize,
}

/// POST /api/v1/deployment-plans/{id}/deployments/{dep}/reconcile[?wait=true]
pub async fn reconcile_deployment(
    State(state): State<ApiState>,
    Path((plan_id, deployment_id)): Path<(String, String)>,
    Query(query): Query<ReconcileQuery>,
) -> ApiResult<(StatusCode, Json<ApiResponse<ReconcileStatus>>)> {
    let plan = state.store.deployment_plans().get(&plan_id)?;
    if plan.deployment(&deployment_id).is_none() {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("deployment not found: {deployment_id}"),
        ));
    }

    if query.wait {
        let outcome = state
            .orchestrator
            .reconcile_deployment(&plan_id, &deployment_id)
            .await?;
        let status = ReconcileStatus {
            plan_id,
            deployment_id,
            outcome: Some(outcome),
        };
        return Ok((StatusCode::OK, ApiResponse::ok(status)));
    }

    let orch = state.orchestrator.clone();
    let (plan_ref, dep_ref) = (plan_id.clone(), deployment_id.clone());
    tokio::spawn(async move {
        match orch.reconcile_deployment(&plan_ref, &dep_ref).await {
            Ok(outcome) => info!(deployment = %dep_ref, completed = outcome.completed, "background reconciliation finished"),
            Err(e) => error!(deployment = %dep_ref, error = %e, "background reconciliation failed"),
        }
    });

    let status = ReconcileStatus {
        plan_id,
        deployment_id,
        outcome: None,
    };
    Ok((StatusCode::ACCEPTED, ApiResponse::ok(status)))
}

/// POST /api/v1/deployment-plans/{id}/deployments/{dep}/cancel
pub async fn cancel_deployment(
    State(state): State<ApiState>,
    Path((plan_id, deployment_id)): Path<(String, String)>,
) -> ApiResult<Json<ApiResponse<CancelledDeployment>>> {
    let cancelled_operations = state
        .orchestrator
        .cancel_deployment(&plan_id, &deployment_id)
        .await?;
    Ok(ApiResponse::ok(CancelledDeployment {
        deployment_id,
        cancelled_operations,
    }))
}

/// POST /api/v1/meta-instances/{id}/requests
pub async fn request_operation(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<OperationRequest>,
) -> ApiResult<(StatusCode, Json<ApiResponse<Operation>>)> {
    let intent_id = req
        .intent_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let op = state
        .orchestrator
        .request_operation(&id, req.op_type, &intent_id)
        .await?;
    Ok((StatusCode::ACCEPTED, ApiResponse::ok(op)))
}

/// POST /api/v1/meta-instances/{id}/operations/{op}/approve
pub async fn approve_operation(
    State(state): State<ApiState>,
    Path((id, op)): Path<(String, String)>,
) -> ApiResult<Json<ApiResponse<MetaInstance>>> {
    let meta = state.orchestrator.approve_operation(&id, &op).await?;
    Ok(ApiResponse::ok(meta))
}

/// POST /api/v1/meta-instances/{id}/operations/{op}/cancel[?reason=...]
pub async fn cancel_operation(
    State(state): State<ApiState>,
    Path((id, op)): Path<(String, String)>,
    Query(query): Query<CancelQuery>,
) -> ApiResult<Json<ApiResponse<MetaInstance>>> {
    let reason = query
        .reason
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "cancelled by operator".to_string());
    let meta = state
        .orchestrator
        .cancel_operation(&id, &op, &reason)
        .await?;
    Ok(ApiResponse::ok(meta))
}

/// GET /api/v1/approvals
pub async fn list_pending_approvals(State(state): State<ApiState>) -> ApiResult<Json<ApiResponse<Vec<PendingSignal>>>> {
    Ok(ApiResponse::ok(state.orchestrator.pending_approvals()?))
}
