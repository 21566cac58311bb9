//! armada-api: HTTP/JSON surface of the Armada control plane.
//!
//! One route per ledger operation (instantiated for every resource kind), one
//! per meta-instance and deployment mutator, and the workflow triggers.
//!
//! # API Routes
//!
//! `{kind}` is one of `clusters`, `compute-capabilities`, `nodes`,
//! `deployment-plans`, `meta-instances`.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/{kind}` | List with filters |
//! | POST | `/api/v1/{kind}` | Create |
//! | GET | `/api/v1/{kind}/{id}` | Get by id |
//! | GET | `/api/v1/{kind}/by-name/{name}` | Get by name |
//! | PUT | `/api/v1/{kind}/{id}/status` | Update status |
//! | DELETE | `/api/v1/{kind}/{id}?version=N` | Soft-delete |
//! | POST | `/api/v1/meta-instances/{id}/runtime-instances` | Add runtime instance |
//! | PUT | `/api/v1/meta-instances/{id}/runtime-instances/{rt}/status` | Update runtime status |
//! | PUT | `/api/v1/meta-instances/{id}/runtime-instances/{rt}/active` | Update active state |
//! | DELETE | `/api/v1/meta-instances/{id}/runtime-instances/{rt}?version=N` | Remove runtime instance |
//! | POST | `/api/v1/meta-instances/{id}/operations` | Add operation |
//! | PUT | `/api/v1/meta-instances/{id}/operations/{op}/status` | Update operation status |
//! | DELETE | `/api/v1/meta-instances/{id}/operations/{op}?version=N` | Remove operation |
//! | POST | `/api/v1/meta-instances/{id}/requests` | Request an operation (workflow) |
//! | POST | `/api/v1/meta-instances/{id}/operations/{op}/approve` | Approve |
//! | POST | `/api/v1/meta-instances/{id}/operations/{op}/cancel` | Cancel |
//! | POST | `/api/v1/deployment-plans/{id}/deployments` | Add deployment |
//! | PUT | `/api/v1/deployment-plans/{id}/deployments/{dep}/status` | Update deployment status |
//! | POST | `/api/v1/deployment-plans/{id}/deployments/{dep}/reconcile` | Reconcile |
//! | POST | `/api/v1/deployment-plans/{id}/deployments/{dep}/cancel` | Cancel deployment |
//! | GET | `/api/v1/approvals` | Operations awaiting approval |

pub mod error;
pub mod handlers;
pub mod workflow_handlers;

use axum::Json;
use axum::Router;
use axum::routing::{get, post, put};

use armada_state::*;
use armada_workflow::Orchestrator;

pub use error::{ApiError, ApiResult};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub orchestrator: Orchestrator,
}

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub struct ApiResponse<T: serde::Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

/// The five ledger routes, for one resource kind.
fn ledger_routes<R: LedgerRecord>() -> Router<ApiState> {
    Router::new()
        .route("/", get(handlers::list_records::<R>).post(handlers::create_record::<R>))
        .route("/{id}", get(handlers::get_record::<R>).delete(handlers::delete_record::<R>))
        .route("/by-name/{name}", get(handlers::get_record_by_name::<R>))
        .route("/{id}/status", put(handlers::update_record_status::<R>))
}

fn meta_instance_routes() -> Router<ApiState> {
    ledger_routes::<MetaInstance>()
        .route("/{id}/runtime-instances", post(handlers::add_runtime_instance))
        .route(
            "/{id}/runtime-instances/{rt}",
            axum::routing::delete(handlers::remove_runtime_instance),
        )
        .route("/{id}/runtime-instances/{rt}/status", put(handlers::update_runtime_status))
        .route("/{id}/runtime-instances/{rt}/active", put(handlers::update_runtime_active_state))
        .route("/{id}/operations", post(handlers::add_operation))
        .route("/{id}/operations/{op}", axum::routing::delete(handlers::remove_operation))
        .route("/{id}/operations/{op}/status", put(handlers::update_operation_status))
        .route("/{id}/operations/{op}/approve", post(workflow_handlers::approve_operation))
        .route("/{id}/operations/{op}/cancel", post(workflow_handlers::cancel_operation))
        .route("/{id}/requests", post(workflow_handlers::request_operation))
}

fn deployment_plan_routes() -> Router<ApiState> {
    ledger_routes::<DeploymentPlan>()
        .route("/{id}/deployments", post(handlers::add_deployment))
        .route("/{id}/deployments/{dep}/status", put(handlers::update_deployment_status))
        .route("/{id}/deployments/{dep}/reconcile", post(workflow_handlers::reconcile_deployment))
        .route("/{id}/deployments/{dep}/cancel", post(workflow_handlers::cancel_deployment))
}

/// Build the complete API router.
pub fn build_router(orchestrator: Orchestrator) -> Router {
    let api_state = ApiState {
        store: orchestrator.state().clone(),
        orchestrator,
    };

    let api_routes = Router::new()
        .nest("/clusters", ledger_routes::<Cluster>())
        .nest("/compute-capabilities", ledger_routes::<ComputeCapability>())
        .nest("/nodes", ledger_routes::<Node>())
        .nest("/deployment-plans", deployment_plan_routes())
        .nest("/meta-instances", meta_instance_routes())
        .route("/approvals", get(workflow_handlers::list_pending_approvals))
        .with_state(api_state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(|| async { "ok" }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use armada_scheduler::{Scheduler, SchedulerConfig};
    use armada_workflow::{InMemoryRuntime, WorkflowConfig};

    use super::*;

    fn router() -> (Router, StateStore) {
        let store = StateStore::open_in_memory().unwrap();
        let orch = Orchestrator::new(
            store.clone(),
            Scheduler::new(store.clone(), SchedulerConfig::default()),
            Arc::new(InMemoryRuntime::new()),
            &WorkflowConfig::default(),
        );
        (build_router(orch), store)
    }

    async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&v).unwrap())
            }
            None => Body::empty(),
        };
        let resp = router.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn cluster_crud_round() {
        let (router, _) = router();

        let (status, body) = call(&router, Method::POST, "/api/v1/clusters", Some(json!({"name": "east"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["data"]["metadata"]["id"].as_str().unwrap().to_string();
        assert_eq!(body["data"]["metadata"]["version"], 1);

        let (status, _) = call(&router, Method::POST, "/api/v1/clusters", Some(json!({"name": "east"}))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(&router, Method::GET, "/api/v1/clusters/by-name/east", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["metadata"]["id"], id.as_str());

        let update = json!({"metadata": {"id": id, "version": 1}, "status": {"state": "INACTIVE", "message": "drain"}});
        let (status, body) = call(&router, Method::PUT, &format!("/api/v1/clusters/{id}/status"), Some(update.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["metadata"]["version"], 2);

        // Same version again: stale.
        let (status, body) = call(&router, Method::PUT, &format!("/api/v1/clusters/{id}/status"), Some(update)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);

        let (status, _) = call(&router, Method::DELETE, &format!("/api/v1/clusters/{id}?version=2"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&router, Method::GET, "/api/v1/clusters/by-name/east", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_applies_query_filters() {
        let (router, store) = router();
        for name in ["n1", "n2", "n3"] {
            let cluster = if name == "n3" { "c2" } else { "c1" };
            store
                .nodes()
                .create(Node::new(name, cluster, Resources::new(4, 4096), Resources::ZERO))
                .unwrap();
        }

        let (status, body) = call(&router, Method::GET, "/api/v1/nodes?fields=cluster_id:c1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 2);

        let (_, body) = call(&router, Method::GET, "/api/v1/nodes?limit=1", None).await;
        assert_eq!(body["data"][0]["name"], "n1");
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (status, _) = call(&router, Method::GET, "/api/v1/nodes?states=bogus", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn premature_approval_is_unprocessable() {
        let (router, store) = router();
        let plan = store.deployment_plans().create(DeploymentPlan::new("web", "prod")).unwrap();
        let meta = store
            .meta_instances()
            .create(MetaInstance::new("web-0", plan.metadata.id.as_str()))
            .unwrap();
        let id = meta.metadata.id.clone();

        let add = json!({
            "metadata": {"id": id, "version": 1},
            "operation": {"id": "op-1", "type": "UPDATE", "intent_id": "user-1"}
        });
        let (status, body) = call(&router, Method::POST, &format!("/api/v1/meta-instances/{id}/operations"), Some(add)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["operations"][0]["status"]["state"], "PREPARING");

        let approve = json!({"metadata": {"id": id, "version": 2}, "status": {"state": "APPROVED"}});
        let (status, _) = call(
            &router,
            Method::PUT,
            &format!("/api/v1/meta-instances/{id}/operations/op-1/status"),
            Some(approve),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            store.meta_instances().get(&id).unwrap().operations[0].status.state,
            OperationState::Preparing
        );
    }

    #[tokio::test]
    async fn unknown_deployment_cannot_be_reconciled() {
        let (router, store) = router();
        let plan = store.deployment_plans().create(DeploymentPlan::new("web", "prod")).unwrap();
        let uri = format!("/api/v1/deployment-plans/{}/deployments/nope/reconcile", plan.metadata.id);

        let (status, _) = call(&router, Method::POST, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
