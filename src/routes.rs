use std::sync::Arc;

use axum::{
    extract::{MatchedPath, Path, Request, State},
    http::{Method, StatusCode},
    routing::{get, post},
    Json,
    Router,
};
use data_model::{ControlAck, HostState, InvocationRequest};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;

use crate::{
    dispatcher::FunctionDispatcher,
    http_objects::{
        AckStatus,
        AssignmentRequest,
        ControlResponse,
        DrainStatusResponse,
        FuncHostAPIError,
        HostStatusResponse,
        InvokeResponse,
        WorkerChannel,
        WorkerPool,
    },
    lifecycle::LifecycleOrchestrator,
};

#[derive(OpenApi)]
#[openapi(
        paths(
            host_status,
            restart_host,
            drain_host,
            drain_status,
            resume_host,
            assign_instance,
            worker_pools,
            worker_pool,
            worker_channels,
            invoke_function,
        ),
        components(
            schemas(
                FuncHostAPIError,
                AckStatus,
                ControlResponse,
                HostStatusResponse,
                DrainStatusResponse,
                AssignmentRequest,
                WorkerChannel,
                WorkerPool,
                InvokeResponse,
            )
        ),
        tags(
            (name = "funchost", description = "Function host admin API")
        )
    )]
struct ApiDoc;

#[derive(Clone)]
pub struct RouteState {
    pub orchestrator: Arc<LifecycleOrchestrator>,
    pub dispatcher: Arc<FunctionDispatcher>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route("/docs/openapi.json", get(openapi))
        .route("/healthz", get(healthz).with_state(route_state.clone()))
        .route(
            "/admin/host/status",
            get(host_status).with_state(route_state.clone()),
        )
        .route(
            "/admin/host/restart",
            post(restart_host).with_state(route_state.clone()),
        )
        .route(
            "/admin/host/drain",
            post(drain_host).with_state(route_state.clone()),
        )
        .route(
            "/admin/host/drain/status",
            get(drain_status).with_state(route_state.clone()),
        )
        .route(
            "/admin/host/resume",
            post(resume_host).with_state(route_state.clone()),
        )
        .route(
            "/admin/instance/assign",
            post(assign_instance).with_state(route_state.clone()),
        )
        .route(
            "/admin/host/workers",
            get(worker_pools).with_state(route_state.clone()),
        )
        .route(
            "/admin/host/workers/{language}",
            get(worker_pool).with_state(route_state.clone()),
        )
        .route(
            "/admin/host/workers/{language}/channels",
            get(worker_channels).with_state(route_state.clone()),
        )
        .route(
            "/admin/functions/{name}",
            post(invoke_function).with_state(route_state.clone()),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    let method = req.method();
                    let uri = req.uri();

                    let matched_path = req
                        .extensions()
                        .get::<MatchedPath>()
                        .map(|matched_path| matched_path.as_str());

                    tracing::debug_span!("request", %method, %uri, matched_path)
                })
                .on_failure(()),
        )
        .layer(cors)
}

async fn index() -> &'static str {
    "Function Host"
}

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

fn control_response(ack: ControlAck) -> (StatusCode, Json<ControlResponse>) {
    let code = match &ack {
        ControlAck::Accepted => StatusCode::ACCEPTED,
        ControlAck::AlreadyInProgress => StatusCode::OK,
        ControlAck::Rejected { .. } => StatusCode::CONFLICT,
    };
    (code, Json(ack.into()))
}

async fn healthz(State(state): State<RouteState>) -> (StatusCode, &'static str) {
    match state.orchestrator.state() {
        HostState::Error => (StatusCode::SERVICE_UNAVAILABLE, "error"),
        HostState::Offline => (StatusCode::SERVICE_UNAVAILABLE, "offline"),
        _ => (StatusCode::OK, "ok"),
    }
}

/// Current host state, mode and functions
#[utoipa::path(
    get,
    path = "/admin/host/status",
    tag = "operations",
    responses(
        (status = 200, description = "Host status", body = HostStatusResponse),
    ),
)]
async fn host_status(State(state): State<RouteState>) -> Json<HostStatusResponse> {
    Json(state.orchestrator.status().await.into())
}

/// Rebuild the host and restart every worker pool
#[utoipa::path(
    post,
    path = "/admin/host/restart",
    tag = "operations",
    responses(
        (status = 202, description = "Restart accepted", body = ControlResponse),
        (status = 200, description = "Restart already in progress", body = ControlResponse),
        (status = CONFLICT, description = "Host cannot restart in its current state", body = ControlResponse)
    ),
)]
async fn restart_host(State(state): State<RouteState>) -> (StatusCode, Json<ControlResponse>) {
    control_response(state.orchestrator.request_restart())
}

/// Stop admitting new drain-aware invocations
#[utoipa::path(
    post,
    path = "/admin/host/drain",
    tag = "operations",
    responses(
        (status = 202, description = "Drain accepted", body = ControlResponse),
        (status = 200, description = "Drain already in progress", body = ControlResponse),
        (status = CONFLICT, description = "Host cannot drain in its current state", body = ControlResponse)
    ),
)]
async fn drain_host(State(state): State<RouteState>) -> (StatusCode, Json<ControlResponse>) {
    control_response(state.orchestrator.request_drain())
}

/// Drain mode state
#[utoipa::path(
    get,
    path = "/admin/host/drain/status",
    tag = "operations",
    responses(
        (status = 200, description = "Drain state", body = DrainStatusResponse),
    ),
)]
async fn drain_status(State(state): State<RouteState>) -> Json<DrainStatusResponse> {
    Json(DrainStatusResponse {
        state: state.orchestrator.drain_state().to_string(),
    })
}

/// Lift drain mode and put the host back in service
#[utoipa::path(
    post,
    path = "/admin/host/resume",
    tag = "operations",
    responses(
        (status = 202, description = "Resumed", body = ControlResponse),
        (status = CONFLICT, description = "Drain still in progress", body = ControlResponse)
    ),
)]
async fn resume_host(State(state): State<RouteState>) -> (StatusCode, Json<ControlResponse>) {
    control_response(state.orchestrator.request_resume())
}

/// Assign a standby instance to a customer runtime
#[utoipa::path(
    post,
    path = "/admin/instance/assign",
    request_body = AssignmentRequest,
    tag = "operations",
    responses(
        (status = 202, description = "Specialization accepted", body = ControlResponse),
        (status = 200, description = "Already specialized or specializing", body = ControlResponse),
        (status = CONFLICT, description = "Instance cannot be assigned", body = ControlResponse)
    ),
)]
async fn assign_instance(
    State(state): State<RouteState>,
    Json(request): Json<AssignmentRequest>,
) -> Result<(StatusCode, Json<ControlResponse>), FuncHostAPIError> {
    if request.worker_runtime.is_empty() {
        return Err(FuncHostAPIError::bad_request("worker_runtime is required"));
    }
    Ok(control_response(
        state.orchestrator.request_specialization(request.into()),
    ))
}

/// Every worker pool, by language
#[utoipa::path(
    get,
    path = "/admin/host/workers",
    tag = "operations",
    responses(
        (status = 200, description = "Worker pool snapshots", body = Vec<WorkerPool>),
    ),
)]
async fn worker_pools(State(state): State<RouteState>) -> Json<Vec<WorkerPool>> {
    let pools = state.orchestrator.worker_pool_snapshots().await;
    Json(pools.into_iter().map(Into::into).collect())
}

/// Worker pool of one language
#[utoipa::path(
    get,
    path = "/admin/host/workers/{language}",
    tag = "operations",
    responses(
        (status = 200, description = "Worker pool snapshot", body = WorkerPool),
        (status = NOT_FOUND, description = "No pool for this language")
    ),
)]
async fn worker_pool(
    Path(language): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<WorkerPool>, FuncHostAPIError> {
    let snapshot = state
        .orchestrator
        .worker_pool_snapshot(&language)
        .await
        .ok_or_else(|| FuncHostAPIError::not_found(&format!("no worker pool for {}", language)))?;
    Ok(Json(snapshot.into()))
}

/// Worker channels of one language, oldest first
#[utoipa::path(
    get,
    path = "/admin/host/workers/{language}/channels",
    tag = "operations",
    responses(
        (status = 200, description = "Worker channels", body = Vec<WorkerChannel>),
    ),
)]
async fn worker_channels(
    Path(language): Path<String>,
    State(state): State<RouteState>,
) -> Json<Vec<WorkerChannel>> {
    let channels = state.orchestrator.worker_channels(&language).await;
    Json(channels.into_iter().map(Into::into).collect())
}

/// Invoke one function through the dispatcher
#[utoipa::path(
    post,
    path = "/admin/functions/{name}",
    tag = "operations",
    responses(
        (status = 200, description = "Invocation result", body = InvokeResponse),
        (status = NOT_FOUND, description = "Function not found"),
        (status = SERVICE_UNAVAILABLE, description = "Host unavailable or draining")
    ),
)]
async fn invoke_function(
    Path(name): Path<String>,
    State(state): State<RouteState>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<InvokeResponse>, FuncHostAPIError> {
    let result = state
        .dispatcher
        .dispatch(InvocationRequest::new(&name, payload))
        .await?;
    Ok(Json(result.into()))
}
