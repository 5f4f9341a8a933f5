use std::sync::Arc;

use axum::{
    extract::{MatchedPath, Path, Query, Request, State},
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json,
    Router,
};
use data_model::{Anomaly, InterruptionNotice, PoolId, ProtectedInstance, ProviderInstanceId, SweepReport};
use processor::{
    config::SafetyNetConfig,
    downtime_ledger::{DowntimeLedger, DowntimeReport},
    interruption_handler::{InterruptionHandler, NoticeOutcome},
    inventory::PoolCatalog,
    notice_runner::NoticeRunner,
    pool_risk::{PoolRiskRegistry, PoolStatus},
    sweeper::ReconciliationSweeper,
};
use safety_net_utils::Clock;
use state_store::{
    requests::{RequestPayload, StateMachineUpdateRequest, UpdateOutcome, UpsertInstanceRequest},
    SafetyNetState,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::http_objects::{
    AnomalyQuery,
    DowntimeQuery,
    InstanceView,
    NoticeAccepted,
    PoolQuery,
    RegisterInstance,
    SafetyNetAPIError,
    StatsResponse,
    WorkloadView,
};

#[derive(Clone)]
pub struct RouteState {
    pub state: Arc<SafetyNetState>,
    pub handler: Arc<InterruptionHandler>,
    pub notice_runner: Arc<NoticeRunner<InterruptionHandler>>,
    pub sweeper: Arc<ReconciliationSweeper>,
    pub ledger: Arc<DowntimeLedger>,
    pub registry: Arc<PoolRiskRegistry>,
    pub catalog: Arc<PoolCatalog>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<SafetyNetConfig>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route("/v1/notices", post(enqueue_notice))
        .route("/v1/notices/sync", post(handle_notice))
        .route("/v1/instances", post(register_instance))
        .route("/v1/instances/{instance_id}", get(get_instance))
        .route("/v1/workloads/{workload_id}", get(get_workload))
        .route("/v1/accounts/{account_id}/downtime", get(account_downtime))
        .route("/v1/pools/{pool_id}", get(pool_status))
        .route("/v1/sweeps", post(run_sweep))
        .route("/v1/sweeps/latest", get(latest_sweep))
        .route("/v1/anomalies", get(list_anomalies))
        .route("/v1/stats", get(stats))
        .with_state(route_state)
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
    "Spot Safety Net Server"
}

async fn enqueue_notice(
    State(state): State<RouteState>,
    Json(notice): Json<InterruptionNotice>,
) -> Result<impl IntoResponse, SafetyNetAPIError> {
    state.notice_runner.enqueue(notice)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(NoticeAccepted {
            queued: state.notice_runner.queued(),
        }),
    ))
}

async fn handle_notice(
    State(state): State<RouteState>,
    Json(notice): Json<InterruptionNotice>,
) -> Result<Json<NoticeOutcome>, SafetyNetAPIError> {
    let outcome = state
        .handler
        .handle(&notice)
        .await
        .map_err(SafetyNetAPIError::internal_error)?;
    Ok(Json(outcome))
}

async fn register_instance(
    State(state): State<RouteState>,
    Json(request): Json<RegisterInstance>,
) -> Result<Json<ProtectedInstance>, SafetyNetAPIError> {
    let instance = request
        .into_instance(&state.catalog, state.clock.now_ms())
        .map_err(|e| SafetyNetAPIError::bad_request(&e.to_string()))?;
    let outcome = state
        .state
        .write(StateMachineUpdateRequest::new(RequestPayload::UpsertInstance(
            UpsertInstanceRequest { instance },
        )))
        .await
        .map_err(SafetyNetAPIError::internal_error)?;
    match outcome {
        UpdateOutcome::Upserted(instance) => {
            info!(
                instance_id = ?instance.instance_id,
                pool = instance.pool.to_string(),
                "registered protected instance"
            );
            Ok(Json(instance))
        }
        UpdateOutcome::Conflict(conflict) => Err(SafetyNetAPIError::new(
            StatusCode::CONFLICT,
            &format!("instance cannot be registered: {}", conflict),
        )),
        other => Err(SafetyNetAPIError::internal_error(anyhow::anyhow!(
            "unexpected upsert outcome: {:?}",
            other
        ))),
    }
}

async fn get_instance(
    Path(instance_id): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<InstanceView>, SafetyNetAPIError> {
    let reader = state.state.reader();
    let instance = reader
        .get_instance_by_provider_id(&ProviderInstanceId::new(instance_id.clone()))
        .map_err(SafetyNetAPIError::internal_error)?
        .ok_or(SafetyNetAPIError::not_found(&format!(
            "instance {} not found",
            instance_id
        )))?;
    let replicas = reader
        .replicas_of(&instance.id)
        .map_err(SafetyNetAPIError::internal_error)?;
    Ok(Json(InstanceView { instance, replicas }))
}

async fn get_workload(
    Path(workload_id): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<WorkloadView>, SafetyNetAPIError> {
    let instance = state
        .state
        .reader()
        .instance_serving_workload(&workload_id)
        .map_err(SafetyNetAPIError::internal_error)?
        .ok_or(SafetyNetAPIError::not_found(&format!(
            "workload {} not found",
            workload_id
        )))?;
    Ok(Json(WorkloadView {
        workload_id,
        serving: instance.is_active.then(|| instance.id.clone()),
        instance: Some(instance),
    }))
}

async fn account_downtime(
    Path(account_id): Path<String>,
    Query(query): Query<DowntimeQuery>,
    State(state): State<RouteState>,
) -> Result<Json<DowntimeReport>, SafetyNetAPIError> {
    let report = state
        .ledger
        .query(
            &account_id,
            query.from.unwrap_or(0),
            query.to.unwrap_or(u64::MAX),
        )
        .map_err(|e| SafetyNetAPIError::bad_request(&e.to_string()))?;
    Ok(Json(report))
}

async fn pool_status(
    Path(pool_id): Path<String>,
    Query(query): Query<PoolQuery>,
    State(state): State<RouteState>,
) -> Result<Json<PoolStatus>, SafetyNetAPIError> {
    let pool: PoolId = pool_id
        .parse()
        .map_err(|e: anyhow::Error| SafetyNetAPIError::bad_request(&e.to_string()))?;
    let as_of = query.as_of.unwrap_or_else(|| state.clock.now_ms());
    let status = state
        .registry
        .pool_status(&pool, as_of)
        .map_err(SafetyNetAPIError::internal_error)?;
    Ok(Json(status))
}

async fn run_sweep(State(state): State<RouteState>) -> Result<Json<SweepReport>, SafetyNetAPIError> {
    let report = state
        .sweeper
        .run_once()
        .await
        .map_err(SafetyNetAPIError::internal_error)?;
    Ok(Json(report))
}

async fn latest_sweep(
    State(state): State<RouteState>,
) -> Result<Json<SweepReport>, SafetyNetAPIError> {
    let report = state
        .state
        .reader()
        .latest_sweep_report()
        .map_err(SafetyNetAPIError::internal_error)?
        .ok_or(SafetyNetAPIError::not_found("no sweep has run yet"))?;
    Ok(Json(report))
}

async fn list_anomalies(
    Query(query): Query<AnomalyQuery>,
    State(state): State<RouteState>,
) -> Result<Json<Vec<Anomaly>>, SafetyNetAPIError> {
    let anomalies = state
        .state
        .reader()
        .anomalies(query.limit)
        .map_err(SafetyNetAPIError::internal_error)?;
    Ok(Json(anomalies))
}

async fn stats(State(state): State<RouteState>) -> Result<Json<StatsResponse>, SafetyNetAPIError> {
    let stats = state
        .state
        .reader()
        .stats()
        .map_err(SafetyNetAPIError::internal_error)?;
    Ok(Json(StatsResponse {
        observed_false_alarm_ratio: stats.observed_false_alarm_ratio(),
        configured_false_alarm_ratio: state.config.false_alarm_ratio,
        stats,
    }))
}
