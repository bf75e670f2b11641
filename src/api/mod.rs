//! HTTP API for health, balances, settlements and swaps

use crate::chain::ChainManager;
use crate::config::ApiConfig;
use crate::coordination::SettlementEngine;
use crate::error::{EngineError, EngineResult};
use crate::settlement::CancelSignal;
use crate::swap::{SwapOrchestrator, SwapRequest};
use crate::types::{
    AssetSymbol, ChainKey, FailedLeg, RejectedLeg, SettlementReport, SettlementRequest,
    SubmittedLeg,
};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use uuid::Uuid;

/// Where a settlement job stands
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Running,
    Finished {
        report: Box<SettlementReport>,
    },
    Failed {
        error: String,
        bridged: Vec<SubmittedLeg>,
        failed: Vec<FailedLeg>,
        rejected: Vec<RejectedLeg>,
    },
}

impl JobState {
    fn from_error(error: &EngineError) -> Self {
        let (bridged, failed, rejected) = match error {
            EngineError::PartialCompletion { bridged, failed, .. } => {
                (bridged.clone(), failed.clone(), Vec::new())
            }
            EngineError::InsufficientFeasibleLiquidity { rejected, .. } => {
                (Vec::new(), Vec::new(), rejected.clone())
            }
            _ => (Vec::new(), Vec::new(), Vec::new()),
        };
        JobState::Failed {
            error: error.to_string(),
            bridged,
            failed,
            rejected,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementJob {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub state: JobState,
    #[serde(skip)]
    cancel: CancelSignal,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SettlementEngine>,
    pub swaps: Arc<SwapOrchestrator>,
    pub chain_manager: Arc<ChainManager>,
    pub jobs: Arc<DashMap<Uuid, SettlementJob>>,
    job_retention: Duration,
}

impl AppState {
    pub fn new(
        engine: Arc<SettlementEngine>,
        swaps: Arc<SwapOrchestrator>,
        chain_manager: Arc<ChainManager>,
    ) -> Self {
        Self {
            engine,
            swaps,
            chain_manager,
            jobs: Arc::new(DashMap::new()),
            job_retention: Duration::from_secs(3_600),
        }
    }

    pub fn with_job_retention(mut self, retention: Duration) -> Self {
        self.job_retention = retention;
        self
    }

    /// Drop jobs that finished more than the retention period before `now`.
    /// Running jobs are always kept.
    pub fn prune_jobs(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.job_retention)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let before = self.jobs.len();
        self.jobs.retain(|_, job| match job.finished_at {
            Some(finished_at) => now.signed_duration_since(finished_at) < retention,
            None => true,
        });
        let pruned = before.saturating_sub(self.jobs.len());
        if pruned > 0 {
            debug!("Pruned {} finished settlement job(s)", pruned);
        }
        pruned
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/balances/:asset", get(get_balances))
        .route("/settlements", post(create_settlement))
        .route(
            "/settlements/:id",
            get(get_settlement).delete(cancel_settlement),
        )
        .route("/swaps/quote", post(quote_swap))
        .route("/swaps", post(execute_swap))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> EngineResult<()> {
    let app = router(state.clone());

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| EngineError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
    let pruner = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            state.prune_jobs(Utc::now());
        }
    });
    let served = axum::serve(listener, app)
        .await
        .map_err(|e| EngineError::Internal(format!("API server error: {}", e)));
    pruner.abort();
    served?;

    Ok(())
}

/// Engine errors rendered as JSON with a status matching their class
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::InvalidAmount(_)
            | EngineError::UnknownVault(_)
            | EngineError::UnsupportedAsset { .. } => StatusCode::BAD_REQUEST,
            EngineError::InsufficientTotalBalance { .. }
            | EngineError::InsufficientFeasibleLiquidity { .. }
            | EngineError::BridgeAmountTooLow { .. }
            | EngineError::BridgeRouteUnsupported { .. }
            | EngineError::SimulationReverted { .. }
            | EngineError::InsufficientBalance { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::SwapApi { .. } | EngineError::BridgeQuote { .. } | EngineError::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - every configured chain answers
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let chain_health = state.chain_manager.health_check().await;
    let ready = chain_health.iter().all(|(_, healthy)| *healthy);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            details: chain_health
                .into_iter()
                .map(|(chain, healthy)| ChainHealth { chain, healthy })
                .collect(),
        }),
    )
}

async fn get_balances(
    State(state): State<AppState>,
    Path(asset): Path<AssetSymbol>,
) -> impl IntoResponse {
    let table = state.engine.balances(asset).await;
    Json(BalancesResponse {
        asset,
        account: format!("{:?}", state.engine.account()),
        total: asset.format_amount(table.total()),
        balances: table
            .balances
            .iter()
            .map(|b| ChainAmount {
                chain: b.chain,
                amount: asset.format_amount(b.amount),
            })
            .collect(),
    })
}

/// Start a settlement in the background and hand back its id
async fn create_settlement(
    State(state): State<AppState>,
    Json(request): Json<SettlementRequest>,
) -> impl IntoResponse {
    let id = Uuid::new_v4();
    let cancel = CancelSignal::new();
    state.jobs.insert(
        id,
        SettlementJob {
            id,
            created_at: Utc::now(),
            finished_at: None,
            state: JobState::Running,
            cancel: cancel.clone(),
        },
    );

    let engine = state.engine.clone();
    let jobs = state.jobs.clone();
    tokio::spawn(async move {
        let outcome = match engine.settle(id, request, &cancel).await {
            Ok(report) => JobState::Finished {
                report: Box::new(report),
            },
            Err(e) => JobState::from_error(&e),
        };
        if let Some(mut job) = jobs.get_mut(&id) {
            job.state = outcome;
            job.finished_at = Some(Utc::now());
        }
    });

    (StatusCode::ACCEPTED, Json(CreatedResponse { id }))
}

async fn get_settlement(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SettlementJob>, StatusCode> {
    state
        .jobs
        .get(&id)
        .map(|job| Json(job.value().clone()))
        .ok_or(StatusCode::NOT_FOUND)
}

/// Stop waiting for arrival; submitted transactions are not affected
async fn cancel_settlement(State(state): State<AppState>, Path(id): Path<Uuid>) -> StatusCode {
    match state.jobs.get(&id) {
        Some(job) => {
            job.cancel.cancel();
            info!("Cancellation requested for settlement {}", id);
            StatusCode::ACCEPTED
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn quote_swap(
    State(state): State<AppState>,
    Json(request): Json<SwapRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.swaps.get_quote(&request).await?))
}

async fn execute_swap(
    State(state): State<AppState>,
    Json(request): Json<SwapRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.swaps.execute(&request).await?))
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain: ChainKey,
    healthy: bool,
}

#[derive(Serialize)]
struct ChainAmount {
    chain: ChainKey,
    amount: String,
}

#[derive(Serialize)]
struct BalancesResponse {
    asset: AssetSymbol,
    account: String,
    total: String,
    balances: Vec<ChainAmount>,
}

#[derive(Serialize)]
struct CreatedResponse {
    id: Uuid,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_settings;
    use crate::swap::client::MockSwapApi;
    use crate::testing::{FakeChain, FakeQuotes};
    use crate::types::AssetLocation;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use ethers::types::U256;
    use tower::ServiceExt;

    fn app() -> (Arc<FakeChain>, AppState) {
        let settings = Arc::new(sample_settings());
        let chain = Arc::new(FakeChain::new(settings.clone()));
        let engine = Arc::new(SettlementEngine::new(
            settings.clone(),
            chain.clone(),
            chain.clone(),
            Arc::new(FakeQuotes::new(U256::zero(), U256::zero())),
        ));
        let swaps = Arc::new(SwapOrchestrator::new(
            Arc::new(MockSwapApi::new()),
            chain.clone(),
            chain.clone(),
            settings.clone(),
        ));
        let chain_manager = Arc::new(ChainManager::new(&settings).unwrap());
        (chain, AppState::new(engine, swaps, chain_manager))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_balances_are_formatted_per_chain() {
        let (chain, state) = app();
        chain.set_balance(
            ChainKey::Base,
            AssetLocation::Native,
            chain.account(),
            AssetSymbol::Eth.parse_amount("1.5").unwrap(),
        );

        let response = router(state)
            .oneshot(Request::get("/balances/eth").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["asset"], "eth");
        assert_eq!(body["total"], "1.500000000000000000");
        assert_eq!(body["balances"].as_array().unwrap().len(), 3);
    }

    fn job(finished_at: Option<DateTime<Utc>>) -> SettlementJob {
        SettlementJob {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            finished_at,
            state: JobState::Running,
            cancel: CancelSignal::new(),
        }
    }

    #[tokio::test]
    async fn test_finished_jobs_are_pruned_after_retention() {
        let (_, state) = app();
        let state = state.with_job_retention(Duration::from_secs(60));
        let now = Utc::now();

        let running = job(None);
        let recent = job(Some(now - chrono::Duration::seconds(10)));
        let stale = job(Some(now - chrono::Duration::seconds(120)));
        let ids = (running.id, recent.id, stale.id);
        for job in [running, recent, stale] {
            state.jobs.insert(job.id, job);
        }

        assert_eq!(state.prune_jobs(now), 1);
        assert!(state.jobs.contains_key(&ids.0));
        assert!(state.jobs.contains_key(&ids.1));
        assert!(!state.jobs.contains_key(&ids.2));
    }

    #[tokio::test]
    async fn test_unknown_settlement_is_not_found() {
        let (_, state) = app();
        let uri = format!("/settlements/{}", Uuid::new_v4());

        let response = router(state.clone())
            .oneshot(Request::get(uri.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = router(state)
            .oneshot(Request::delete(uri.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_settlement_is_accepted_and_tracked() {
        let (_, state) = app();
        let request = serde_json::json!({
            "kind": "withdraw",
            "to": "0x5555555555555555555555555555555555555555",
            "asset": "usdc",
            "amount": {"exact": "10"}
        });

        let response = router(state.clone())
            .oneshot(
                Request::post("/settlements")
                    .header("content-type", "application/json")
                    .body(Body::from(request.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let id: Uuid = serde_json::from_value(body_json(response).await["id"].clone()).unwrap();
        assert!(state.jobs.contains_key(&id));
    }

    #[tokio::test]
    async fn test_swap_errors_map_to_client_status() {
        let (_, state) = app();
        let request = serde_json::json!({
            "chain": "arbitrum",
            "input": "usdc",
            "output": "usdc",
            "amount": "1"
        });

        let response = router(state)
            .oneshot(
                Request::post("/swaps/quote")
                    .header("content-type", "application/json")
                    .body(Body::from(request.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_partial_completion_keeps_leg_detail() {
        let error = EngineError::PartialCompletion {
            bridged: Vec::new(),
            failed: vec![FailedLeg {
                leg: crate::types::BridgeLeg {
                    source_chain: ChainKey::Optimism,
                    asset: AssetSymbol::Usdc,
                    amount: U256::from(5),
                },
                error: "reverted".to_string(),
                unwound: None,
            }],
            source: Box::new(EngineError::Internal("reverted".to_string())),
        };
        match JobState::from_error(&error) {
            JobState::Failed { failed, error, .. } => {
                assert_eq!(failed.len(), 1);
                assert_eq!(error, "Internal error: reverted");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
