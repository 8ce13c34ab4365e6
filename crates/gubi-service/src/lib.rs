#![deny(unsafe_code)]

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use gubi_adapters::{FileDocumentStore, FileStoreError};
use gubi_core::{
    AccountKind, DocumentStore, Income, LedgerEngine, LedgerEngineConfig, LedgerError, LineItem,
    PendingCompensation, PeriodToken, Plan, ReconcileReport, RetryPolicy, StoreConfig, StoreError,
    Subscription, Transaction, UserBalance,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Where the service keeps its documents.
#[derive(Debug, Clone)]
pub enum StoreBackend {
    Ledger(StoreConfig),
    File(PathBuf),
}

impl StoreBackend {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ledger(config) => config.label(),
            Self::File(_) => "file",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub store: StoreBackend,
    pub retry: RetryPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            store: StoreBackend::Ledger(StoreConfig::Memory),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<LedgerEngine>,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let ServiceConfig { store, retry } = config;
        let engine = match store {
            StoreBackend::Ledger(store) => {
                LedgerEngine::bootstrap(LedgerEngineConfig { store, retry }).await?
            }
            StoreBackend::File(path) => {
                let store = FileDocumentStore::load(path)?;
                LedgerEngine::with_store(Arc::new(store), retry)
            }
        };

        Ok(Self {
            engine: Arc::new(engine),
        })
    }

    pub fn from_store(store: Arc<dyn DocumentStore>, retry: RetryPolicy) -> Self {
        Self {
            engine: Arc::new(LedgerEngine::with_store(store, retry)),
        }
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/transfers", post(create_transfer))
        .route("/v1/transactions", get(transaction_history))
        .route("/v1/transactions/unprocessed", get(unprocessed_transactions))
        .route("/v1/balances/:id", get(get_balance))
        .route("/v1/accounts", post(open_account))
        .route("/v1/accounts/:id", delete(close_account))
        .route("/v1/income", post(publish_income))
        .route("/v1/income/indexer-due", get(indexer_due))
        .route("/v1/income/:id/credit", post(credit_income))
        .route("/v1/plans", get(list_plans))
        .route("/v1/plans/:owner", put(save_plan))
        .route("/v1/plans/by-id/:id", delete(delete_plan))
        .route("/v1/subscriptions", post(subscribe).get(list_subscriptions))
        .route("/v1/subscriptions/sweep", post(sweep_subscriptions))
        .route("/v1/compensations/pending", get(pending_compensations))
        .route("/v1/compensations/reconcile", post(reconcile_compensations))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("ledger store error: {0}")]
    Store(#[from] StoreError),
    #[error("document file error: {0}")]
    File(#[from] FileStoreError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::Unavailable(_) | StoreError::Timeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
        StoreError::Conflict { .. } => StatusCode::CONFLICT,
        StoreError::ReservedId { .. } => StatusCode::BAD_REQUEST,
        StoreError::Serialization(_) | StoreError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn ledger_status(err: &LedgerError) -> StatusCode {
    match err {
        LedgerError::InsufficientFunds { .. } => StatusCode::CONFLICT,
        LedgerError::Store(store) => store_status(store),
        LedgerError::RolledBack { .. } => StatusCode::SERVICE_UNAVAILABLE,
        LedgerError::CompensationFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        other if other.is_not_found() => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => {
                (status, Json(serde_json::json!({ "error": message }))).into_response()
            }
            ApiError::Ledger(err) => {
                let status = ledger_status(&err);
                let body = match &err {
                    LedgerError::CompensationFailed { pending_id, .. } => serde_json::json!({
                        "error": err.to_string(),
                        "pending_id": pending_id,
                    }),
                    _ => serde_json::json!({ "error": err.to_string() }),
                };
                (status, Json(body)).into_response()
            }
            ApiError::Store(err) => (
                store_status(&err),
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    store_backend: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "gubi-service",
        store_backend: state.engine.backend_label(),
    })
}

#[derive(Debug, Clone, Deserialize)]
struct LineItemInput {
    #[serde(default)]
    id: Option<String>,
    name: String,
    price: i64,
    #[serde(alias = "amount")]
    quantity: i64,
}

impl From<LineItemInput> for LineItem {
    fn from(input: LineItemInput) -> Self {
        let item = LineItem::new(input.name, input.price, input.quantity);
        match input.id {
            Some(id) => item.with_id(id),
            None => item,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TransferRequest {
    sender_id: String,
    receiver_id: String,
    line_items: Vec<LineItemInput>,
}

async fn create_transfer(
    State(state): State<ServiceState>,
    Json(request): Json<TransferRequest>,
) -> Result<Json<Transaction>, ApiError> {
    let items = request.line_items.into_iter().map(LineItem::from).collect();
    let tx = state
        .engine
        .transfers()
        .transfer(&request.sender_id, &request.receiver_id, items, Utc::now())
        .await?;
    Ok(Json(tx))
}

#[derive(Debug, Clone, Deserialize)]
struct HistoryQuery {
    identity: String,
}

async fn transaction_history(
    State(state): State<ServiceState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Transaction>>, ApiError> {
    Ok(Json(
        state.engine.recorder().history_for(&query.identity).await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct PeriodQuery {
    period: String,
}

fn parse_period(raw: &str) -> Result<PeriodToken, ApiError> {
    PeriodToken::parse(raw)
        .map_err(|_| ApiError::bad_request(format!("invalid period '{raw}'; expected YYYY/M")))
}

async fn unprocessed_transactions(
    State(state): State<ServiceState>,
    Query(query): Query<PeriodQuery>,
) -> Result<Json<Vec<Transaction>>, ApiError> {
    let period = parse_period(&query.period)?;
    Ok(Json(
        state.engine.recorder().unprocessed_for_period(&period).await?,
    ))
}

async fn get_balance(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<UserBalance>, ApiError> {
    let balance = state
        .engine
        .balance(&id)
        .await?
        .ok_or(LedgerError::BalanceNotFound(id))?;
    Ok(Json(balance))
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAccountRequest {
    identity_id: String,
    kind: AccountKind,
}

#[derive(Debug, Clone, Serialize)]
struct BalanceOutcome {
    balance: UserBalance,
    income_applied: bool,
}

async fn open_account(
    State(state): State<ServiceState>,
    Json(request): Json<OpenAccountRequest>,
) -> Result<Json<BalanceOutcome>, ApiError> {
    let (balance, income_applied) = state
        .engine
        .open_account(&request.identity_id, request.kind, Utc::now())
        .await?;
    Ok(Json(BalanceOutcome {
        balance,
        income_applied,
    }))
}

#[derive(Debug, Clone, Serialize)]
struct CloseOutcome {
    identity_id: String,
    plans_removed: usize,
}

async fn close_account(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<CloseOutcome>, ApiError> {
    let plans_removed = state.engine.close_account(&id).await?;
    Ok(Json(CloseOutcome {
        identity_id: id,
        plans_removed,
    }))
}

async fn credit_income(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<BalanceOutcome>, ApiError> {
    let (balance, income_applied) = state
        .engine
        .income()
        .credit_income_if_due(&id, Utc::now())
        .await?;
    Ok(Json(BalanceOutcome {
        balance,
        income_applied,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct PublishIncomeRequest {
    amount: i64,
    /// Defaults to the current period.
    period: Option<String>,
}

async fn publish_income(
    State(state): State<ServiceState>,
    Json(request): Json<PublishIncomeRequest>,
) -> Result<Json<Income>, ApiError> {
    let period = match request.period.as_deref() {
        Some(raw) => parse_period(raw)?,
        None => PeriodToken::from_datetime(Utc::now()),
    };
    Ok(Json(
        state
            .engine
            .income()
            .publish_income(request.amount, period)
            .await?,
    ))
}

#[derive(Debug, Clone, Serialize)]
struct IndexerDueResponse {
    due: bool,
    next_period: PeriodToken,
}

async fn indexer_due(State(state): State<ServiceState>) -> Result<Json<IndexerDueResponse>, ApiError> {
    let now = Utc::now();
    Ok(Json(IndexerDueResponse {
        due: state.engine.income().indexer_due(now).await?,
        next_period: PeriodToken::from_datetime(now).next(),
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct PlanRequest {
    price: i64,
}

async fn save_plan(
    State(state): State<ServiceState>,
    Path(owner): Path<String>,
    Json(request): Json<PlanRequest>,
) -> Result<Json<Plan>, ApiError> {
    Ok(Json(
        state
            .engine
            .plans()
            .create_or_update(&owner, request.price)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct PlansQuery {
    viewer: Option<String>,
}

async fn list_plans(
    State(state): State<ServiceState>,
    Query(query): Query<PlansQuery>,
) -> Result<Json<Vec<Plan>>, ApiError> {
    let subscriptions = state.engine.subscriptions();
    let plans = match query.viewer.as_deref() {
        Some(viewer) => subscriptions.available_plans(viewer, Utc::now()).await?,
        None => {
            subscriptions.expire_sweep(Utc::now()).await?;
            state.engine.plans().list_plans().await?
        }
    };
    Ok(Json(plans))
}

#[derive(Debug, Clone, Serialize)]
struct DeletedResponse {
    deleted: String,
}

async fn delete_plan(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<DeletedResponse>, ApiError> {
    state.engine.plans().delete_plan(&id).await?;
    Ok(Json(DeletedResponse { deleted: id }))
}

#[derive(Debug, Clone, Deserialize)]
struct SubscribeRequest {
    subscriber_id: String,
    plan_id: String,
}

async fn subscribe(
    State(state): State<ServiceState>,
    Json(request): Json<SubscribeRequest>,
) -> Result<Json<Subscription>, ApiError> {
    Ok(Json(
        state
            .engine
            .subscriptions()
            .subscribe(&request.subscriber_id, &request.plan_id, Utc::now())
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct SubscriptionsQuery {
    user: Option<String>,
    owner: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct SubscriptionsResponse {
    subscriptions: Vec<Subscription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recurring_revenue: Option<i64>,
}

async fn list_subscriptions(
    State(state): State<ServiceState>,
    Query(query): Query<SubscriptionsQuery>,
) -> Result<Json<SubscriptionsResponse>, ApiError> {
    let manager = state.engine.subscriptions();
    let response = match (query.user.as_deref(), query.owner.as_deref()) {
        (Some(user), None) => SubscriptionsResponse {
            subscriptions: manager.subscriptions_of(user).await?,
            recurring_revenue: None,
        },
        (None, Some(owner)) => {
            let subscriptions = manager.subscribers(owner).await?;
            let revenue = subscriptions.iter().map(|s| s.price).sum();
            SubscriptionsResponse {
                subscriptions,
                recurring_revenue: Some(revenue),
            }
        }
        _ => {
            return Err(ApiError::bad_request(
                "exactly one of 'user' or 'owner' is required",
            ))
        }
    };
    Ok(Json(response))
}

#[derive(Debug, Clone, Serialize)]
struct SweepResponse {
    removed: usize,
}

async fn sweep_subscriptions(State(state): State<ServiceState>) -> Result<Json<SweepResponse>, ApiError> {
    let removed = state.engine.subscriptions().expire_sweep(Utc::now()).await?;
    Ok(Json(SweepResponse { removed }))
}

async fn pending_compensations(
    State(state): State<ServiceState>,
) -> Result<Json<Vec<PendingCompensation>>, ApiError> {
    Ok(Json(state.engine.compensations().pending().await?))
}

async fn reconcile_compensations(
    State(state): State<ServiceState>,
) -> Result<Json<ReconcileReport>, ApiError> {
    Ok(Json(state.engine.compensations().reconcile().await?))
}
