use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use bigdecimal::BigDecimal;
use num_traits::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::handlers::{AccountService, CreateAccountError, TopUpError};
use crate::models::Account;

#[derive(Clone)]
pub struct AppState {
    pub accounts: Arc<AccountService>,
}

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct TopUpRequest {
    pub amount: f64,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub account_id: Uuid,
    pub balance: f64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn balance_response(account: &Account) -> BalanceResponse {
    BalanceResponse {
        account_id: account.id,
        balance: account.balance.to_f64().unwrap_or_default(),
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/accounts", post(create_account))
        .route("/accounts/:id/top-up", post(top_up))
        .route("/accounts/:user_id/balance", get(get_balance))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn create_account(
    State(state): State<AppState>,
    Json(request): Json<CreateAccountRequest>,
) -> Result<(StatusCode, Json<BalanceResponse>), ApiError> {
    match state.accounts.create_account(request.user_id).await {
        Ok(account) => Ok((StatusCode::CREATED, Json(balance_response(&account)))),
        Err(e @ CreateAccountError::AlreadyExists) => {
            Err(error(StatusCode::CONFLICT, e.to_string()))
        }
        Err(CreateAccountError::Internal(e)) => {
            tracing::error!(error = %e, "failed to create account");
            Err(error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to create account",
            ))
        }
    }
}

pub async fn top_up(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<TopUpRequest>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let amount = BigDecimal::from_f64(request.amount)
        .ok_or_else(|| error(StatusCode::BAD_REQUEST, "amount is not a valid number"))?;

    match state.accounts.top_up(id, amount).await {
        Ok(account) => Ok(Json(balance_response(&account))),
        Err(e @ TopUpError::InvalidAmount) => Err(error(StatusCode::BAD_REQUEST, e.to_string())),
        Err(e @ TopUpError::AccountNotFound) => Err(error(StatusCode::NOT_FOUND, e.to_string())),
        Err(e @ TopUpError::Contention) => Err(error(StatusCode::CONFLICT, e.to_string())),
        Err(TopUpError::Internal(e)) => {
            tracing::error!(error = %e, "failed to top up account");
            Err(error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to top up account",
            ))
        }
    }
}

pub async fn get_balance(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<BalanceResponse>, ApiError> {
    match state.accounts.balance(user_id).await {
        Ok(Some(account)) => Ok(Json(balance_response(&account))),
        Ok(None) => Err(error(StatusCode::NOT_FOUND, "account not found")),
        Err(e) => {
            tracing::error!(error = %e, "failed to load balance");
            Err(error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to load balance",
            ))
        }
    }
}

pub async fn health_check() -> &'static str {
    "OK"
}
