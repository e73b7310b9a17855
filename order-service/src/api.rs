use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use bigdecimal::BigDecimal;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::handlers::{CreateOrderError, OrderHandler};
use crate::models::Order;

#[derive(Clone)]
pub struct AppState {
    pub orders: Arc<OrderHandler>,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub user_id: Uuid,
    pub amount: f64,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListOrdersParams {
    pub user_id: Uuid,
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

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<Order>), ApiError> {
    let amount = BigDecimal::from_f64(request.amount)
        .ok_or_else(|| error(StatusCode::BAD_REQUEST, "amount is not a valid number"))?;

    match state
        .orders
        .create_order(request.user_id, amount, request.description)
        .await
    {
        Ok(order) => Ok((StatusCode::CREATED, Json(order))),
        Err(e @ CreateOrderError::InvalidAmount) => {
            Err(error(StatusCode::BAD_REQUEST, e.to_string()))
        }
        Err(e @ CreateOrderError::InsufficientBalance { .. }) => {
            Err(error(StatusCode::PAYMENT_REQUIRED, e.to_string()))
        }
        Err(e @ CreateOrderError::BalanceUnavailable) => {
            Err(error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
        }
        Err(CreateOrderError::Internal(e)) => {
            tracing::error!(error = %e, "failed to create order");
            Err(error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to create order",
            ))
        }
    }
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, ApiError> {
    match state.orders.get_order(id).await {
        Ok(Some(order)) => Ok(Json(order)),
        Ok(None) => Err(error(StatusCode::NOT_FOUND, "order not found")),
        Err(e) => {
            tracing::error!(error = %e, "failed to load order");
            Err(error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to load order",
            ))
        }
    }
}

pub async fn list_orders(
    State(state): State<AppState>,
    Query(params): Query<ListOrdersParams>,
) -> Result<Json<Vec<Order>>, ApiError> {
    match state.orders.list_orders(params.user_id).await {
        Ok(rows) => Ok(Json(rows)),
        Err(e) => {
            tracing::error!(error = %e, "failed to list orders");
            Err(error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to list orders",
            ))
        }
    }
}

pub async fn health_check() -> &'static str {
    "OK"
}
