use anyhow::Result;
use bigdecimal::BigDecimal;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{
    pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl,
};
use shared::{ConsumeError, DomainEvent, OrderCreated};
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{Order, OrderStatus};
use crate::outbox;
use crate::payments_client::PaymentsClient;
use crate::schema::orders;

type DbPool = Pool<AsyncPgConnection>;

#[derive(Debug, thiserror::Error)]
pub enum CreateOrderError {
    #[error("order amount must be positive")]
    InvalidAmount,
    #[error("could not verify account balance")]
    BalanceUnavailable,
    #[error("insufficient balance: {balance} available")]
    InsufficientBalance { balance: BigDecimal },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Orders-side saga participant: creates orders (synchronous entry point)
/// and settles them when payment results arrive (asynchronous entry point).
pub struct OrderHandler {
    pool: DbPool,
    payments: PaymentsClient,
}

impl OrderHandler {
    pub fn new(pool: DbPool, payments: PaymentsClient) -> Self {
        Self { pool, payments }
    }

    /// Checks the remote balance for fast feedback, then persists the order
    /// and its OrderCreated event in one transaction. The balance check is
    /// optimistic; the authoritative debit happens asynchronously and the
    /// order can still end up failed.
    pub async fn create_order(
        &self,
        user_id: Uuid,
        amount: BigDecimal,
        description: Option<String>,
    ) -> Result<Order, CreateOrderError> {
        let order = Order::new(user_id, amount.clone(), description)
            .map_err(|_| CreateOrderError::InvalidAmount)?;

        let balance = self
            .payments
            .user_balance(user_id)
            .await
            .ok_or(CreateOrderError::BalanceUnavailable)?;
        if balance < amount {
            warn!(%user_id, %balance, %amount, "rejecting order: insufficient balance");
            return Err(CreateOrderError::InsufficientBalance { balance });
        }

        let event = DomainEvent::OrderCreated(OrderCreated {
            order_id: order.id,
            user_id: order.user_id,
            amount: order.amount.clone(),
            created_at: order.created_at,
            description: order.description.clone(),
        });

        let mut conn = self.pool.get().await.map_err(anyhow::Error::from)?;
        let row = order.clone();
        conn.transaction::<_, anyhow::Error, _>(|conn| {
            Box::pin(async move {
                diesel::insert_into(orders::table)
                    .values(&row)
                    .execute(conn)
                    .await?;
                outbox::append(conn, &event).await?;
                Ok(())
            })
        })
        .await?;

        info!(order_id = %order.id, %user_id, amount = %order.amount, "order created");
        Ok(order)
    }

    pub async fn get_order(&self, id: Uuid) -> Result<Option<Order>> {
        let mut conn = self.pool.get().await?;
        let order = orders::table
            .filter(orders::id.eq(id))
            .first::<Order>(&mut conn)
            .await
            .optional()?;
        Ok(order)
    }

    pub async fn list_orders(&self, user_id: Uuid) -> Result<Vec<Order>> {
        let mut conn = self.pool.get().await?;
        let rows = orders::table
            .filter(orders::user_id.eq(user_id))
            .order(orders::created_at.desc())
            .load::<Order>(&mut conn)
            .await?;
        Ok(rows)
    }

    /// Asynchronous entry point fed by the payment-result queues. Unknown
    /// orders and already-resolved orders are dropped; the guarded update is
    /// the idempotency boundary for redelivered results.
    pub async fn on_payment_result(&self, event: DomainEvent) -> Result<(), ConsumeError> {
        match event {
            DomainEvent::PaymentSucceeded(result) => {
                self.settle_order(result.order_id, None).await
            }
            DomainEvent::PaymentFailed(result) => {
                self.settle_order(result.order_id, Some(result.reason)).await
            }
            DomainEvent::OrderCreated(other) => {
                warn!(order_id = %other.order_id, "unexpected OrderCreated on result consumer; dropping");
                Ok(())
            }
        }
    }

    async fn settle_order(
        &self,
        order_id: Uuid,
        failure_reason: Option<String>,
    ) -> Result<(), ConsumeError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| ConsumeError::Transient(anyhow::Error::from(e)))?;

        let order = orders::table
            .filter(orders::id.eq(order_id))
            .first::<Order>(&mut conn)
            .await
            .optional()
            .map_err(|e| ConsumeError::Transient(e.into()))?;

        let Some(mut order) = order else {
            warn!(%order_id, "payment result for unknown order; dropping");
            return Ok(());
        };

        let transition = match &failure_reason {
            None => order.mark_paid(),
            Some(reason) => order.mark_failed(Some(reason.clone())),
        };
        if let Err(state) = transition {
            info!(%order_id, %state, "payment result ignored");
            return Ok(());
        }

        // Guard against a concurrent writer resolving the order between the
        // read above and this write.
        let updated = diesel::update(
            orders::table
                .filter(orders::id.eq(order_id))
                .filter(orders::status.eq(OrderStatus::Created.as_str())),
        )
        .set((
            orders::status.eq(&order.status),
            orders::failure_reason.eq(&order.failure_reason),
            orders::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await
        .map_err(|e| ConsumeError::Transient(e.into()))?;

        if updated == 0 {
            info!(%order_id, "order resolved concurrently; dropping result");
        } else {
            info!(%order_id, status = %order.status, "order settled");
        }
        Ok(())
    }
}
