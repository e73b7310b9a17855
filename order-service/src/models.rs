use anyhow::Result;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::DomainEvent;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Created,
    Paid,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "created",
            OrderStatus::Paid => "paid",
            OrderStatus::Failed => "failed",
        }
    }

    pub fn from_tag(tag: &str) -> Option<OrderStatus> {
        match tag {
            "created" => Some(OrderStatus::Created),
            "paid" => Some(OrderStatus::Paid),
            "failed" => Some(OrderStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrderStateError {
    #[error("order amount must be positive")]
    NonPositiveAmount,
    #[error("order is already {0}")]
    AlreadyResolved(String),
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize)]
#[diesel(table_name = crate::schema::orders)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: BigDecimal,
    pub description: Option<String>,
    pub status: String,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn new(
        user_id: Uuid,
        amount: BigDecimal,
        description: Option<String>,
    ) -> Result<Self, OrderStateError> {
        if amount <= BigDecimal::from(0) {
            return Err(OrderStateError::NonPositiveAmount);
        }

        Ok(Self {
            id: Uuid::new_v4(),
            user_id,
            amount,
            description,
            status: OrderStatus::Created.as_str().to_string(),
            failure_reason: None,
            created_at: Utc::now(),
            updated_at: None,
        })
    }

    pub fn status(&self) -> Option<OrderStatus> {
        OrderStatus::from_tag(&self.status)
    }

    /// created -> paid. Any other starting state is terminal and rejected
    /// without mutation.
    pub fn mark_paid(&mut self) -> Result<(), OrderStateError> {
        self.transition_to(OrderStatus::Paid, None)
    }

    /// created -> failed, recording why the payment did not go through.
    pub fn mark_failed(&mut self, reason: Option<String>) -> Result<(), OrderStateError> {
        self.transition_to(OrderStatus::Failed, reason)
    }

    fn transition_to(
        &mut self,
        next: OrderStatus,
        reason: Option<String>,
    ) -> Result<(), OrderStateError> {
        if self.status() != Some(OrderStatus::Created) {
            return Err(OrderStateError::AlreadyResolved(self.status.clone()));
        }
        self.status = next.as_str().to_string();
        self.failure_reason = reason;
        self.updated_at = Some(Utc::now());
        Ok(())
    }
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::outbox_messages)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retry_count: i32,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::outbox_messages)]
pub struct NewOutboxMessage {
    pub id: Uuid,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl NewOutboxMessage {
    pub fn from_event(event: &DomainEvent) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            kind: event.kind().as_str().to_string(),
            payload: serde_json::to_value(event)?,
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> Order {
        Order::new(Uuid::new_v4(), BigDecimal::from(100), Some("test".to_string())).unwrap()
    }

    #[test]
    fn new_order_starts_created() {
        let order = order();
        assert_eq!(order.status(), Some(OrderStatus::Created));
        assert!(order.updated_at.is_none());
        assert!(order.failure_reason.is_none());
    }

    #[test]
    fn non_positive_amounts_are_rejected() {
        assert!(matches!(
            Order::new(Uuid::new_v4(), BigDecimal::from(0), None),
            Err(OrderStateError::NonPositiveAmount)
        ));
        assert!(matches!(
            Order::new(Uuid::new_v4(), BigDecimal::from(-10), None),
            Err(OrderStateError::NonPositiveAmount)
        ));
    }

    #[test]
    fn created_order_can_be_paid() {
        let mut order = order();
        order.mark_paid().unwrap();
        assert_eq!(order.status(), Some(OrderStatus::Paid));
        assert!(order.updated_at.is_some());
    }

    #[test]
    fn created_order_can_fail_with_reason() {
        let mut order = order();
        order.mark_failed(Some("insufficient balance".to_string())).unwrap();
        assert_eq!(order.status(), Some(OrderStatus::Failed));
        assert_eq!(order.failure_reason.as_deref(), Some("insufficient balance"));
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        let mut paid = order();
        paid.mark_paid().unwrap();
        assert!(matches!(
            paid.mark_failed(None),
            Err(OrderStateError::AlreadyResolved(_))
        ));
        assert_eq!(paid.status(), Some(OrderStatus::Paid));

        let mut failed = order();
        failed.mark_failed(Some("no funds".to_string())).unwrap();
        assert!(matches!(
            failed.mark_paid(),
            Err(OrderStateError::AlreadyResolved(_))
        ));
        assert_eq!(failed.status(), Some(OrderStatus::Failed));
        assert_eq!(failed.failure_reason.as_deref(), Some("no funds"));
    }
}
