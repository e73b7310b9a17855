use anyhow::Result;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use shared::DomainEvent;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("amount must be positive")]
    NonPositiveAmount,
}

/// A user's account. `id` doubles as the owning user's id; one account per
/// user. `version` is the optimistic-concurrency token: every persisted
/// mutation carries a compare-and-swap on it.
#[derive(Debug, Clone, Queryable, Insertable, Serialize)]
#[diesel(table_name = crate::schema::accounts)]
pub struct Account {
    pub id: Uuid,
    pub user_id: Uuid,
    pub balance: BigDecimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i32,
}

impl Account {
    pub fn new(user_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: user_id,
            user_id,
            balance: BigDecimal::from(0),
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    pub fn top_up(&mut self, amount: &BigDecimal) -> Result<(), LedgerError> {
        if amount <= &BigDecimal::from(0) {
            return Err(LedgerError::NonPositiveAmount);
        }
        self.balance += amount;
        self.touch();
        Ok(())
    }

    /// Debits `amount` if the balance covers it; fails closed otherwise.
    /// `Ok(false)` is the insufficient-funds outcome, not an error.
    pub fn try_withdraw(&mut self, amount: &BigDecimal) -> Result<bool, LedgerError> {
        if amount <= &BigDecimal::from(0) {
            return Err(LedgerError::NonPositiveAmount);
        }
        if self.balance < *amount {
            return Ok(false);
        }
        self.balance -= amount;
        self.touch();
        Ok(true)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.version += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    TopUp,
    Withdrawal,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::TopUp => "top_up",
            TransactionKind::Withdrawal => "withdrawal",
        }
    }
}

/// Append-only ledger row; immutable once created.
#[derive(Debug, Clone, Queryable, Insertable, Serialize)]
#[diesel(table_name = crate::schema::transactions)]
pub struct Transaction {
    pub id: Uuid,
    pub account_id: Uuid,
    pub order_id: Option<Uuid>,
    pub kind: String,
    pub amount: BigDecimal,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn top_up(account_id: Uuid, amount: BigDecimal) -> Result<Self, LedgerError> {
        Self::new(account_id, None, TransactionKind::TopUp, amount, "Account top-up".to_string())
    }

    pub fn withdrawal(
        account_id: Uuid,
        order_id: Uuid,
        amount: BigDecimal,
    ) -> Result<Self, LedgerError> {
        let description = format!("Payment for order {order_id}");
        Self::new(account_id, Some(order_id), TransactionKind::Withdrawal, amount, description)
    }

    fn new(
        account_id: Uuid,
        order_id: Option<Uuid>,
        kind: TransactionKind,
        amount: BigDecimal,
        description: String,
    ) -> Result<Self, LedgerError> {
        if amount <= BigDecimal::from(0) {
            return Err(LedgerError::NonPositiveAmount);
        }
        Ok(Self {
            id: Uuid::new_v4(),
            account_id,
            order_id,
            kind: kind.as_str().to_string(),
            amount,
            description: Some(description),
            created_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::inbox_messages)]
pub struct NewInboxMessage {
    pub message_id: Uuid,
    pub kind: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl NewInboxMessage {
    pub fn from_event(message_id: Uuid, event: &DomainEvent) -> Result<Self> {
        Ok(Self {
            message_id,
            kind: event.kind().as_str().to_string(),
            payload: serde_json::to_value(event)?,
            received_at: Utc::now(),
        })
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

    #[test]
    fn new_account_starts_empty_at_version_one() {
        let user_id = Uuid::new_v4();
        let account = Account::new(user_id);
        assert_eq!(account.id, user_id);
        assert_eq!(account.balance, BigDecimal::from(0));
        assert_eq!(account.version, 1);
    }

    #[test]
    fn top_up_increases_balance_and_version() {
        let mut account = Account::new(Uuid::new_v4());
        account.top_up(&BigDecimal::from(100)).unwrap();
        assert_eq!(account.balance, BigDecimal::from(100));
        assert_eq!(account.version, 2);
    }

    #[test]
    fn top_up_rejects_non_positive_amounts() {
        let mut account = Account::new(Uuid::new_v4());
        assert!(account.top_up(&BigDecimal::from(0)).is_err());
        assert!(account.top_up(&BigDecimal::from(-5)).is_err());
        assert_eq!(account.balance, BigDecimal::from(0));
        assert_eq!(account.version, 1);
    }

    #[test]
    fn withdraw_debits_when_covered() {
        let mut account = Account::new(Uuid::new_v4());
        account.top_up(&BigDecimal::from(100)).unwrap();

        assert!(account.try_withdraw(&BigDecimal::from(60)).unwrap());
        assert_eq!(account.balance, BigDecimal::from(40));
        assert_eq!(account.version, 3);
    }

    #[test]
    fn withdraw_fails_closed_on_insufficient_funds() {
        let mut account = Account::new(Uuid::new_v4());
        account.top_up(&BigDecimal::from(50)).unwrap();
        let version = account.version;

        assert!(!account.try_withdraw(&BigDecimal::from(51)).unwrap());
        assert_eq!(account.balance, BigDecimal::from(50));
        assert_eq!(account.version, version);
    }

    #[test]
    fn balance_never_goes_negative_across_mixed_operations() {
        let mut account = Account::new(Uuid::new_v4());
        account.top_up(&BigDecimal::from(30)).unwrap();
        assert!(account.try_withdraw(&BigDecimal::from(20)).unwrap());
        assert!(!account.try_withdraw(&BigDecimal::from(11)).unwrap());
        assert!(account.try_withdraw(&BigDecimal::from(10)).unwrap());
        assert!(!account.try_withdraw(&BigDecimal::from(1)).unwrap());
        assert_eq!(account.balance, BigDecimal::from(0));
    }

    #[test]
    fn ledger_rows_require_positive_amounts() {
        assert!(Transaction::top_up(Uuid::new_v4(), BigDecimal::from(0)).is_err());
        assert!(
            Transaction::withdrawal(Uuid::new_v4(), Uuid::new_v4(), BigDecimal::from(-1)).is_err()
        );
    }

    #[test]
    fn withdrawal_rows_link_the_order() {
        let order_id = Uuid::new_v4();
        let row = Transaction::withdrawal(Uuid::new_v4(), order_id, BigDecimal::from(25)).unwrap();
        assert_eq!(row.order_id, Some(order_id));
        assert_eq!(row.kind, TransactionKind::Withdrawal.as_str());
    }
}
