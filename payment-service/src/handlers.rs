use anyhow::Result;
use bigdecimal::BigDecimal;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{
    pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl,
};
use shared::{ConsumeError, DomainEvent, OrderCreated, PaymentFailed, PaymentSucceeded};
use tracing::{info, warn};
use uuid::Uuid;

use crate::inbox;
use crate::models::{Account, LedgerError, Transaction};
use crate::outbox;
use crate::schema::{accounts, transactions};

type DbPool = Pool<AsyncPgConnection>;

const REASON_ACCOUNT_NOT_FOUND: &str = "account not found";
const REASON_INSUFFICIENT_BALANCE: &str = "insufficient balance";

/// How an OrderCreated event settles against the ledger. Both arms are
/// terminal business outcomes; neither is retried.
enum Settlement {
    Succeeded { transaction: Transaction },
    Rejected { reason: &'static str },
}

/// Applies the withdrawal to the in-memory account and decides the outcome.
/// Persistence of the mutated account and the ledger row happens around it.
fn settle(account: Option<&mut Account>, order: &OrderCreated) -> Result<Settlement, LedgerError> {
    let Some(account) = account else {
        return Ok(Settlement::Rejected {
            reason: REASON_ACCOUNT_NOT_FOUND,
        });
    };

    if account.try_withdraw(&order.amount)? {
        let transaction =
            Transaction::withdrawal(account.id, order.order_id, order.amount.clone())?;
        Ok(Settlement::Succeeded { transaction })
    } else {
        Ok(Settlement::Rejected {
            reason: REASON_INSUFFICIENT_BALANCE,
        })
    }
}

/// Payments-side saga participant: consumes OrderCreated, deduplicates via
/// the inbox, debits the account, and emits the payment result through the
/// outbox, with all side effects in one local transaction.
pub struct PaymentHandler {
    pool: DbPool,
}

impl PaymentHandler {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn on_order_created(&self, event: DomainEvent) -> Result<(), ConsumeError> {
        let message_id = event.message_id();
        let DomainEvent::OrderCreated(ref order) = event else {
            warn!(kind = %event.kind(), "unexpected event on OrderCreated consumer; dropping");
            return Ok(());
        };

        if order.amount <= BigDecimal::from(0) {
            return Err(ConsumeError::Poison(format!(
                "OrderCreated {} carries non-positive amount {}",
                order.order_id, order.amount
            )));
        }

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| ConsumeError::Transient(anyhow::Error::from(e)))?;

        if inbox::is_processed(&mut conn, message_id)
            .await
            .map_err(ConsumeError::Transient)?
        {
            info!(%message_id, order_id = %order.order_id, "duplicate OrderCreated; dropping");
            return Ok(());
        }

        let order = order.clone();
        conn.transaction::<_, anyhow::Error, _>(|conn| {
            Box::pin(async move {
                if !inbox::save_received(conn, message_id, &event).await? {
                    info!(%message_id, "OrderCreated delivered concurrently; dropping");
                    return Ok(());
                }

                // A ledger row for this order means an earlier delivery
                // already settled it under a different message id.
                let settled: Option<Uuid> = transactions::table
                    .filter(transactions::order_id.eq(order.order_id))
                    .select(transactions::id)
                    .first(conn)
                    .await
                    .optional()?;
                if settled.is_some() {
                    warn!(order_id = %order.order_id, "order already settled; marking processed");
                    inbox::mark_processed(conn, message_id).await?;
                    return Ok(());
                }

                let account = accounts::table
                    .filter(accounts::user_id.eq(order.user_id))
                    .first::<Account>(conn)
                    .await
                    .optional()?;

                let outcome = match account {
                    None => settle(None, &order)?,
                    Some(mut account) => {
                        let expected_version = account.version;
                        let outcome = settle(Some(&mut account), &order)?;
                        if let Settlement::Succeeded { ref transaction } = outcome {
                            let updated = diesel::update(
                                accounts::table
                                    .filter(accounts::id.eq(account.id))
                                    .filter(accounts::version.eq(expected_version)),
                            )
                            .set((
                                accounts::balance.eq(&account.balance),
                                accounts::updated_at.eq(account.updated_at),
                                accounts::version.eq(account.version),
                            ))
                            .execute(conn)
                            .await?;
                            if updated == 0 {
                                // Concurrent writer won the version race; roll
                                // everything back and let redelivery retry.
                                anyhow::bail!("account {} version conflict", account.id);
                            }
                            diesel::insert_into(transactions::table)
                                .values(transaction)
                                .execute(conn)
                                .await?;
                        }
                        outcome
                    }
                };

                let result_event = match outcome {
                    Settlement::Succeeded { transaction } => {
                        info!(
                            order_id = %order.order_id,
                            transaction_id = %transaction.id,
                            amount = %order.amount,
                            "payment succeeded"
                        );
                        DomainEvent::PaymentSucceeded(PaymentSucceeded {
                            order_id: order.order_id,
                            user_id: order.user_id,
                            amount: order.amount.clone(),
                            processed_at: Utc::now(),
                            transaction_id: transaction.id,
                        })
                    }
                    Settlement::Rejected { reason } => {
                        warn!(order_id = %order.order_id, reason, "payment failed");
                        DomainEvent::PaymentFailed(PaymentFailed {
                            order_id: order.order_id,
                            user_id: order.user_id,
                            amount: order.amount.clone(),
                            processed_at: Utc::now(),
                            reason: reason.to_string(),
                        })
                    }
                };

                outbox::append(conn, &result_event).await?;
                inbox::mark_processed(conn, message_id).await?;
                Ok(())
            })
        })
        .await
        .map_err(ConsumeError::Transient)?;

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CreateAccountError {
    #[error("account already exists for this user")]
    AlreadyExists,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TopUpError {
    #[error("top-up amount must be positive")]
    InvalidAmount,
    #[error("account not found")]
    AccountNotFound,
    #[error("account is being updated concurrently; retry")]
    Contention,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

const TOP_UP_ATTEMPTS: usize = 3;

/// Synchronous account operations behind the HTTP surface.
pub struct AccountService {
    pool: DbPool,
}

impl AccountService {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create_account(&self, user_id: Uuid) -> Result<Account, CreateAccountError> {
        let account = Account::new(user_id);
        let mut conn = self.pool.get().await.map_err(anyhow::Error::from)?;

        let inserted = diesel::insert_into(accounts::table)
            .values(&account)
            .on_conflict(accounts::id)
            .do_nothing()
            .execute(&mut conn)
            .await
            .map_err(anyhow::Error::from)?;
        if inserted == 0 {
            return Err(CreateAccountError::AlreadyExists);
        }

        info!(account_id = %account.id, %user_id, "account created");
        Ok(account)
    }

    /// Credits the account under the version token; on a conflict the
    /// account is re-read and the attempt repeated a bounded number of
    /// times before giving up.
    pub async fn top_up(
        &self,
        account_id: Uuid,
        amount: BigDecimal,
    ) -> Result<Account, TopUpError> {
        if amount <= BigDecimal::from(0) {
            return Err(TopUpError::InvalidAmount);
        }
        let mut conn = self.pool.get().await.map_err(anyhow::Error::from)?;

        for _ in 0..TOP_UP_ATTEMPTS {
            let account = accounts::table
                .filter(accounts::id.eq(account_id))
                .first::<Account>(&mut conn)
                .await
                .optional()
                .map_err(anyhow::Error::from)?;
            let Some(mut account) = account else {
                return Err(TopUpError::AccountNotFound);
            };

            let expected_version = account.version;
            account
                .top_up(&amount)
                .map_err(|_| TopUpError::InvalidAmount)?;
            let row = Transaction::top_up(account.id, amount.clone())
                .map_err(|_| TopUpError::InvalidAmount)?;

            let applied = {
                let account = account.clone();
                conn.transaction::<_, anyhow::Error, _>(|conn| {
                    Box::pin(async move {
                        let updated = diesel::update(
                            accounts::table
                                .filter(accounts::id.eq(account.id))
                                .filter(accounts::version.eq(expected_version)),
                        )
                        .set((
                            accounts::balance.eq(&account.balance),
                            accounts::updated_at.eq(account.updated_at),
                            accounts::version.eq(account.version),
                        ))
                        .execute(conn)
                        .await?;
                        if updated == 0 {
                            return Ok(false);
                        }
                        diesel::insert_into(transactions::table)
                            .values(&row)
                            .execute(conn)
                            .await?;
                        Ok(true)
                    })
                })
                .await
                .map_err(TopUpError::Internal)?
            };

            if applied {
                info!(account_id = %account.id, %amount, balance = %account.balance, "account topped up");
                return Ok(account);
            }
            warn!(%account_id, "version conflict on top-up; re-reading");
        }

        Err(TopUpError::Contention)
    }

    pub async fn balance(&self, user_id: Uuid) -> Result<Option<Account>> {
        let mut conn = self.pool.get().await?;
        let account = accounts::table
            .filter(accounts::user_id.eq(user_id))
            .first::<Account>(&mut conn)
            .await
            .optional()?;
        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_for(amount: i64) -> OrderCreated {
        OrderCreated {
            order_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            amount: BigDecimal::from(amount),
            created_at: Utc::now(),
            description: None,
        }
    }

    fn funded_account(balance: i64) -> Account {
        let mut account = Account::new(Uuid::new_v4());
        account.top_up(&BigDecimal::from(balance)).unwrap();
        account
    }

    #[test]
    fn missing_account_is_a_terminal_rejection() {
        let outcome = settle(None, &order_for(50)).unwrap();
        assert!(matches!(
            outcome,
            Settlement::Rejected {
                reason: REASON_ACCOUNT_NOT_FOUND
            }
        ));
    }

    #[test]
    fn insufficient_funds_reject_without_touching_the_balance() {
        let mut account = funded_account(100);
        let outcome = settle(Some(&mut account), &order_for(150)).unwrap();

        assert!(matches!(
            outcome,
            Settlement::Rejected {
                reason: REASON_INSUFFICIENT_BALANCE
            }
        ));
        assert_eq!(account.balance, BigDecimal::from(100));
    }

    #[test]
    fn covered_order_debits_once_and_links_the_ledger_row() {
        let mut account = funded_account(100);
        let order = order_for(50);

        let outcome = settle(Some(&mut account), &order).unwrap();
        let Settlement::Succeeded { transaction } = outcome else {
            panic!("expected settlement to succeed");
        };

        assert_eq!(account.balance, BigDecimal::from(50));
        assert_eq!(transaction.order_id, Some(order.order_id));
        assert_eq!(transaction.account_id, account.id);
        assert_eq!(transaction.amount, order.amount);
    }

    #[test]
    fn a_drained_account_fails_the_next_order() {
        // The advisory balance check can pass and still lose the race: a
        // concurrent withdrawal empties the account before settlement.
        let mut account = funded_account(100);

        let first = settle(Some(&mut account), &order_for(100)).unwrap();
        assert!(matches!(first, Settlement::Succeeded { .. }));
        assert_eq!(account.balance, BigDecimal::from(0));

        let second = settle(Some(&mut account), &order_for(1)).unwrap();
        assert!(matches!(
            second,
            Settlement::Rejected {
                reason: REASON_INSUFFICIENT_BALANCE
            }
        ));
        assert_eq!(account.balance, BigDecimal::from(0));
    }
}
