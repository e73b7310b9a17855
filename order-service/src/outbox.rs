use anyhow::Result;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use shared::{DomainEvent, EventKind, MessageBus};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::{NewOutboxMessage, OutboxMessage};
use crate::schema::outbox_messages;

type DbPool = Pool<AsyncPgConnection>;

/// Inserts `event` as a pending outbox row on the caller's connection, so it
/// commits (or rolls back) together with the business write it describes.
/// No broker I/O happens here.
pub async fn append(conn: &mut AsyncPgConnection, event: &DomainEvent) -> Result<()> {
    let row = NewOutboxMessage::from_event(event)?;
    diesel::insert_into(outbox_messages::table)
        .values(&row)
        .execute(conn)
        .await?;

    info!(id = %row.id, kind = %row.kind, "outbox entry appended");
    Ok(())
}

/// Idempotent: only flips entries that are still pending.
async fn mark_processed(conn: &mut AsyncPgConnection, id: Uuid) -> Result<()> {
    diesel::update(
        outbox_messages::table
            .filter(outbox_messages::id.eq(id))
            .filter(outbox_messages::processed_at.is_null()),
    )
    .set(outbox_messages::processed_at.eq(Utc::now()))
    .execute(conn)
    .await?;

    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum RetryDecision {
    Retry,
    GiveUp,
}

fn next_retry(prior_retries: i32, ceiling: i32) -> (i32, RetryDecision) {
    let retries = prior_retries + 1;
    if retries >= ceiling {
        (retries, RetryDecision::GiveUp)
    } else {
        (retries, RetryDecision::Retry)
    }
}

async fn record_failure(
    conn: &mut AsyncPgConnection,
    entry: &OutboxMessage,
    error_text: &str,
    ceiling: i32,
) -> Result<()> {
    match next_retry(entry.retry_count, ceiling) {
        (retries, RetryDecision::Retry) => {
            warn!(
                id = %entry.id,
                kind = %entry.kind,
                retries,
                error = error_text,
                "publish failed; entry stays pending"
            );
            diesel::update(outbox_messages::table.filter(outbox_messages::id.eq(entry.id)))
                .set((
                    outbox_messages::retry_count.eq(retries),
                    outbox_messages::last_error.eq(error_text),
                ))
                .execute(conn)
                .await?;
        }
        (retries, RetryDecision::GiveUp) => {
            // Liveness over delivery: unblock the queue and surface the drop.
            error!(
                id = %entry.id,
                kind = %entry.kind,
                retries,
                error = error_text,
                "retry ceiling reached; dropping outbox entry"
            );
            diesel::update(outbox_messages::table.filter(outbox_messages::id.eq(entry.id)))
                .set((
                    outbox_messages::retry_count.eq(retries),
                    outbox_messages::last_error.eq(error_text),
                    outbox_messages::processed_at.eq(Utc::now()),
                ))
                .execute(conn)
                .await?;
        }
    }

    Ok(())
}

enum PublishError {
    /// Unknown kind tag or undecodable payload; retrying cannot help.
    Unroutable(String),
    Transport(anyhow::Error),
}

/// Background task draining this service's outbox to the broker.
pub struct OutboxRelay {
    pool: DbPool,
    bus: MessageBus,
    interval: Duration,
    batch_size: i64,
    retry_ceiling: i32,
}

impl OutboxRelay {
    pub fn new(
        pool: DbPool,
        bus: MessageBus,
        interval: Duration,
        batch_size: i64,
        retry_ceiling: i32,
    ) -> Self {
        Self {
            pool,
            bus,
            interval,
            batch_size,
            retry_ceiling,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.drain_pending().await {
                        error!(error = %e, "outbox cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("outbox relay stopping");
                    break;
                }
            }
        }
    }

    /// One cycle over a fresh connection scope: fetch a bounded batch of
    /// pending entries oldest-first and publish each. A single entry's
    /// failure never aborts the rest of the batch.
    async fn drain_pending(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;

        let pending = outbox_messages::table
            .filter(outbox_messages::processed_at.is_null())
            .order(outbox_messages::created_at.asc())
            .limit(self.batch_size)
            .load::<OutboxMessage>(&mut conn)
            .await?;

        for entry in pending {
            match self.publish_entry(&entry).await {
                Ok(()) => {
                    mark_processed(&mut conn, entry.id).await?;
                    info!(id = %entry.id, kind = %entry.kind, "outbox entry published");
                }
                Err(PublishError::Unroutable(reason)) => {
                    error!(id = %entry.id, kind = %entry.kind, %reason, "force-completing unroutable outbox entry");
                    mark_processed(&mut conn, entry.id).await?;
                }
                Err(PublishError::Transport(e)) => {
                    record_failure(&mut conn, &entry, &e.to_string(), self.retry_ceiling).await?;
                }
            }
        }

        Ok(())
    }

    async fn publish_entry(&self, entry: &OutboxMessage) -> Result<(), PublishError> {
        if EventKind::from_tag(&entry.kind).is_none() {
            return Err(PublishError::Unroutable(format!(
                "unknown kind tag {:?}",
                entry.kind
            )));
        }

        let event: DomainEvent = serde_json::from_value(entry.payload.clone())
            .map_err(|e| PublishError::Unroutable(format!("undecodable payload: {e}")))?;

        self.bus
            .publish(&event)
            .await
            .map_err(PublishError::Transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_below_the_ceiling_keep_retrying() {
        assert_eq!(next_retry(0, 3), (1, RetryDecision::Retry));
        assert_eq!(next_retry(1, 3), (2, RetryDecision::Retry));
    }

    #[test]
    fn the_ceiling_forces_completion() {
        assert_eq!(next_retry(2, 3), (3, RetryDecision::GiveUp));
        assert_eq!(next_retry(7, 3), (8, RetryDecision::GiveUp));
    }
}
