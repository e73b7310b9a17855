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

/// Appends a payment-result event as a pending outbox row on the caller's
/// connection; it lands in the same commit as the ledger writes.
pub async fn append(conn: &mut AsyncPgConnection, event: &DomainEvent) -> Result<()> {
    let row = NewOutboxMessage::from_event(event)?;
    diesel::insert_into(outbox_messages::table)
        .values(&row)
        .execute(conn)
        .await?;

    info!(id = %row.id, kind = %row.kind, "payments outbox entry appended");
    Ok(())
}

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

async fn record_failure(
    conn: &mut AsyncPgConnection,
    entry: &OutboxMessage,
    error_text: &str,
    ceiling: i32,
) -> Result<()> {
    let retries = entry.retry_count + 1;
    if retries >= ceiling {
        error!(
            id = %entry.id,
            kind = %entry.kind,
            retries,
            error = error_text,
            "retry ceiling reached; dropping payments outbox entry"
        );
        diesel::update(outbox_messages::table.filter(outbox_messages::id.eq(entry.id)))
            .set((
                outbox_messages::retry_count.eq(retries),
                outbox_messages::last_error.eq(error_text),
                outbox_messages::processed_at.eq(Utc::now()),
            ))
            .execute(conn)
            .await?;
    } else {
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

    Ok(())
}

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
                        error!(error = %e, "payments outbox cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("payments outbox relay stopping");
                    break;
                }
            }
        }
    }

    async fn drain_pending(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;

        let pending = outbox_messages::table
            .filter(outbox_messages::processed_at.is_null())
            .order(outbox_messages::created_at.asc())
            .limit(self.batch_size)
            .load::<OutboxMessage>(&mut conn)
            .await?;

        for entry in pending {
            let event = match decode(&entry) {
                Ok(event) => event,
                Err(reason) => {
                    error!(id = %entry.id, kind = %entry.kind, %reason, "force-completing unroutable outbox entry");
                    mark_processed(&mut conn, entry.id).await?;
                    continue;
                }
            };

            if event.kind() == EventKind::OrderCreated {
                // This side only ever emits payment results.
                warn!(id = %entry.id, "OrderCreated in the payments outbox");
            }

            match self.bus.publish(&event).await {
                Ok(()) => {
                    mark_processed(&mut conn, entry.id).await?;
                    info!(id = %entry.id, kind = %entry.kind, "payments outbox entry published");
                }
                Err(e) => {
                    record_failure(&mut conn, &entry, &e.to_string(), self.retry_ceiling).await?;
                }
            }
        }

        Ok(())
    }
}

fn decode(entry: &OutboxMessage) -> Result<DomainEvent, String> {
    if EventKind::from_tag(&entry.kind).is_none() {
        return Err(format!("unknown kind tag {:?}", entry.kind));
    }
    serde_json::from_value(entry.payload.clone()).map_err(|e| format!("undecodable payload: {e}"))
}
