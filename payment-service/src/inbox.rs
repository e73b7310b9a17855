use anyhow::Result;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use shared::DomainEvent;
use tracing::info;
use uuid::Uuid;

use crate::models::NewInboxMessage;
use crate::schema::inbox_messages;

pub async fn is_processed(conn: &mut AsyncPgConnection, message_id: Uuid) -> Result<bool> {
    let processed_at: Option<Option<DateTime<Utc>>> = inbox_messages::table
        .filter(inbox_messages::message_id.eq(message_id))
        .select(inbox_messages::processed_at)
        .first(conn)
        .await
        .optional()?;

    Ok(matches!(processed_at, Some(Some(_))))
}

/// Records first receipt of a message. Returns false when a row for this
/// message id already exists: a concurrent or earlier delivery owns it and
/// the caller must skip all side effects. Runs on the caller's transaction
/// so the marker and the side effects commit as one unit.
pub async fn save_received(
    conn: &mut AsyncPgConnection,
    message_id: Uuid,
    event: &DomainEvent,
) -> Result<bool> {
    let row = NewInboxMessage::from_event(message_id, event)?;
    let inserted = diesel::insert_into(inbox_messages::table)
        .values(&row)
        .on_conflict(inbox_messages::message_id)
        .do_nothing()
        .execute(conn)
        .await?;

    if inserted == 0 {
        info!(%message_id, "inbox entry already exists");
    }
    Ok(inserted == 1)
}

pub async fn mark_processed(conn: &mut AsyncPgConnection, message_id: Uuid) -> Result<()> {
    diesel::update(inbox_messages::table.filter(inbox_messages::message_id.eq(message_id)))
        .set(inbox_messages::processed_at.eq(Utc::now()))
        .execute(conn)
        .await?;

    Ok(())
}
