use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deriving message ids from business keys.
const MESSAGE_ID_NAMESPACE: Uuid = Uuid::from_u128(0x8f3d_1b42_77aa_4c09_9e51_c0de_ba5e_0001);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub amount: BigDecimal,
    pub created_at: DateTime<Utc>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSucceeded {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub amount: BigDecimal,
    pub processed_at: DateTime<Utc>,
    pub transaction_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentFailed {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub amount: BigDecimal,
    pub processed_at: DateTime<Utc>,
    pub reason: String,
}

/// The closed set of messages exchanged between the services. Serialized
/// with an internal `type` tag so payloads are self-describing on the wire
/// and in the outbox/inbox tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    OrderCreated(OrderCreated),
    PaymentSucceeded(PaymentSucceeded),
    PaymentFailed(PaymentFailed),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    OrderCreated,
    PaymentSucceeded,
    PaymentFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::OrderCreated => "OrderCreated",
            EventKind::PaymentSucceeded => "PaymentSucceeded",
            EventKind::PaymentFailed => "PaymentFailed",
        }
    }

    pub fn from_tag(tag: &str) -> Option<EventKind> {
        match tag {
            "OrderCreated" => Some(EventKind::OrderCreated),
            "PaymentSucceeded" => Some(EventKind::PaymentSucceeded),
            "PaymentFailed" => Some(EventKind::PaymentFailed),
            _ => None,
        }
    }

    /// Queue topology is one durable topic per message kind.
    pub fn topic(&self) -> &'static str {
        self.as_str()
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::OrderCreated(_) => EventKind::OrderCreated,
            DomainEvent::PaymentSucceeded(_) => EventKind::PaymentSucceeded,
            DomainEvent::PaymentFailed(_) => EventKind::PaymentFailed,
        }
    }

    pub fn order_id(&self) -> Uuid {
        match self {
            DomainEvent::OrderCreated(e) => e.order_id,
            DomainEvent::PaymentSucceeded(e) => e.order_id,
            DomainEvent::PaymentFailed(e) => e.order_id,
        }
    }

    /// Dedup identity, derived from the business key rather than carried on
    /// the transport. The same order always yields the same id per kind, so
    /// a redelivered or re-relayed event can never dodge the inbox check.
    pub fn message_id(&self) -> Uuid {
        let name = format!("{}:{}", self.kind().as_str(), self.order_id());
        Uuid::new_v5(&MESSAGE_ID_NAMESPACE, name.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_created(order_id: Uuid) -> DomainEvent {
        DomainEvent::OrderCreated(OrderCreated {
            order_id,
            user_id: Uuid::new_v4(),
            amount: BigDecimal::from(50),
            created_at: Utc::now(),
            description: Some("test order".to_string()),
        })
    }

    #[test]
    fn kind_tags_round_trip() {
        for kind in [
            EventKind::OrderCreated,
            EventKind::PaymentSucceeded,
            EventKind::PaymentFailed,
        ] {
            assert_eq!(EventKind::from_tag(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::from_tag("OrderShipped"), None);
    }

    #[test]
    fn payload_carries_type_tag() {
        let event = order_created(Uuid::new_v4());
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "OrderCreated");

        let back: DomainEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back.kind(), EventKind::OrderCreated);
    }

    #[test]
    fn message_id_is_stable_for_the_same_order() {
        let order_id = Uuid::new_v4();
        let first = order_created(order_id).message_id();
        let second = order_created(order_id).message_id();
        assert_eq!(first, second);
    }

    #[test]
    fn message_id_differs_per_order_and_kind() {
        let order_id = Uuid::new_v4();
        let created = order_created(order_id);
        let failed = DomainEvent::PaymentFailed(PaymentFailed {
            order_id,
            user_id: Uuid::new_v4(),
            amount: BigDecimal::from(50),
            processed_at: Utc::now(),
            reason: "insufficient balance".to_string(),
        });

        assert_ne!(created.message_id(), failed.message_id());
        assert_ne!(
            created.message_id(),
            order_created(Uuid::new_v4()).message_id()
        );
    }
}
