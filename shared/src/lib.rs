pub mod bus;
pub mod messages;

pub use bus::{ConsumeError, MessageBus};
pub use messages::{DomainEvent, EventKind, OrderCreated, PaymentFailed, PaymentSucceeded};
