//! Transport abstractions.
//!
//! A `Transport` provides best-effort, at-most-once delivery of messages
//! between producers and subscribers. It defines the minimal broker
//! contract required by the request/response layer without committing to
//! any specific protocol: queue declaration and topic binding, publish
//! with a mandatory flag, subscribe, delivery ack/reject, and a hook for
//! broker-reported unroutable messages.
//!
//! Stronger semantics (correlation, timeouts, no-route completion) are
//! provided by higher layers. The in-memory transport is the reference
//! implementation of these semantics.

mod memory;

#[cfg(feature = "amqp")]
mod amqp;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{CourierConfig, InboundDelivery, MessageProperties, OutboundMessage, Result};

pub use memory::create_memory_transport;

#[cfg(feature = "amqp")]
pub use amqp::create_amqp_transport;

/// Hook invoked when the broker reports a mandatory message it could not
/// route to any queue. Receives the properties of the returned message.
pub type ReturnHandler = Box<dyn Fn(MessageProperties) + Send + Sync>;

/// Subscription acknowledgment mode and queue options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// When true, deliveries must be explicitly acked or rejected through
    /// the transport; when false the transport acknowledges on delivery.
    pub manual_ack: bool,
}

/// Handle returned from a successful subscription.
///
/// The subscription remains active until it is canceled through the
/// transport or the transport is closed. Dropping the handle stops
/// local delivery but does not cancel the broker-side consumer.
pub struct SubscriptionHandle {
    // ---
    /// Receiver channel for deliveries on this subscription.
    pub inbox: mpsc::UnboundedReceiver<InboundDelivery>,

    /// Broker-assigned consumer identity, used for cancellation.
    pub consumer_tag: String,

    /// Name of the backing queue.
    pub queue: String,
}

/// Broker transport capability.
///
/// Implementations must ensure that:
/// - Once `subscribe()` returns successfully, matching messages published
///   after that point are deliverable.
/// - `publish()` is non-blocking with respect to subscribers.
/// - No ordering, durability, or retry guarantees beyond what is
///   explicitly documented.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Declare a queue. An empty name requests a server-named queue; the
    /// actual name is returned either way.
    async fn declare_queue(&self, name: &str) -> Result<String>;

    /// Bind a queue to the topic exchange with a wildcard routing pattern
    /// (`*` = exactly one word, `#` = zero or more words).
    async fn bind_topic(&self, queue: &str, pattern: &str) -> Result<()>;

    /// Publish a message. Routing key selects the destination queue;
    /// every publish is additionally visible to matching topic bindings.
    async fn publish(&self, message: OutboundMessage) -> Result<()>;

    /// Subscribe to a declared queue and return a delivery handle.
    async fn subscribe(&self, queue: &str, opts: SubscribeOptions) -> Result<SubscriptionHandle>;

    /// Acknowledge a delivery back to the broker.
    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Reject a delivery back to the broker.
    async fn reject(&self, delivery_tag: u64) -> Result<()>;

    /// Cancel a consumer. Queued messages stay on the queue.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Delete a queue and drop any messages it holds.
    async fn delete_queue(&self, name: &str) -> Result<()>;

    /// Register the unroutable-message hook. At most one hook is active;
    /// a later registration replaces the earlier one.
    fn on_return(&self, handler: ReturnHandler);

    /// Close the transport and release associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
pub type TransportPtr = Arc<dyn Transport>;

/// Create a transport from the configuration.
///
/// A configured URI selects the AMQP transport (requires the `amqp`
/// feature); otherwise the in-memory transport is used.
pub async fn create_transport(config: &CourierConfig) -> Result<TransportPtr> {
    // ---
    #[cfg(feature = "amqp")]
    if config.uri.is_some() {
        return create_amqp_transport(config).await;
    }

    #[cfg(not(feature = "amqp"))]
    if config.uri.is_some() {
        return Err(crate::Error::Transport(
            "broker URI configured but the amqp feature is disabled".into(),
        ));
    }

    create_memory_transport(config).await
}

/// AMQP-style topic match of a routing key against a wildcard pattern.
///
/// Words are dot-separated; `*` matches exactly one word and `#` matches
/// zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_from(&pattern, &key)
}

fn matches_from(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // `#` absorbs zero or more words.
            (0..=key.len()).any(|skip| matches_from(rest, &key[skip..]))
        }
        Some((word, rest)) => match key.split_first() {
            Some((head, tail)) if *word == "*" || word == head => matches_from(rest, tail),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_star_matches_one_word() {
        // ---
        assert!(topic_matches("somebody.*.love", "somebody.to.love"));
        assert!(!topic_matches("somebody.*.love", "somebody.not.to.love"));
        assert!(!topic_matches("somebody.*.love", "somebody.love"));
    }

    #[test]
    fn test_hash_matches_zero_or_more_words() {
        // ---
        assert!(topic_matches("i.#.free", "i.want.to.break.free"));
        assert!(topic_matches("i.#.free", "i.free"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("i.#.free", "you.want.to.break.free"));
    }

    #[test]
    fn test_exact_match() {
        // ---
        assert!(topic_matches("orders.created", "orders.created"));
        assert!(!topic_matches("orders.created", "orders.deleted"));
    }
}
