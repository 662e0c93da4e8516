//! In-memory transport implementation.
//!
//! This transport simulates a message broker entirely within the process
//! and is the **reference implementation** of transport semantics. Other
//! transports are expected to approximate this behavior as closely as
//! their underlying systems allow.
//!
//! ## Semantics
//!
//! - Queues buffer messages until a consumer subscribes; competing
//!   consumers on one queue receive deliveries round-robin.
//! - Topic bindings receive a copy of every matching publish without
//!   competing for it.
//! - A mandatory publish whose routing key matches no queue invokes the
//!   registered return hook (no-route).
//! - A message TTL is honored on drain: a consumer that subscribes after
//!   the TTL elapsed never sees the message.
//!
//! ## Non-goals
//!
//! - Persistence, redelivery of unacked messages, network failure modes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::macros::log_debug;
use crate::{
    // ---
    CourierConfig,
    Error,
    InboundDelivery,
    MessageProperties,
    OutboundMessage,
    Result,
    ReturnHandler,
    SubscribeOptions,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

use super::topic_matches;

struct Stored {
    // ---
    payload: Bytes,
    properties: MessageProperties,
    routing_key: String,
    expires_at: Option<Instant>,
}

struct ConsumerEntry {
    // ---
    tag: String,
    tx: mpsc::UnboundedSender<InboundDelivery>,
}

#[derive(Default)]
struct QueueState {
    // ---
    backlog: VecDeque<Stored>,
    consumers: Vec<ConsumerEntry>,
    /// Round-robin cursor over consumers.
    rr: usize,
}

#[derive(Default)]
struct BrokerState {
    // ---
    queues: HashMap<String, QueueState>,
    /// Topic bindings: (queue name, wildcard pattern).
    bindings: Vec<(String, String)>,
    /// consumer tag → queue name, for cancellation.
    consumer_queues: HashMap<String, String>,
}

/// In-process broker backing the memory transport.
struct MemoryTransport {
    // ---
    state: Mutex<BrokerState>,
    next_tag: AtomicU64,
    return_handler: StdMutex<Option<ReturnHandler>>,
}

impl MemoryTransport {
    fn next_delivery_tag(&self) -> u64 {
        self.next_tag.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Deliver to one queue: a live consumer if any, the backlog otherwise.
    fn deliver_to_queue(&self, queue: &mut QueueState, stored: Stored) {
        // Prune consumers whose handle was dropped.
        queue.consumers.retain(|c| !c.tx.is_closed());

        if queue.consumers.is_empty() {
            queue.backlog.push_back(stored);
            return;
        }

        let idx = queue.rr % queue.consumers.len();
        queue.rr = queue.rr.wrapping_add(1);

        let delivery = InboundDelivery {
            payload: stored.payload,
            properties: stored.properties,
            routing_key: stored.routing_key,
            delivery_tag: self.next_delivery_tag(),
        };
        // A send failure means the consumer vanished between the prune and
        // now; the message is dropped, matching at-most-once semantics.
        let _ = queue.consumers[idx].tx.send(delivery);
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    async fn declare_queue(&self, name: &str) -> Result<String> {
        // ---
        let name = if name.is_empty() {
            format!("gen-{}", Uuid::new_v4())
        } else {
            name.to_string()
        };

        let mut state = self.state.lock().await;
        state.queues.entry(name.clone()).or_default();
        Ok(name)
    }

    async fn bind_topic(&self, queue: &str, pattern: &str) -> Result<()> {
        // ---
        let mut state = self.state.lock().await;
        if !state.queues.contains_key(queue) {
            return Err(Error::UnknownQueue(queue.to_string()));
        }
        state.bindings.push((queue.to_string(), pattern.to_string()));
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        // ---
        let expires_at = message
            .properties
            .expiration_ms
            .map(|ms| Instant::now() + std::time::Duration::from_millis(ms));

        let mut routed = false;
        {
            let mut state = self.state.lock().await;

            // Direct route: the queue named by the routing key.
            if let Some(queue) = state.queues.get_mut(&message.routing_key) {
                routed = true;
                self.deliver_to_queue(
                    queue,
                    Stored {
                        payload: message.payload.clone(),
                        properties: message.properties.clone(),
                        routing_key: message.routing_key.clone(),
                        expires_at,
                    },
                );
            }

            // Topic route: every binding matching the routing key gets a
            // non-competing copy.
            let matched: Vec<String> = state
                .bindings
                .iter()
                .filter(|(_, pattern)| topic_matches(pattern, &message.routing_key))
                .map(|(queue, _)| queue.clone())
                .collect();
            for queue_name in matched {
                if let Some(queue) = state.queues.get_mut(&queue_name) {
                    self.deliver_to_queue(
                        queue,
                        Stored {
                            payload: message.payload.clone(),
                            properties: message.properties.clone(),
                            routing_key: message.routing_key.clone(),
                            expires_at,
                        },
                    );
                }
            }
        }

        if !routed && message.mandatory {
            log_debug!(
                "no route for mandatory publish to {}, reporting return",
                message.routing_key
            );
            let handler = self.return_handler.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(handler) = handler.as_ref() {
                handler(message.properties);
            }
        }

        Ok(())
    }

    async fn subscribe(&self, queue: &str, _opts: SubscribeOptions) -> Result<SubscriptionHandle> {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();
        let tag = format!("ctag-{}", Uuid::new_v4());

        let mut state = self.state.lock().await;
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::UnknownQueue(queue.to_string()))?;

        // Drain the backlog to the new consumer, skipping expired messages.
        let now = Instant::now();
        while let Some(stored) = queue_state.backlog.pop_front() {
            if stored.expires_at.is_some_and(|at| at <= now) {
                log_debug!("dropping expired message on {queue}");
                continue;
            }
            let delivery = InboundDelivery {
                payload: stored.payload,
                properties: stored.properties,
                routing_key: stored.routing_key,
                delivery_tag: self.next_delivery_tag(),
            };
            let _ = tx.send(delivery);
        }

        queue_state.consumers.push(ConsumerEntry {
            tag: tag.clone(),
            tx,
        });
        state
            .consumer_queues
            .insert(tag.clone(), queue.to_string());

        Ok(SubscriptionHandle {
            inbox: rx,
            consumer_tag: tag,
            queue: queue.to_string(),
        })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        // At-most-once broker; nothing to settle.
        log_debug!("ack delivery {delivery_tag}");
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64) -> Result<()> {
        log_debug!("reject delivery {delivery_tag}");
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        // ---
        let mut state = self.state.lock().await;
        if let Some(queue_name) = state.consumer_queues.remove(consumer_tag) {
            if let Some(queue) = state.queues.get_mut(&queue_name) {
                queue.consumers.retain(|c| c.tag != consumer_tag);
            }
        }
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        // ---
        let mut state = self.state.lock().await;
        if state.queues.remove(name).is_none() {
            return Err(Error::UnknownQueue(name.to_string()));
        }
        state.bindings.retain(|(queue, _)| queue != name);
        state.consumer_queues.retain(|_, queue| queue != name);
        Ok(())
    }

    fn on_return(&self, handler: ReturnHandler) {
        let mut slot = self.return_handler.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(handler);
    }

    async fn close(&self) -> Result<()> {
        // ---
        let mut state = self.state.lock().await;
        state.queues.clear();
        state.bindings.clear();
        state.consumer_queues.clear();
        Ok(())
    }
}

/// Create a new in-memory transport.
///
/// Always available and requires no external resources.
pub async fn create_memory_transport(_config: &CourierConfig) -> Result<TransportPtr> {
    // ---
    Ok(Arc::new(MemoryTransport {
        state: Mutex::new(BrokerState::default()),
        next_tag: AtomicU64::new(0),
        return_handler: StdMutex::new(None),
    }))
}
