//! Subscribing side: queue subscription and delivery dispatch.
//!
//! Each subscription runs one dispatch loop task. Every delivery is
//! handled on its own spawned task, gated by a semaphore sized to the
//! channel's prefetch limit, so one slow or failing handler never blocks
//! the others and concurrency stays bounded.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};

use crate::handlers::{classify, HandlerVariant, MessageHandler, Response};
use crate::macros::{log_debug, log_error};
use crate::message::{Delivery, InboundDelivery};
use crate::producer::Producer;
use crate::responder::ResponderHandle;
use crate::transport::SubscribeOptions;
use crate::{Result, TransportPtr};

pub(crate) type DispatchFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// Type-erased responder handler: (payload, delivery) → outcome.
pub(crate) type DispatchHandler = Arc<dyn Fn(Value, Delivery) -> DispatchFuture + Send + Sync>;

pub(crate) type TapFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Type-erased tap handler: (payload, routing key) → ().
pub(crate) type TapHandler = Arc<dyn Fn(Value, String) -> TapFuture + Send + Sync>;

/// Consumes deliveries from destinations and dispatches them to handlers.
#[derive(Clone)]
pub(crate) struct Consumer {
    // ---
    transport: TransportPtr,
    producer: Producer,
    prefetch: u32,
}

impl Consumer {
    pub fn new(transport: TransportPtr, producer: Producer, prefetch: u16) -> Self {
        // ---
        Self {
            transport,
            producer,
            prefetch: u32::from(prefetch).max(1),
        }
    }

    /// Declare `destination` as a queue and consume from it.
    pub async fn subscribe(
        &self,
        destination: &str,
        handler: DispatchHandler,
    ) -> Result<ResponderHandle> {
        // ---
        let queue = self.transport.declare_queue(destination).await?;
        self.subscribe_queue(&queue, handler).await
    }

    /// Consume from an already-declared queue.
    pub async fn subscribe_queue(
        &self,
        queue: &str,
        handler: DispatchHandler,
    ) -> Result<ResponderHandle> {
        // ---
        let sub = self
            .transport
            .subscribe(queue, SubscribeOptions { manual_ack: true })
            .await?;
        log_debug!("consuming messages on {queue}");

        let semaphore = Arc::new(Semaphore::new(self.prefetch as usize));
        let loop_task = tokio::spawn(dispatch_loop(
            sub.inbox,
            handler,
            self.producer.clone(),
            self.transport.clone(),
            Arc::clone(&semaphore),
        ));

        Ok(ResponderHandle::new(
            self.transport.clone(),
            sub.queue,
            sub.consumer_tag,
            loop_task,
            semaphore,
            self.prefetch,
        ))
    }

    /// Observe every message whose routing key matches a wildcard pattern
    /// (`*` = one word, `#` = zero or more words) without competing for it.
    pub async fn tap_into(&self, pattern: &str, handler: TapHandler) -> Result<ResponderHandle> {
        // ---
        let queue = self.transport.declare_queue("").await?;
        self.transport.bind_topic(&queue, pattern).await?;

        let sub = self
            .transport
            .subscribe(&queue, SubscribeOptions::default())
            .await?;
        log_debug!("tapping into messages that match {pattern}");

        let semaphore = Arc::new(Semaphore::new(self.prefetch as usize));
        let loop_task = tokio::spawn(tap_loop(sub.inbox, handler, Arc::clone(&semaphore)));

        Ok(ResponderHandle::new(
            self.transport.clone(),
            sub.queue,
            sub.consumer_tag,
            loop_task,
            semaphore,
            self.prefetch,
        ))
    }
}

async fn dispatch_loop(
    mut inbox: mpsc::UnboundedReceiver<InboundDelivery>,
    handler: DispatchHandler,
    producer: Producer,
    transport: TransportPtr,
    semaphore: Arc<Semaphore>,
) {
    // ---
    while let Some(inbound) = inbox.recv().await {
        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let handler = Arc::clone(&handler);
        let producer = producer.clone();
        let transport = transport.clone();

        tokio::spawn(async move {
            let _permit = permit;
            dispatch_one(inbound, handler, producer, transport).await;
        });
    }
    log_debug!("dispatch loop ended");
}

async fn dispatch_one(
    inbound: InboundDelivery,
    handler: DispatchHandler,
    producer: Producer,
    transport: TransportPtr,
) {
    // ---
    let delivery = match Delivery::decode(inbound) {
        Ok(delivery) => delivery,
        Err(err) => {
            log_error!("failed to decode delivery: {err}");
            return;
        }
    };

    let variant = classify(delivery.properties.kind, delivery.properties.ack_required);

    // Ack-only deliveries are settled by the handler outcome; everything
    // else is acknowledged on receipt.
    if variant != HandlerVariant::AckOnly {
        if let Err(err) = transport.ack(delivery.delivery_tag).await {
            log_error!("failed to ack delivery on {}: {err}", delivery.routing_key);
        }
    }

    // A request without a correlation id is a protocol violation: there
    // is no way to reply, so it is reported and dropped.
    if variant == HandlerVariant::Request && delivery.properties.correlation_id.is_none() {
        log_error!(
            "received request without correlation id on {}",
            delivery.routing_key
        );
        return;
    }

    let destination = delivery.routing_key.clone();
    let correlation_id = delivery.properties.correlation_id.clone();
    let payload = delivery.payload.clone();
    let mut msg_handler = MessageHandler::new(variant, producer, transport, &delivery);

    match AssertUnwindSafe(handler(payload, delivery)).catch_unwind().await {
        Ok(outcome) => {
            if let Err(err) = msg_handler.apply(outcome).await {
                log_error!(
                    "failed to settle delivery from {destination} \
                     (correlation id {correlation_id:?}): {err}"
                );
            }
        }
        Err(panic) => {
            // The dispatch path must survive arbitrarily failing handlers.
            log_error!(
                "handler panicked while processing message from {destination} \
                 (correlation id {correlation_id:?}): {}",
                panic_message(&panic)
            );
        }
    }
}

async fn tap_loop(
    mut inbox: mpsc::UnboundedReceiver<InboundDelivery>,
    handler: TapHandler,
    semaphore: Arc<Semaphore>,
) {
    // ---
    while let Some(inbound) = inbox.recv().await {
        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let handler = Arc::clone(&handler);

        tokio::spawn(async move {
            let _permit = permit;

            let delivery = match Delivery::decode(inbound) {
                Ok(delivery) => delivery,
                Err(err) => {
                    log_error!("failed to decode tapped delivery: {err}");
                    return;
                }
            };
            let routing_key = delivery.routing_key.clone();

            let fut = handler(delivery.payload, delivery.routing_key);
            if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                log_error!(
                    "tap handler panicked for routing key {routing_key}: {}",
                    panic_message(&panic)
                );
            }
        });
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> &str {
    // ---
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
