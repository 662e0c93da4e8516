//! Per-delivery handler state machine.
//!
//! Each delivery is classified once, by a pure function over its
//! properties, into one of three handler variants:
//!
//! - **Standard**: fire-and-forget; acknowledgment operations are no-ops.
//! - **Request**: correlation-aware; ack/error publish a typed reply to
//!   the delivery's reply-to destination.
//! - **AckOnly**: point-to-point with explicit feedback; ack/nack settle
//!   the delivery with the broker and, when a reply-to is present, feed
//!   the outcome back to the producer side.
//!
//! The state machine is terminal: at most one of ack/nack/error takes
//! effect per delivery, later calls are logged no-ops.

use serde_json::{json, Value};

use crate::macros::{log_debug, log_warn};
use crate::message::{Delivery, MessageKind};
use crate::producer::{Producer, PublishOptions};
use crate::{CorrelationId, Result, TransportPtr};

/// Outcome returned from a responder handler.
///
/// An explicit tagged result instead of exception-driven control flow:
/// the dispatch boundary turns it into a reply, a broker ack/reject, or
/// nothing, depending on the delivery's handler variant.
#[derive(Debug, Clone)]
pub enum Response {
    /// Positive outcome, carrying the reply payload (may be `Null`).
    Ack(Value),
    /// Negative outcome with an optional reason surfaced to the producer.
    Nack(Option<String>),
    /// Error outcome carrying an error body for the producer.
    Error(Value),
}

impl Response {
    /// Positive outcome with no payload.
    pub fn ack() -> Self {
        Response::Ack(Value::Null)
    }

    /// Negative outcome with a reason.
    pub fn nack(reason: impl Into<String>) -> Self {
        Response::Nack(Some(reason.into()))
    }
}

/// Closed set of handler variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerVariant {
    Standard,
    Request,
    AckOnly,
}

/// Classify a delivery by its properties. Pure.
pub(crate) fn classify(kind: Option<MessageKind>, ack_required: bool) -> HandlerVariant {
    // ---
    if kind == Some(MessageKind::Request) {
        HandlerVariant::Request
    } else if ack_required {
        HandlerVariant::AckOnly
    } else {
        HandlerVariant::Standard
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerState {
    Pending,
    Acked,
    Nacked,
    Errored,
}

/// Mutable per-delivery state machine driving acknowledgment.
pub(crate) struct MessageHandler {
    // ---
    variant: HandlerVariant,
    state: HandlerState,
    producer: Producer,
    transport: TransportPtr,
    destination: String,
    correlation_id: Option<CorrelationId>,
    reply_to: Option<String>,
    delivery_tag: u64,
}

impl MessageHandler {
    pub fn new(
        variant: HandlerVariant,
        producer: Producer,
        transport: TransportPtr,
        delivery: &Delivery,
    ) -> Self {
        // ---
        Self {
            variant,
            state: HandlerState::Pending,
            producer,
            transport,
            destination: delivery.routing_key.clone(),
            correlation_id: delivery.properties.correlation_id.clone(),
            reply_to: delivery.properties.reply_to.clone(),
            delivery_tag: delivery.delivery_tag,
        }
    }

    /// Apply a handler outcome to this delivery.
    pub async fn apply(&mut self, outcome: Response) -> Result<()> {
        // ---
        match outcome {
            Response::Ack(payload) => self.ack(payload).await,
            Response::Nack(reason) => self.nack(reason).await,
            Response::Error(payload) => self.error(payload).await,
        }
    }

    /// Positive acknowledgment.
    pub async fn ack(&mut self, response: Value) -> Result<()> {
        // ---
        if !self.transition(HandlerState::Acked) {
            return Ok(());
        }

        match self.variant {
            HandlerVariant::Standard => Ok(()),
            HandlerVariant::Request => {
                self.send_reply(response, MessageKind::Success).await
            }
            HandlerVariant::AckOnly => {
                self.transport.ack(self.delivery_tag).await?;
                if self.reply_to.is_some() {
                    self.send_reply(Value::Null, MessageKind::Success).await?;
                }
                Ok(())
            }
        }
    }

    /// Negative acknowledgment with an optional reason.
    pub async fn nack(&mut self, reason: Option<String>) -> Result<()> {
        // ---
        if !self.transition(HandlerState::Nacked) {
            return Ok(());
        }

        let body = json!({
            "error": reason.unwrap_or_else(|| "Delivery was nacked".to_string()),
        });

        match self.variant {
            HandlerVariant::Standard => Ok(()),
            HandlerVariant::Request => self.send_reply(body, MessageKind::Error).await,
            HandlerVariant::AckOnly => {
                self.transport.reject(self.delivery_tag).await?;
                if self.reply_to.is_some() {
                    self.send_reply(body, MessageKind::Error).await?;
                }
                Ok(())
            }
        }
    }

    /// Error outcome carrying an error body.
    pub async fn error(&mut self, response: Value) -> Result<()> {
        // ---
        if !self.transition(HandlerState::Errored) {
            return Ok(());
        }

        match self.variant {
            HandlerVariant::Standard => Ok(()),
            HandlerVariant::Request => self.send_reply(response, MessageKind::Error).await,
            HandlerVariant::AckOnly => {
                self.transport.reject(self.delivery_tag).await?;
                if self.reply_to.is_some() {
                    self.send_reply(response, MessageKind::Error).await?;
                }
                Ok(())
            }
        }
    }

    fn transition(&mut self, next: HandlerState) -> bool {
        // ---
        if self.state != HandlerState::Pending {
            log_warn!(
                "ignoring {next:?} for delivery from {}: already {:?}",
                self.destination,
                self.state
            );
            return false;
        }
        self.state = next;
        true
    }

    async fn send_reply(&self, response: Value, kind: MessageKind) -> Result<()> {
        // ---
        let Some(reply_to) = self.reply_to.as_deref() else {
            log_debug!(
                "no reply-to on delivery from {}, dropping {kind:?} reply",
                self.destination
            );
            return Ok(());
        };

        self.producer
            .publish(
                reply_to,
                &response,
                PublishOptions {
                    correlation_id: self.correlation_id.clone(),
                    kind: Some(kind),
                    ..PublishOptions::default()
                },
            )
            .await
    }
}
