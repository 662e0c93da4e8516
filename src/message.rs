//! Wire-facing message types.
//!
//! These types describe the envelope fields this layer consumes and
//! produces, independent of any concrete broker protocol. Transports map
//! them onto whatever their wire format provides (AMQP basic properties,
//! in-memory structs, ...).

use bytes::Bytes;
use serde_json::Value;

use crate::{CorrelationId, Result};

/// Declared kind of a message, carried in its properties.
///
/// Absent kind means fire-and-forget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// A request expecting a correlated reply.
    Request,
    /// A success-typed reply.
    Success,
    /// An error-typed reply.
    Error,
}

impl MessageKind {
    /// Wire representation of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Request => "request",
            MessageKind::Success => "success",
            MessageKind::Error => "error",
        }
    }

    /// Parse the wire representation. Unknown strings map to `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "request" => Some(MessageKind::Request),
            "success" => Some(MessageKind::Success),
            "error" => Some(MessageKind::Error),
            _ => None,
        }
    }
}

/// Message properties carried alongside the payload.
#[derive(Debug, Clone, Default)]
pub struct MessageProperties {
    // ---
    /// Token linking a request to its reply.
    pub correlation_id: Option<CorrelationId>,

    /// Destination a responder publishes its reply to.
    pub reply_to: Option<String>,

    /// Declared kind (`request` / `success` / `error`); absent for
    /// fire-and-forget deliveries.
    pub kind: Option<MessageKind>,

    /// Header flag selecting the ack-only handler variant.
    pub ack_required: bool,

    /// Message TTL in milliseconds. Set from the request timeout when the
    /// caller opts into deleting the message on timeout.
    pub expiration_ms: Option<u64>,
}

/// A message handed to a transport for publication.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    // ---
    /// Routing key; equals the destination name.
    pub routing_key: String,

    /// Encoded payload bytes.
    pub payload: Bytes,

    /// Envelope properties.
    pub properties: MessageProperties,

    /// When true, the broker reports back if no queue is bound to the
    /// routing key (enables no-route detection).
    pub mandatory: bool,
}

/// A raw delivery as produced by a transport, payload still encoded.
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    pub payload: Bytes,
    pub properties: MessageProperties,
    pub routing_key: String,
    /// Opaque broker handle used for ack/reject.
    pub delivery_tag: u64,
}

/// A decoded delivery as seen by message handlers.
///
/// Immutable once received; owned by the handler invocation created
/// for it.
#[derive(Debug)]
pub struct Delivery {
    pub payload: Value,
    pub properties: MessageProperties,
    pub routing_key: String,
    pub delivery_tag: u64,
}

impl Delivery {
    pub(crate) fn decode(inbound: InboundDelivery) -> Result<Self> {
        Ok(Self {
            payload: parse_payload(&inbound.payload)?,
            properties: inbound.properties,
            routing_key: inbound.routing_key,
            delivery_tag: inbound.delivery_tag,
        })
    }
}

/// Encode a payload for the wire.
///
/// An empty/absent payload is special-cased as the literal `"null"`.
pub(crate) fn encode_payload(payload: &Value) -> Result<Bytes> {
    if payload.is_null() {
        return Ok(Bytes::from_static(b"null"));
    }
    Ok(Bytes::from(serde_json::to_vec(payload)?))
}

/// Decode a wire payload.
///
/// The literal `"null"` decodes to an empty object rather than an
/// absence, so handlers always see a structured value.
pub(crate) fn parse_payload(bytes: &[u8]) -> Result<Value> {
    let value: Value = serde_json::from_slice(bytes)?;
    if value.is_null() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    Ok(value)
}
