//! Request/response RPC semantics over an at-most-once pub/sub broker.
//!
//! This library lets independent processes call each other by destination
//! name without a direct connection. A caller receives either a correlated
//! reply, an application-level ack/nack/error result, or a timeout. It
//! handles correlation id generation, request/response matching, broker
//! no-route short-circuiting, timeout sweeping, and concurrent dispatch.
//!
//! # Overview
//!
//! - [`Courier::deliver`] — fire-and-forget delivery.
//! - [`Courier::deliver_with_response`] / [`Courier::async_request`] —
//!   correlated request/response with a deadline.
//! - [`Courier::deliver_with_ack`] — point-to-point delivery with explicit
//!   acknowledgment feedback.
//! - [`Courier::respond_to`] — handle requests on a destination.
//! - [`Courier::tap_into`] — observe messages by wildcard pattern without
//!   consuming them.
//!
//! # Example
//!
//! ```no_run
//! use courier::{Courier, CourierConfig, RequestOptions, Response};
//! use serde_json::json;
//!
//! # async fn example() -> courier::Result<()> {
//! let courier = Courier::connect(CourierConfig::memory()).await?;
//!
//! courier
//!     .respond_to("math.add", |payload, _delivery| async move {
//!         let sum = payload["a"].as_i64().unwrap_or(0) + payload["b"].as_i64().unwrap_or(0);
//!         Response::Ack(json!({ "sum": sum }))
//!     })
//!     .await?;
//!
//! let reply = courier
//!     .deliver_with_response("math.add", json!({"a": 2, "b": 3}), RequestOptions::default())
//!     .await?;
//! assert_eq!(reply["sum"], 5);
//! # Ok(())
//! # }
//! ```

// Import all sub modules once...
mod config;
mod consumer;
mod correlation;
mod courier;
mod error;
mod handlers;
mod message;
mod producer;
mod request_manager;
mod responder;
mod sync_bridge;
mod transport;

pub(crate) mod macros;

// Re-export main types
pub use courier::{Courier, RequestOptions};

pub use config::CourierConfig;

pub use correlation::CorrelationId;
pub use error::{Error, Result};
pub use handlers::Response;
pub use responder::ResponderHandle;

pub use message::{
    //
    Delivery,
    InboundDelivery,
    MessageKind,
    MessageProperties,
    OutboundMessage,
};

pub use producer::{Producer, PublishOptions};

// --- transport re-exports
pub use transport::{
    //
    create_memory_transport,
    create_transport,
    topic_matches,
    ReturnHandler,
    SubscribeOptions,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

#[cfg(feature = "amqp")]
pub use transport::create_amqp_transport;
