use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by courier operations.
#[derive(Error, Debug)]
pub enum Error {
    /// No response arrived within the request deadline.
    #[error("timed out waiting for response")]
    Timeout,

    /// The responder rejected the request, the destination does not exist,
    /// or the delivery was nacked. Carries the error body produced by the
    /// responder (or synthesized by the request manager).
    #[error("request rejected: {0}")]
    Rejected(Value),

    /// A response arrived but carried no usable body.
    #[error("unexpected empty response")]
    EmptyResponse,

    /// JSON encoding or decoding of a payload failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Broker-level failure (publish, subscribe, queue declaration, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation referenced a queue the broker does not know about.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
}

/// Result type alias for courier operations.
pub type Result<T> = std::result::Result<T, Error>;
