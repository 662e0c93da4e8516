use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Token pairing a request with the reply that eventually answers it.
///
/// Every outgoing request gets a fresh id; the reply listener uses the
/// id echoed on the response to find the pending entry to complete.
/// Generated ids are v4 UUIDs, so collisions in the pending table are
/// not a practical concern. Transports treat the id as an opaque string
/// carried in message properties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh correlation id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_each_request_gets_a_distinct_id() {
        // ---
        let a = CorrelationId::generate();
        let b = CorrelationId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_echoed_id_matches_the_original() {
        // ---
        // A responder copies the id off the wire as a plain string; the
        // rebuilt id must compare equal to the one registered.
        let id = CorrelationId::generate();
        let echoed = CorrelationId::from(id.as_str());
        assert_eq!(id, echoed);
    }

    #[test]
    fn test_serializes_as_a_bare_string() {
        // ---
        let id = CorrelationId::from("abc-123");
        let value = serde_json::to_value(&id).unwrap();
        assert_eq!(value, serde_json::json!("abc-123"));
    }
}
