//! Blocking-call bridge over one async request callback.
//!
//! A one-shot container: the request's completion callback stores the
//! result, `wait_for_response` suspends the caller until it arrives or
//! the timeout elapses. Built directly on the async request path; this
//! is a consumer of exactly one callback invocation, not a separate
//! protocol.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::message::{Delivery, MessageKind};
use crate::request_manager::ResponseCallback;
use crate::{Error, Result};

pub(crate) struct SyncResponseContainer {
    // ---
    rx: oneshot::Receiver<(Value, Option<Delivery>)>,
}

impl SyncResponseContainer {
    /// Create the container and the completion callback feeding it.
    pub fn pair() -> (ResponseCallback, Self) {
        // ---
        let (tx, rx) = oneshot::channel();
        let callback: ResponseCallback = Box::new(move |payload, delivery| {
            // The waiter may have given up already; nothing to do then.
            let _ = tx.send((payload, delivery));
        });
        (callback, Self { rx })
    }

    /// Suspend until a result is stored or `timeout` elapses.
    ///
    /// Resolution policy:
    /// - nothing within `timeout` → [`Error::Timeout`]
    /// - a timeout completion from the sweep → [`Error::Timeout`]
    /// - a null result → [`Error::EmptyResponse`]
    /// - a synthetic completion (no delivery) or an error-typed reply →
    ///   [`Error::Rejected`] carrying the response body
    /// - otherwise the response payload
    pub async fn wait_for_response(self, timeout: Duration) -> Result<Value> {
        // ---
        let (payload, delivery) = match tokio::time::timeout(timeout, self.rx).await {
            Err(_) => return Err(Error::Timeout),
            // Sender dropped without completing: the request was forgotten.
            Ok(Err(_)) => return Err(Error::EmptyResponse),
            Ok(Ok(result)) => result,
        };

        if payload.is_null() {
            return Err(Error::EmptyResponse);
        }
        if payload.get("error").and_then(Value::as_str) == Some("RequestTimeout") {
            return Err(Error::Timeout);
        }
        match delivery {
            None => Err(Error::Rejected(payload)),
            Some(delivery) if delivery.properties.kind == Some(MessageKind::Error) => {
                Err(Error::Rejected(payload))
            }
            Some(_) => Ok(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::message::MessageProperties;
    use serde_json::json;

    fn delivery(kind: MessageKind) -> Delivery {
        Delivery {
            payload: json!({}),
            properties: MessageProperties {
                kind: Some(kind),
                ..MessageProperties::default()
            },
            routing_key: "replies".into(),
            delivery_tag: 1,
        }
    }

    #[tokio::test]
    async fn test_success_reply_returns_payload() {
        // ---
        let (callback, container) = SyncResponseContainer::pair();
        callback(json!({"result": 1}), Some(delivery(MessageKind::Success)));

        let value = container
            .wait_for_response(Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(value, json!({"result": 1}));
    }

    #[tokio::test]
    async fn test_no_result_times_out() {
        // ---
        let (_callback, container) = SyncResponseContainer::pair();
        let err = container
            .wait_for_response(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[tokio::test]
    async fn test_sweep_timeout_maps_to_timeout_error() {
        // ---
        let (callback, container) = SyncResponseContainer::pair();
        callback(
            json!({"error": "RequestTimeout", "message": "Timed out waiting for response"}),
            None,
        );

        let err = container
            .wait_for_response(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[tokio::test]
    async fn test_error_reply_maps_to_rejected() {
        // ---
        let (callback, container) = SyncResponseContainer::pair();
        callback(json!({"error": "boom"}), Some(delivery(MessageKind::Error)));

        match container
            .wait_for_response(Duration::from_millis(100))
            .await
        {
            Err(Error::Rejected(body)) => assert_eq!(body["error"], "boom"),
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_route_completion_maps_to_rejected() {
        // ---
        let (callback, container) = SyncResponseContainer::pair();
        callback(json!({"error": "Specified destination does not exist"}), None);

        match container
            .wait_for_response(Duration::from_millis(100))
            .await
        {
            Err(Error::Rejected(body)) => {
                assert_eq!(body["error"], "Specified destination does not exist")
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_null_result_is_empty_response() {
        // ---
        let (callback, container) = SyncResponseContainer::pair();
        callback(Value::Null, Some(delivery(MessageKind::Success)));

        let err = container
            .wait_for_response(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyResponse));
    }
}
