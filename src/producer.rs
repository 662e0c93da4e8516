//! Publishing side: payload encoding, option merging, no-route hook.

use serde_json::Value;

use crate::macros::log_debug;
use crate::message::{encode_payload, MessageKind, MessageProperties, OutboundMessage};
use crate::{CorrelationId, Result, TransportPtr};

/// Options merged into a publish.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    // ---
    pub correlation_id: Option<CorrelationId>,
    pub reply_to: Option<String>,
    pub kind: Option<MessageKind>,
    pub ack_required: bool,
    /// Message TTL in milliseconds.
    pub expiration_ms: Option<u64>,
    /// Request broker no-route notification for this publish.
    pub mandatory: bool,
}

/// Publishes payloads to destinations.
///
/// Cheap to clone; all clones share one transport.
#[derive(Clone)]
pub struct Producer {
    // ---
    transport: TransportPtr,
}

impl Producer {
    pub(crate) fn new(transport: TransportPtr) -> Self {
        Self { transport }
    }

    /// Encode `payload` and publish it to `destination`.
    ///
    /// Routing key is the destination name. An empty (`null`) payload is
    /// sent as the literal `"null"` on the wire.
    pub async fn publish(
        &self,
        destination: &str,
        payload: &Value,
        opts: PublishOptions,
    ) -> Result<()> {
        // ---
        log_debug!("publishing to {destination}");

        let message = OutboundMessage {
            routing_key: destination.to_string(),
            payload: encode_payload(payload)?,
            properties: MessageProperties {
                correlation_id: opts.correlation_id,
                reply_to: opts.reply_to,
                kind: opts.kind,
                ack_required: opts.ack_required,
                expiration_ms: opts.expiration_ms,
            },
            mandatory: opts.mandatory,
        };

        self.transport.publish(message).await
    }

    /// Register the hook invoked when the broker reports an unroutable
    /// mandatory message. The hook receives the correlation id of the
    /// returned message, when it carried one.
    pub fn on_no_route(&self, hook: impl Fn(CorrelationId) + Send + Sync + 'static) {
        // ---
        self.transport.on_return(Box::new(move |properties| {
            if let Some(correlation_id) = properties.correlation_id {
                hook(correlation_id);
            }
        }));
    }
}
