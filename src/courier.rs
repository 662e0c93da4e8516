//! The `Courier` facade: request/response and point-to-point delivery
//! over one broker connection.
//!
//! # Architecture
//!
//! A courier lazily creates one server-named reply queue shared by all
//! outstanding requests. Each request registers a pending entry
//! {correlation id, destination, callback, deadline} with the request
//! manager and publishes with `mandatory` set, so the broker reports
//! unroutable destinations. Three paths race to complete an entry:
//! response arrival on the reply queue, the broker no-route signal, and
//! the timeout sweep; exactly one wins per correlation id.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::consumer::{Consumer, DispatchFuture, DispatchHandler, TapFuture, TapHandler};
use crate::handlers::Response;
use crate::macros::{log_debug, log_warn};
use crate::message::{Delivery, MessageKind};
use crate::producer::{Producer, PublishOptions};
use crate::request_manager::RequestManager;
use crate::responder::ResponderHandle;
use crate::sync_bridge::SyncResponseContainer;
use crate::transport::create_transport;
use crate::{CorrelationId, CourierConfig, Result, TransportPtr};

/// Grace added to the synchronous wait over the request deadline, so the
/// sweep path wins the race and reports the richer timeout error.
const SYNC_WAIT_GRACE: Duration = Duration::from_millis(100);

/// Per-request options.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    // ---
    /// Response deadline; the config default when `None`.
    pub timeout: Option<Duration>,

    /// When true, the request message expires at the deadline so a late
    /// consumer never processes an already-timed-out request.
    pub delete_on_timeout: bool,
}

impl RequestOptions {
    /// Set an explicit response deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Expire the request message at the deadline.
    pub fn with_delete_on_timeout(mut self) -> Self {
        self.delete_on_timeout = true;
        self
    }
}

struct ReplyListener {
    // ---
    queue: String,
    handle: ResponderHandle,
}

struct Inner {
    // ---
    transport: TransportPtr,
    producer: Producer,
    consumer: Consumer,
    request_manager: Arc<RequestManager>,
    config: CourierConfig,
    /// Lazily created shared reply listener; one per courier, serving
    /// arbitrarily many concurrent correlation ids.
    reply: Mutex<Option<ReplyListener>>,
}

/// Running courier instance.
///
/// Cheap to clone (internally `Arc`-backed).
#[derive(Clone)]
pub struct Courier {
    inner: Arc<Inner>,
}

impl Courier {
    /// Create a courier over an explicitly provided transport.
    ///
    /// This is the constructor you want for tests and for advanced users;
    /// several couriers may share one transport.
    pub fn with_transport(transport: TransportPtr, config: CourierConfig) -> Self {
        // ---
        let producer = Producer::new(transport.clone());
        let consumer = Consumer::new(transport.clone(), producer.clone(), config.prefetch);
        let request_manager = Arc::new(RequestManager::new(config.sweep_interval));

        // Broker-reported unroutable requests complete immediately instead
        // of waiting out the deadline.
        let manager = Arc::clone(&request_manager);
        producer.on_no_route(move |correlation_id| manager.no_route(&correlation_id));

        Self {
            inner: Arc::new(Inner {
                transport,
                producer,
                consumer,
                request_manager,
                config,
                reply: Mutex::new(None),
            }),
        }
    }

    /// Create a courier with the config-selected transport.
    pub async fn connect(config: CourierConfig) -> Result<Self> {
        // ---
        let transport = create_transport(&config).await?;
        Ok(Self::with_transport(transport, config))
    }

    /// Fire-and-forget delivery to a destination.
    pub async fn deliver(&self, destination: &str, payload: Value) -> Result<()> {
        // ---
        self.inner
            .producer
            .publish(destination, &payload, PublishOptions::default())
            .await
    }

    /// Point-to-point delivery with acknowledgment feedback.
    ///
    /// The callback receives `None` when the responder acked the delivery
    /// and `Some(error body)` when it was nacked, unroutable, or timed
    /// out.
    pub async fn deliver_with_ack(
        &self,
        destination: &str,
        payload: Value,
        timeout: Option<Duration>,
        callback: impl FnOnce(Option<Value>) + Send + 'static,
    ) -> Result<()> {
        // ---
        let reply_queue = self.ensure_reply_listener().await?;
        let timeout = timeout.unwrap_or(self.inner.config.default_timeout);
        let correlation_id = CorrelationId::generate();

        self.inner.request_manager.register(
            correlation_id.clone(),
            destination,
            timeout,
            Box::new(move |payload, delivery| {
                // ---
                let acked = matches!(
                    &delivery,
                    Some(d) if d.properties.kind != Some(MessageKind::Error)
                );
                callback(if acked { None } else { Some(payload) });
            }),
        );

        let published = self
            .inner
            .producer
            .publish(
                destination,
                &payload,
                PublishOptions {
                    correlation_id: Some(correlation_id.clone()),
                    reply_to: Some(reply_queue),
                    ack_required: true,
                    mandatory: true,
                    ..PublishOptions::default()
                },
            )
            .await;

        if let Err(err) = published {
            self.inner.request_manager.forget(&correlation_id);
            return Err(err);
        }
        Ok(())
    }

    /// Issue an asynchronous request.
    ///
    /// The callback is invoked exactly once, via exactly one of: response
    /// arrival, broker no-route notification, or deadline expiry. Returns
    /// the correlation id assigned to the request.
    pub async fn async_request(
        &self,
        destination: &str,
        payload: Value,
        opts: RequestOptions,
        callback: impl FnOnce(Value, Option<Delivery>) + Send + 'static,
    ) -> Result<CorrelationId> {
        // ---
        let reply_queue = self.ensure_reply_listener().await?;
        let timeout = opts.timeout.unwrap_or(self.inner.config.default_timeout);
        let correlation_id = CorrelationId::generate();

        self.inner.request_manager.register(
            correlation_id.clone(),
            destination,
            timeout,
            Box::new(callback),
        );

        log_debug!(
            "publishing request to {destination}, waiting for response on \
             {reply_queue} with correlation id {correlation_id}"
        );

        let published = self
            .inner
            .producer
            .publish(
                destination,
                &payload,
                PublishOptions {
                    correlation_id: Some(correlation_id.clone()),
                    reply_to: Some(reply_queue),
                    kind: Some(MessageKind::Request),
                    mandatory: true,
                    expiration_ms: opts
                        .delete_on_timeout
                        .then_some(timeout.as_millis() as u64),
                    ..PublishOptions::default()
                },
            )
            .await;

        if let Err(err) = published {
            self.inner.request_manager.forget(&correlation_id);
            return Err(err);
        }
        Ok(correlation_id)
    }

    /// Issue a request and suspend until its response, an error, or the
    /// deadline.
    ///
    /// Blocks only the caller; dispatch and the sweep keep running.
    pub async fn deliver_with_response(
        &self,
        destination: &str,
        payload: Value,
        opts: RequestOptions,
    ) -> Result<Value> {
        // ---
        let timeout = opts.timeout.unwrap_or(self.inner.config.default_timeout);
        let (callback, container) = SyncResponseContainer::pair();
        self.async_request(destination, payload, opts, callback)
            .await?;
        container.wait_for_response(timeout + SYNC_WAIT_GRACE).await
    }

    /// Respond to requests on a destination.
    ///
    /// The handler receives the decoded payload and the delivery and
    /// returns a tagged [`Response`]; the outcome is routed according to
    /// the delivery's kind (reply, broker ack/reject, or nothing).
    pub async fn respond_to<F, Fut>(
        &self,
        destination: &str,
        handler: F,
    ) -> Result<ResponderHandle>
    where
        F: Fn(Value, Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        // ---
        log_debug!("listening for requests on {destination}");
        let handler: DispatchHandler =
            Arc::new(move |payload, delivery| Box::pin(handler(payload, delivery)) as DispatchFuture);
        self.inner.consumer.subscribe(destination, handler).await
    }

    /// Observe all messages whose routing key matches a wildcard pattern
    /// (`*` = exactly one word, `#` = zero or more words) without
    /// consuming them.
    pub async fn tap_into<F, Fut>(&self, pattern: &str, handler: F) -> Result<ResponderHandle>
    where
        F: Fn(Value, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // ---
        let handler: TapHandler =
            Arc::new(move |payload, routing_key| Box::pin(handler(payload, routing_key)) as TapFuture);
        self.inner.consumer.tap_into(pattern, handler).await
    }

    /// Stop the sweep, the reply listener, and the transport.
    pub async fn close(&self) -> Result<()> {
        // ---
        self.inner.request_manager.stop();
        {
            let mut reply = self.inner.reply.lock().await;
            if let Some(listener) = reply.take() {
                let _ = listener.handle.cancel().await;
            }
        }
        self.inner.transport.close().await
    }

    /// Create the shared reply queue, its listener, and the sweep task on
    /// first use.
    async fn ensure_reply_listener(&self) -> Result<String> {
        // ---
        let mut reply = self.inner.reply.lock().await;
        if let Some(listener) = reply.as_ref() {
            return Ok(listener.queue.clone());
        }

        let queue = self.inner.transport.declare_queue("").await?;
        let manager = Arc::clone(&self.inner.request_manager);

        let handler: DispatchHandler = Arc::new(move |payload, delivery: Delivery| {
            // ---
            let manager = Arc::clone(&manager);
            Box::pin(async move {
                match delivery.properties.correlation_id.clone() {
                    Some(correlation_id) => {
                        manager.complete(&correlation_id, payload, delivery);
                    }
                    None => {
                        log_warn!(
                            "response without correlation id on {}",
                            delivery.routing_key
                        );
                    }
                }
                Response::Ack(Value::Null)
            }) as DispatchFuture
        });

        let handle = self.inner.consumer.subscribe_queue(&queue, handler).await?;
        self.inner.request_manager.start();

        log_debug!("listening for responses on {queue}");
        *reply = Some(ReplyListener {
            queue: queue.clone(),
            handle,
        });
        Ok(queue)
    }
}
