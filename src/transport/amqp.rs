//! AMQP transport implementation using `lapin`.
//!
//! Follows an **actor-based concurrency model**: a single background actor
//! task owns the AMQP connection and channel and serializes every broker
//! operation (declares, binds, publishes, consumes, acknowledgments);
//! no other task ever touches the connection directly. This keeps the
//! public `Transport` contract (`Send + Sync`) while respecting the AMQP
//! client's connection semantics.
//!
//! ## Message mapping
//!
//! Envelope fields ride on AMQP basic properties: correlation id,
//! reply-to, kind (the AMQP `type` field), the ack-required header flag,
//! and per-message expiration. Every publish goes to the default exchange
//! (routing key = queue) and to the topic exchange, so wildcard taps
//! observe without competing.
//!
//! ## No-route detection
//!
//! The channel runs in confirm mode. For a mandatory publish the broker
//! returns an unroutable message before confirming; the actor surfaces it
//! through the registered return hook.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use lapin::{
    //
    options::{
        //
        BasicAckOptions,
        BasicCancelOptions,
        BasicConsumeOptions,
        BasicPublishOptions,
        BasicQosOptions,
        BasicRejectOptions,
        ConfirmSelectOptions,
        ExchangeDeclareOptions,
        QueueBindOptions,
        QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
    ExchangeKind,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::macros::{log_debug, log_error, log_info};
use crate::message::{InboundDelivery, MessageKind, MessageProperties, OutboundMessage};
use crate::{
    // ---
    CorrelationId,
    CourierConfig,
    Error,
    Result,
    ReturnHandler,
    SubscribeOptions,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

/// Name of the topic exchange used for wildcard taps.
const TOPIC_EXCHANGE: &str = "courier.topic";

/// AMQP reply code for an unroutable mandatory message.
const NO_ROUTE: u16 = 312;

type SharedReturnHandler = Arc<StdMutex<Option<ReturnHandler>>>;

//
// Actor commands
//

enum Cmd {
    //
    DeclareQueue {
        name: String,
        resp: oneshot::Sender<Result<String>>,
    },
    BindTopic {
        queue: String,
        pattern: String,
        resp: oneshot::Sender<Result<()>>,
    },
    Publish {
        message: OutboundMessage,
        resp: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        queue: String,
        manual_ack: bool,
        tx: mpsc::UnboundedSender<InboundDelivery>,
        resp: oneshot::Sender<Result<String>>,
    },
    Ack {
        delivery_tag: u64,
        resp: oneshot::Sender<Result<()>>,
    },
    Reject {
        delivery_tag: u64,
        resp: oneshot::Sender<Result<()>>,
    },
    Cancel {
        consumer_tag: String,
        resp: oneshot::Sender<Result<()>>,
    },
    DeleteQueue {
        name: String,
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

/// AMQP transport. Cheap to clone internally; all broker work happens in
/// the actor task.
pub struct AmqpTransport {
    // ---
    cmd_tx: mpsc::Sender<Cmd>,
    return_handler: SharedReturnHandler,
}

impl AmqpTransport {
    async fn send_cmd<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Cmd,
    ) -> Result<T> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|e| Error::Transport(format!("actor command channel closed: {e}")))?;
        rx.await
            .map_err(|e| Error::Transport(format!("actor response channel closed: {e}")))?
    }
}

/// Background actor task that owns the AMQP connection and channel.
struct Actor {
    // ---
    connection: Connection,
    channel: Channel,
    cmd_rx: mpsc::Receiver<Cmd>,
    return_handler: SharedReturnHandler,
    consumer_handles: HashMap<String, JoinHandle<()>>,
}

impl Actor {
    async fn run(mut self) {
        // ---
        log_info!("AMQP actor started");

        while let Some(cmd) = self.cmd_rx.recv().await {
            if self.handle_cmd(cmd).await {
                break;
            }
        }

        for (_, handle) in self.consumer_handles.drain() {
            handle.abort();
        }
        let _ = self.channel.close(200, "Normal shutdown").await;
        let _ = self.connection.close(200, "Normal shutdown").await;

        log_info!("AMQP actor stopped");
    }

    /// Returns true when the actor should shut down.
    async fn handle_cmd(&mut self, cmd: Cmd) -> bool {
        // ---
        match cmd {
            Cmd::DeclareQueue { name, resp } => {
                let _ = resp.send(self.do_declare_queue(&name).await);
            }
            Cmd::BindTopic {
                queue,
                pattern,
                resp,
            } => {
                let _ = resp.send(self.do_bind_topic(&queue, &pattern).await);
            }
            Cmd::Publish { message, resp } => {
                let _ = resp.send(self.do_publish(message).await);
            }
            Cmd::Subscribe {
                queue,
                manual_ack,
                tx,
                resp,
            } => {
                let _ = resp.send(self.do_subscribe(&queue, manual_ack, tx).await);
            }
            Cmd::Ack { delivery_tag, resp } => {
                let result = self
                    .channel
                    .basic_ack(delivery_tag, BasicAckOptions::default())
                    .await
                    .map_err(|e| Error::Transport(format!("amqp: ack failed: {e}")));
                let _ = resp.send(result);
            }
            Cmd::Reject { delivery_tag, resp } => {
                let result = self
                    .channel
                    .basic_reject(delivery_tag, BasicRejectOptions::default())
                    .await
                    .map_err(|e| Error::Transport(format!("amqp: reject failed: {e}")));
                let _ = resp.send(result);
            }
            Cmd::Cancel { consumer_tag, resp } => {
                if let Some(handle) = self.consumer_handles.remove(&consumer_tag) {
                    handle.abort();
                }
                let result = self
                    .channel
                    .basic_cancel(&consumer_tag, BasicCancelOptions::default())
                    .await
                    .map_err(|e| Error::Transport(format!("amqp: cancel failed: {e}")));
                let _ = resp.send(result);
            }
            Cmd::DeleteQueue { name, resp } => {
                let result = self
                    .channel
                    .queue_delete(&name, QueueDeleteOptions::default())
                    .await
                    .map(|_| ())
                    .map_err(|e| Error::Transport(format!("amqp: queue delete failed: {e}")));
                let _ = resp.send(result);
            }
            Cmd::Close { resp } => {
                let _ = resp.send(Ok(()));
                return true;
            }
        }
        false
    }

    async fn do_declare_queue(&mut self, name: &str) -> Result<String> {
        // ---
        let opts = QueueDeclareOptions {
            passive: false,
            durable: false,
            exclusive: name.is_empty(),
            auto_delete: true,
            nowait: false,
        };

        let queue = self
            .channel
            .queue_declare(name, opts, FieldTable::default())
            .await
            .map_err(|e| Error::Transport(format!("amqp: queue declare failed: {e}")))?;

        log_debug!("declared queue {}", queue.name());
        Ok(queue.name().as_str().to_string())
    }

    async fn do_bind_topic(&mut self, queue: &str, pattern: &str) -> Result<()> {
        // ---
        self.channel
            .queue_bind(
                queue,
                TOPIC_EXCHANGE,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Transport(format!("amqp: queue bind failed: {e}")))
    }

    async fn do_publish(&mut self, message: OutboundMessage) -> Result<()> {
        // ---
        let properties = encode_properties(&message.properties);

        // Topic-exchange copy for wildcard taps; never mandatory.
        let _ = self
            .channel
            .basic_publish(
                TOPIC_EXCHANGE,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                properties.clone(),
            )
            .await
            .map_err(|e| Error::Transport(format!("amqp: topic publish failed: {e}")))?;

        let confirm = self
            .channel
            .basic_publish(
                "",
                &message.routing_key,
                BasicPublishOptions {
                    mandatory: message.mandatory,
                    ..BasicPublishOptions::default()
                },
                &message.payload,
                properties,
            )
            .await
            .map_err(|e| Error::Transport(format!("amqp: publish failed: {e}")))?;

        if message.mandatory {
            // The broker returns an unroutable mandatory message before
            // the confirm resolves; watch for it off the actor task.
            let return_handler = Arc::clone(&self.return_handler);
            tokio::spawn(async move {
                match confirm.await {
                    Ok(confirmation) => {
                        if let Some(returned) = confirmation.take_message() {
                            if returned.reply_code == NO_ROUTE {
                                let properties =
                                    decode_properties(&returned.delivery.properties);
                                let handler = return_handler
                                    .lock()
                                    .unwrap_or_else(|p| p.into_inner());
                                if let Some(handler) = handler.as_ref() {
                                    handler(properties);
                                }
                            }
                        }
                    }
                    Err(e) => log_error!("amqp: publisher confirm failed: {e}"),
                }
            });
        }

        Ok(())
    }

    async fn do_subscribe(
        &mut self,
        queue: &str,
        manual_ack: bool,
        tx: mpsc::UnboundedSender<InboundDelivery>,
    ) -> Result<String> {
        // ---
        let consumer_tag = format!("ctag-{}", Uuid::new_v4());

        let consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: !manual_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Transport(format!("amqp: consume failed: {e}")))?;

        log_debug!("consuming queue {queue} as {consumer_tag}");

        let queue = queue.to_string();
        let handle = tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            let mut consumer = consumer;
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let inbound = InboundDelivery {
                            payload: Bytes::from(delivery.data),
                            properties: decode_properties(&delivery.properties),
                            routing_key: delivery.routing_key.as_str().to_string(),
                            delivery_tag: delivery.delivery_tag,
                        };
                        if tx.send(inbound).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log_error!("amqp: consumer error on {queue}: {e}");
                        break;
                    }
                }
            }
        });

        self.consumer_handles.insert(consumer_tag.clone(), handle);
        Ok(consumer_tag)
    }
}

fn encode_properties(properties: &MessageProperties) -> BasicProperties {
    // ---
    let mut basic = BasicProperties::default().with_content_type("application/json".into());

    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(correlation_id.as_str().into());
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(reply_to.as_str().into());
    }
    if let Some(kind) = properties.kind {
        basic = basic.with_kind(kind.as_str().into());
    }
    if let Some(expiration_ms) = properties.expiration_ms {
        basic = basic.with_expiration(expiration_ms.to_string().into());
    }
    if properties.ack_required {
        let mut headers = FieldTable::default();
        headers.insert(ShortString::from("ack_required"), AMQPValue::Boolean(true));
        basic = basic.with_headers(headers);
    }

    basic
}

fn decode_properties(basic: &BasicProperties) -> MessageProperties {
    // ---
    let ack_required = basic
        .headers()
        .as_ref()
        .and_then(|headers| {
            headers
                .inner()
                .iter()
                .find(|(key, _)| key.as_str() == "ack_required")
        })
        .map(|(_, value)| matches!(value, AMQPValue::Boolean(true)))
        .unwrap_or(false);

    MessageProperties {
        correlation_id: basic
            .correlation_id()
            .as_ref()
            .map(|id| CorrelationId::from(id.as_str())),
        reply_to: basic
            .reply_to()
            .as_ref()
            .map(|reply_to| reply_to.as_str().to_string()),
        kind: basic
            .kind()
            .as_ref()
            .and_then(|kind| MessageKind::parse(kind.as_str())),
        ack_required,
        expiration_ms: basic
            .expiration()
            .as_ref()
            .and_then(|expiration| expiration.as_str().parse().ok()),
    }
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    // ---
    async fn declare_queue(&self, name: &str) -> Result<String> {
        let name = name.to_string();
        self.send_cmd(|resp| Cmd::DeclareQueue { name, resp }).await
    }

    async fn bind_topic(&self, queue: &str, pattern: &str) -> Result<()> {
        let queue = queue.to_string();
        let pattern = pattern.to_string();
        self.send_cmd(|resp| Cmd::BindTopic {
            queue,
            pattern,
            resp,
        })
        .await
    }

    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        self.send_cmd(|resp| Cmd::Publish { message, resp }).await
    }

    async fn subscribe(&self, queue: &str, opts: SubscribeOptions) -> Result<SubscriptionHandle> {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = queue.to_string();
        let queue_for_handle = queue.clone();

        let consumer_tag = self
            .send_cmd(|resp| Cmd::Subscribe {
                queue,
                manual_ack: opts.manual_ack,
                tx,
                resp,
            })
            .await?;

        Ok(SubscriptionHandle {
            inbox: rx,
            consumer_tag,
            queue: queue_for_handle,
        })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.send_cmd(|resp| Cmd::Ack { delivery_tag, resp }).await
    }

    async fn reject(&self, delivery_tag: u64) -> Result<()> {
        self.send_cmd(|resp| Cmd::Reject { delivery_tag, resp })
            .await
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let consumer_tag = consumer_tag.to_string();
        self.send_cmd(|resp| Cmd::Cancel { consumer_tag, resp })
            .await
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.send_cmd(|resp| Cmd::DeleteQueue { name, resp }).await
    }

    fn on_return(&self, handler: ReturnHandler) {
        let mut slot = self.return_handler.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(handler);
    }

    async fn close(&self) -> Result<()> {
        self.send_cmd(|resp| Cmd::Close { resp }).await
    }
}

/// Create a lapin-based AMQP transport from the configuration.
///
/// Connects immediately, opens one channel with the configured prefetch,
/// enables confirm mode for no-route detection, and declares the topic
/// exchange.
pub async fn create_amqp_transport(config: &CourierConfig) -> Result<TransportPtr> {
    // ---
    let uri = config
        .uri
        .as_deref()
        .ok_or_else(|| Error::Transport("AMQP transport requires a broker URI".to_string()))?;

    log_info!("connecting to AMQP broker: {uri}");

    let connection = Connection::connect(uri, ConnectionProperties::default())
        .await
        .map_err(|e| {
            let msg = format!("amqp: connection failed: {e}");
            log_error!("{msg}");
            Error::Transport(msg)
        })?;

    let channel = connection
        .create_channel()
        .await
        .map_err(|e| Error::Transport(format!("amqp: channel creation failed: {e}")))?;

    channel
        .basic_qos(config.prefetch, BasicQosOptions::default())
        .await
        .map_err(|e| Error::Transport(format!("amqp: qos failed: {e}")))?;

    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|e| Error::Transport(format!("amqp: confirm select failed: {e}")))?;

    channel
        .exchange_declare(
            TOPIC_EXCHANGE,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: false,
                auto_delete: false,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| Error::Transport(format!("amqp: exchange declare failed: {e}")))?;

    log_info!("connected to AMQP broker");

    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let return_handler: SharedReturnHandler = Arc::new(StdMutex::new(None));

    let actor = Actor {
        connection,
        channel,
        cmd_rx,
        return_handler: Arc::clone(&return_handler),
        consumer_handles: HashMap::new(),
    };
    tokio::spawn(async move {
        actor.run().await;
    });

    Ok(Arc::new(AmqpTransport {
        cmd_tx,
        return_handler,
    }))
}
