//! End-to-end request/response tests over the in-memory transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use courier::{
    //
    create_memory_transport,
    Courier,
    CourierConfig,
    Error,
    MessageKind,
    MessageProperties,
    OutboundMessage,
    RequestOptions,
    Response,
    Result,
    SubscribeOptions,
    TransportPtr,
};

async fn setup() -> Result<(TransportPtr, Courier)> {
    // ---
    let config = CourierConfig::memory().with_default_timeout(Duration::from_secs(2));
    let transport = create_memory_transport(&config).await?;
    let courier = Courier::with_transport(transport.clone(), config);
    Ok((transport, courier))
}

fn opts_with_timeout(ms: u64) -> RequestOptions {
    RequestOptions::default().with_timeout(Duration::from_millis(ms))
}

#[tokio::test]
async fn test_request_response_roundtrip() -> Result<()> {
    // ---
    let (_transport, courier) = setup().await?;

    courier
        .respond_to("echo", |payload, _delivery| async move {
            Response::Ack(json!({ "echo": payload }))
        })
        .await?;

    let reply = courier
        .deliver_with_response("echo", json!({"name": "ari"}), RequestOptions::default())
        .await?;

    assert_eq!(reply["echo"]["name"], "ari");
    courier.close().await
}

#[tokio::test]
async fn test_empty_payload_arrives_as_empty_object() -> Result<()> {
    // ---
    let (_transport, courier) = setup().await?;

    courier
        .respond_to("ping", |payload, _delivery| async move {
            Response::Ack(json!({ "was_empty_object": payload == json!({}) }))
        })
        .await?;

    let reply = courier
        .deliver_with_response("ping", Value::Null, RequestOptions::default())
        .await?;

    assert_eq!(reply["was_empty_object"], true);
    Ok(())
}

#[tokio::test]
async fn test_nack_reason_reaches_requester() -> Result<()> {
    // ---
    let (_transport, courier) = setup().await?;

    courier
        .respond_to("orders", |_payload, _delivery| async move {
            Response::nack("bad message")
        })
        .await?;

    match courier
        .deliver_with_response("orders", json!({"id": 1}), RequestOptions::default())
        .await
    {
        Err(Error::Rejected(body)) => assert_eq!(body["error"], "bad message"),
        other => panic!("expected Rejected, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_error_outcome_carries_response_body() -> Result<()> {
    // ---
    let (_transport, courier) = setup().await?;

    courier
        .respond_to("orders", |_payload, _delivery| async move {
            Response::Error(json!({"error": "validation failed", "code": 7}))
        })
        .await?;

    match courier
        .deliver_with_response("orders", json!({}), RequestOptions::default())
        .await
    {
        Err(Error::Rejected(body)) => {
            assert_eq!(body["error"], "validation failed");
            assert_eq!(body["code"], 7);
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_timeout_bounded_by_deadline_plus_sweep() -> Result<()> {
    // ---
    let (transport, courier) = setup().await?;

    // Queue exists but nobody consumes it: the request must end via the
    // sweep, no earlier than the deadline and no later than deadline +
    // sweep interval (plus scheduling slack).
    transport.declare_queue("silent").await?;

    let started = Instant::now();
    let result = courier
        .deliver_with_response("silent", json!({}), opts_with_timeout(200))
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(Error::Timeout)), "got {result:?}");
    assert!(elapsed >= Duration::from_millis(200), "completed early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(600), "completed late: {elapsed:?}");
    Ok(())
}

#[tokio::test]
async fn test_no_route_short_circuits_large_timeout() -> Result<()> {
    // ---
    let (_transport, courier) = setup().await?;

    let started = Instant::now();
    let result = courier
        .deliver_with_response("never.declared", json!({}), opts_with_timeout(5_000))
        .await;
    let elapsed = started.elapsed();

    match result {
        Err(Error::Rejected(body)) => {
            assert_eq!(body["error"], "Specified destination does not exist")
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
    assert!(elapsed < Duration::from_secs(1), "no-route took {elapsed:?}");
    Ok(())
}

#[tokio::test]
async fn test_every_callback_fires_exactly_once() -> Result<()> {
    // ---
    let (transport, courier) = setup().await?;

    courier
        .respond_to("pool", |payload, _delivery| async move {
            Response::Ack(payload)
        })
        .await?;
    transport.declare_queue("silent").await?;

    let completions = Arc::new(AtomicUsize::new(0));

    // Three completion paths racing: response, no-route, timeout.
    for i in 0..20 {
        let counter = Arc::clone(&completions);
        courier
            .async_request("pool", json!({"i": i}), opts_with_timeout(400), move |_p, _d| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await?;
    }
    for _ in 0..5 {
        let counter = Arc::clone(&completions);
        courier
            .async_request("silent", json!({}), opts_with_timeout(200), move |_p, _d| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await?;
    }
    for _ in 0..5 {
        let counter = Arc::clone(&completions);
        courier
            .async_request("missing", json!({}), opts_with_timeout(5_000), move |_p, _d| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await?;
    }

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(completions.load(Ordering::SeqCst), 30);

    // No late double-fire.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(completions.load(Ordering::SeqCst), 30);
    Ok(())
}

#[tokio::test]
async fn test_only_matching_destination_responds() -> Result<()> {
    // ---
    let (transport, courier) = setup().await?;

    courier
        .respond_to("served", |_payload, _delivery| async move {
            Response::Ack(json!({"served": true}))
        })
        .await?;
    transport.declare_queue("unserved").await?;

    let reply = courier
        .deliver_with_response("served", json!({}), RequestOptions::default())
        .await?;
    assert_eq!(reply["served"], true);

    let result = courier
        .deliver_with_response("unserved", json!({}), opts_with_timeout(150))
        .await;
    assert!(matches!(result, Err(Error::Timeout)), "got {result:?}");
    Ok(())
}

#[tokio::test]
async fn test_deliver_with_ack_feedback() -> Result<()> {
    // ---
    let (_transport, courier) = setup().await?;

    courier
        .respond_to("inbox.acked", |_payload, _delivery| async move {
            Response::ack()
        })
        .await?;
    courier
        .respond_to("inbox.nacked", |_payload, _delivery| async move {
            Response::nack("not today")
        })
        .await?;

    let (acked_tx, acked_rx) = oneshot::channel();
    courier
        .deliver_with_ack("inbox.acked", json!({}), None, move |error| {
            let _ = acked_tx.send(error);
        })
        .await?;
    assert!(acked_rx.await.unwrap().is_none());

    let (nacked_tx, nacked_rx) = oneshot::channel();
    courier
        .deliver_with_ack("inbox.nacked", json!({}), None, move |error| {
            let _ = nacked_tx.send(error);
        })
        .await?;
    let error = nacked_rx.await.unwrap().expect("nack must surface an error");
    assert_eq!(error["error"], "not today");

    // No responder at all: the no-route path reports an error.
    let (missing_tx, missing_rx) = oneshot::channel();
    courier
        .deliver_with_ack("inbox.missing", json!({}), None, move |error| {
            let _ = missing_tx.send(error);
        })
        .await?;
    assert!(missing_rx.await.unwrap().is_some());
    Ok(())
}

#[tokio::test]
async fn test_delete_on_timeout_expires_the_message() -> Result<()> {
    // ---
    let (transport, courier) = setup().await?;
    transport.declare_queue("late.party").await?;

    let result = courier
        .deliver_with_response(
            "late.party",
            json!({}),
            opts_with_timeout(150).with_delete_on_timeout(),
        )
        .await;
    assert!(matches!(result, Err(Error::Timeout)));

    // A responder that starts listening after the timeout must never see
    // the expired request.
    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    courier
        .respond_to("late.party", move |_payload, _delivery| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Response::ack()
            }
        })
        .await?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(received.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_message_outlives_timeout_by_default() -> Result<()> {
    // ---
    let (transport, courier) = setup().await?;
    transport.declare_queue("late.party").await?;

    let result = courier
        .deliver_with_response("late.party", json!({"kept": true}), opts_with_timeout(150))
        .await;
    assert!(matches!(result, Err(Error::Timeout)));

    // Without delete_on_timeout the request stays consumable.
    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    courier
        .respond_to("late.party", move |_payload, _delivery| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Response::ack()
            }
        })
        .await?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(received.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_cancel_stops_further_deliveries() -> Result<()> {
    // ---
    let (_transport, courier) = setup().await?;

    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    let responder = courier
        .respond_to("stream", move |_payload, _delivery| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Response::ack()
            }
        })
        .await?;

    courier.deliver("stream", json!({"n": 1})).await?;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(received.load(Ordering::SeqCst), 1);

    responder.cancel().await?;
    responder.join().await;

    courier.deliver("stream", json!({"n": 2})).await?;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(received.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_request_without_correlation_id_is_dropped() -> Result<()> {
    // ---
    let (transport, courier) = setup().await?;

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&handled);
    courier
        .respond_to("ledger", move |_payload, _delivery| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Response::ack()
            }
        })
        .await?;

    let reply_queue = transport.declare_queue("").await?;
    let mut replies = transport
        .subscribe(&reply_queue, SubscribeOptions::default())
        .await?;

    // A request-kind message without a correlation id cannot be answered;
    // it must be dropped before the handler, with no reply published.
    transport
        .publish(OutboundMessage {
            routing_key: "ledger".into(),
            payload: Bytes::from_static(b"{}"),
            properties: MessageProperties {
                reply_to: Some(reply_queue.clone()),
                kind: Some(MessageKind::Request),
                ..MessageProperties::default()
            },
            mandatory: false,
        })
        .await?;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(handled.load(Ordering::SeqCst), 0);
    assert!(replies.inbox.try_recv().is_err());

    // Dispatch keeps serving well-formed requests afterwards.
    let reply = courier
        .deliver_with_response("ledger", json!({}), RequestOptions::default())
        .await?;
    assert_eq!(reply, json!({}));
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_panicking_handler_does_not_stall_dispatch() -> Result<()> {
    // ---
    let (_transport, courier) = setup().await?;

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    courier
        .respond_to("flaky", move |payload, _delivery| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if payload["boom"] == true {
                    panic!("handler exploded");
                }
                Response::Ack(payload)
            }
        })
        .await?;

    // The panicking request never gets a reply; it must time out without
    // taking the subscription down.
    let result = courier
        .deliver_with_response("flaky", json!({"boom": true}), opts_with_timeout(200))
        .await;
    assert!(matches!(result, Err(Error::Timeout)), "got {result:?}");

    let reply = courier
        .deliver_with_response("flaky", json!({"boom": false}), RequestOptions::default())
        .await?;
    assert_eq!(reply["boom"], false);
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn test_two_couriers_share_one_broker() -> Result<()> {
    // ---
    let config = CourierConfig::memory();
    let transport = create_memory_transport(&config).await?;
    let responder = Courier::with_transport(transport.clone(), config.clone());
    let requester = Courier::with_transport(transport, config);

    responder
        .respond_to("math.add", |payload, _delivery| async move {
            let sum = payload["a"].as_i64().unwrap_or(0) + payload["b"].as_i64().unwrap_or(0);
            Response::Ack(json!({ "sum": sum }))
        })
        .await?;

    let reply = requester
        .deliver_with_response("math.add", json!({"a": 2, "b": 3}), RequestOptions::default())
        .await?;
    assert_eq!(reply["sum"], 5);

    requester.close().await
}
