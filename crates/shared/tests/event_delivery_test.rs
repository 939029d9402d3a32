//! 事件投递链路集成测试
//!
//! 发布（有界重试 + 重连）→ 内存传输 → 消费分发（幂等 + 重新入队 + 死信），
//! 以及金额在边界上的十进制换算。

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bookstore_shared::consumer::{
    ConsumeOutcome, Disposition, EventDispatcher, requeue_message,
};
use bookstore_shared::dlq::{DeadLetterMessage, DlqProducer};
use bookstore_shared::events::{CartCleared, EventType};
use bookstore_shared::idempotency::MemoryLedger;
use bookstore_shared::money::MoneyError;
use bookstore_shared::publisher::EventPublisher;
use bookstore_shared::retry::RetryPolicy;
use bookstore_shared::test_utils::{
    InMemoryTransport, RecordingHandler, TestEvents, consumer_message, redeliver,
};
use bookstore_shared::{EventPayload, Money, ServiceError};
use rust_decimal::Decimal;

// ==================== 辅助函数 ====================

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        multiplier: 2.0,
    }
}

fn cart_cleared() -> EventPayload {
    EventPayload::CartCleared(CartCleared {
        user_id: "U1".to_string(),
        reason: "user_requested".to_string(),
    })
}

// ==================== 发布 ====================

#[tokio::test]
async fn test_publish_recovers_after_two_connection_failures() {
    let transport = Arc::new(InMemoryTransport::with_connection_failures(2));
    let publisher = EventPublisher::new(transport.clone(), fast_policy(3));

    let event = publisher
        .publish_payload(&cart_cleared(), None)
        .await
        .unwrap();

    let sent = transport.sent_events();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].event_id, event.event_id);
    assert_eq!(transport.reconnect_attempts(), 2);
}

#[tokio::test]
async fn test_publish_gives_up_after_max_attempts() {
    let transport = Arc::new(InMemoryTransport::with_connection_failures(10));
    let publisher = EventPublisher::new(transport.clone(), fast_policy(3));

    let err = publisher
        .publish_payload(&cart_cleared(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::Transport(_)));
    assert!(transport.sent().is_empty());
    assert_eq!(transport.reconnect_attempts(), 3);
}

#[tokio::test]
async fn test_rejected_publish_is_not_retried() {
    let transport = Arc::new(InMemoryTransport::rejecting("unknown topic"));
    let publisher = EventPublisher::new(transport.clone(), fast_policy(3));

    let err = publisher
        .publish_payload(&cart_cleared(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::PublishRejected(_)));
    assert_eq!(transport.reconnect_attempts(), 0);
}

#[tokio::test]
async fn test_published_message_carries_envelope_headers() {
    let transport = Arc::new(InMemoryTransport::new());
    let publisher = EventPublisher::new(transport.clone(), fast_policy(1));

    let event = publisher
        .publish_payload(&cart_cleared(), Some("corr-1"))
        .await
        .unwrap();

    let message = &transport.sent_to("cart.cleared")[0];
    assert_eq!(message.headers["event-type"], "cart.cleared");
    assert_eq!(message.headers["delivery-mode"], "persistent");
    assert_eq!(message.headers["correlation-id"], "corr-1");
    assert_eq!(event.correlation_id.as_deref(), Some("corr-1"));
}

// ==================== 消费 ====================

#[tokio::test]
async fn test_published_event_is_consumed_once() {
    let transport = Arc::new(InMemoryTransport::new());
    let publisher = EventPublisher::new(transport.clone(), fast_policy(1));
    let handler = Arc::new(RecordingHandler::new());
    let dispatcher = EventDispatcher::new("audit", Arc::new(MemoryLedger::default()), 5)
        .register(EventType::CartCleared, handler.clone());

    publisher.publish_payload(&cart_cleared(), None).await.unwrap();
    let outbound = &transport.sent()[0];

    let first = dispatcher.dispatch(&redeliver(outbound, 0)).await;
    let second = dispatcher.dispatch(&redeliver(outbound, 1)).await;

    assert_eq!(first, Disposition::Ack(ConsumeOutcome::Processed));
    assert_eq!(second, Disposition::Ack(ConsumeOutcome::Duplicate));
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn test_failing_handler_is_requeued_then_processed() {
    let handler = Arc::new(RecordingHandler::failing(1));
    let dispatcher = EventDispatcher::new("cart-service", Arc::new(MemoryLedger::default()), 5)
        .register(EventType::CatalogUpdated, handler.clone());

    let message = consumer_message(&TestEvents::catalog_price_changed("BOOK-1", 2499));
    let Disposition::Requeue { delivery_count, .. } = dispatcher.dispatch(&message).await else {
        panic!("expected requeue");
    };
    assert_eq!(delivery_count, 2);

    let requeued = redeliver(&requeue_message(&message, delivery_count), 1);
    assert_eq!(requeued.delivery_count(), 2);
    assert_eq!(
        dispatcher.dispatch(&requeued).await,
        Disposition::Ack(ConsumeOutcome::Processed)
    );
    assert_eq!(handler.calls(), 2);
    assert_eq!(handler.events().len(), 1);
}

#[tokio::test]
async fn test_exhausted_message_goes_to_dead_letter_topic() {
    let transport = Arc::new(InMemoryTransport::new());
    let handler = Arc::new(RecordingHandler::failing(u32::MAX));
    let dispatcher = EventDispatcher::new("cart-service", Arc::new(MemoryLedger::default()), 2)
        .register(EventType::CatalogUpdated, handler);
    let dlq = DlqProducer::new(transport.clone(), "cart.dlq", "cart-service", fast_policy(1));

    let event = TestEvents::catalog_price_changed("BOOK-1", 2499);
    let first = consumer_message(&event);
    let Disposition::Requeue { delivery_count, .. } = dispatcher.dispatch(&first).await else {
        panic!("expected requeue");
    };

    let second = redeliver(&requeue_message(&first, delivery_count), 1);
    let Disposition::DeadLetter { reason } = dispatcher.dispatch(&second).await else {
        panic!("expected dead letter");
    };

    dlq.send(&second, &event.event_id.to_string(), &reason)
        .await
        .unwrap();

    let dead = transport.sent_to("cart.dlq");
    assert_eq!(dead.len(), 1);
    let envelope: DeadLetterMessage = serde_json::from_slice(&dead[0].payload).unwrap();
    assert_eq!(envelope.message_id, event.event_id.to_string());
    assert_eq!(envelope.source_topic, "catalog.updated");
    assert_eq!(envelope.delivery_count, 2);
}

#[tokio::test]
async fn test_malformed_payload_is_dead_lettered_immediately() {
    let handler = Arc::new(RecordingHandler::new());
    let dispatcher = EventDispatcher::new("cart-service", Arc::new(MemoryLedger::default()), 5)
        .register(EventType::CatalogUpdated, handler.clone());

    let mut message = consumer_message(&TestEvents::catalog_price_changed("BOOK-1", 1));
    message.payload = b"{not json".to_vec();

    assert!(matches!(
        dispatcher.dispatch(&message).await,
        Disposition::DeadLetter { .. }
    ));
    assert_eq!(handler.calls(), 0);
}

// ==================== 金额换算 ====================

#[test]
fn test_money_decimal_round_trip() {
    for (amount, places) in [(0, 2), (1999, 2), (-250, 2), (123_456_789, 3), (42, 0)] {
        let money = Money::new(amount, "USD").with_decimal_places(places);
        let decimal = money.to_decimal().unwrap();
        let back = Money::from_decimal(decimal, "USD", places).unwrap();
        assert_eq!(back, money);
    }
}

#[test]
fn test_money_from_decimal_rejects_precision_loss() {
    let value = Decimal::from_str("19.999").unwrap();
    assert!(matches!(
        Money::from_decimal(value, "USD", 2),
        Err(MoneyError::PrecisionLoss { .. })
    ));

    let exact = Decimal::from_str("24.99").unwrap();
    assert_eq!(Money::from_decimal(exact, "USD", 2).unwrap().amount, 2499);
}
