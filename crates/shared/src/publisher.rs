//! 事件发布器
//!
//! 将领域事件以持久化消息投递到 broker。每次尝试前先检查连接，不健康则重连并重新声明
//! topic；只有连接层故障会在有界退避内重试，消息被 broker 拒绝直接返回。
//! 事件在首次序列化后字节固定，重试不会生成新的 event_id。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{Instrument, debug, error, info_span};

use crate::error::{Result, ServiceError};
use crate::events::{DomainEvent, EventPayload};
use crate::kafka::headers;
use crate::observability::{metrics, tracing as otel};
use crate::retry::{RetryPolicy, retry_with_policy};

/// 待投递的消息
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
}

/// broker 确认后的落点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub partition: i32,
    pub offset: i64,
}

/// 消息传输抽象
///
/// `send` 在 broker 确认后才返回成功。连接层故障返回 `ServiceError::Transport`，
/// 消息本身被拒绝返回 `ServiceError::PublishRejected`。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn is_healthy(&self) -> bool;

    /// 关闭并重建连接，重新声明 topic
    async fn reconnect(&self) -> Result<()>;

    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt>;
}

/// 带重连与有界重试的单条投递
///
/// 每次尝试前检查连接，不健康先重连；只重试传输层故障。
pub async fn deliver(
    transport: &dyn EventTransport,
    policy: &RetryPolicy,
    operation_name: &str,
    message: &OutboundMessage,
) -> Result<DeliveryReceipt> {
    retry_with_policy(
        policy,
        operation_name,
        ServiceError::is_transient_delivery,
        |attempt| async move {
            if !transport.is_healthy().await {
                debug!(attempt, topic = %message.topic, "broker 连接不可用，先重连");
                transport.reconnect().await?;
            }
            transport.send(message).await
        },
    )
    .await
}

/// 事件发布器
#[derive(Clone)]
pub struct EventPublisher {
    transport: Arc<dyn EventTransport>,
    policy: RetryPolicy,
}

impl EventPublisher {
    pub fn new(transport: Arc<dyn EventTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn transport(&self) -> Arc<dyn EventTransport> {
        self.transport.clone()
    }

    /// 发布事件到指定路由键
    ///
    /// 最坏情况下阻塞 `max_attempts` 次发送超时加上累计退避时间。
    pub async fn publish(&self, routing_key: &str, event: &DomainEvent) -> Result<DeliveryReceipt> {
        let span = info_span!(
            "publish_event",
            event_type = %event.event_type,
            event_id = %event.event_id,
            routing_key
        );

        async {
            let start = Instant::now();
            let message = self.build_message(routing_key, event)?;

            let result =
                deliver(self.transport.as_ref(), &self.policy, "publish_event", &message).await;

            let status = match &result {
                Ok(_) => "success",
                Err(ServiceError::PublishRejected(_)) => "rejected",
                Err(_) => "failure",
            };
            metrics::record_event_published(
                &event.event_type,
                status,
                start.elapsed().as_secs_f64(),
            );

            result
        }
        .instrument(span)
        .await
    }

    /// 由强类型负载构建并发布事件，返回已发布的事件
    pub async fn publish_payload(
        &self,
        payload: &EventPayload,
        correlation_id: Option<&str>,
    ) -> Result<DomainEvent> {
        let mut event = DomainEvent::new(payload)?;
        if let Some(id) = correlation_id {
            event = event.with_correlation_id(id);
        }

        self.publish(payload.event_type().routing_key(), &event)
            .await?;
        Ok(event)
    }

    /// 尽力发布：失败只记录日志，不影响调用方的业务结果
    pub async fn publish_or_log(
        &self,
        payload: &EventPayload,
        correlation_id: Option<&str>,
    ) -> Option<DomainEvent> {
        match self.publish_payload(payload, correlation_id).await {
            Ok(event) => Some(event),
            Err(e) => {
                error!(
                    event_type = %payload.event_type(),
                    error = %e,
                    "事件发布失败，已放弃"
                );
                None
            }
        }
    }

    pub async fn health_check(&self) -> bool {
        self.transport.is_healthy().await
    }

    fn build_message(&self, routing_key: &str, event: &DomainEvent) -> Result<OutboundMessage> {
        let payload = event.to_bytes()?;

        let mut message_headers = HashMap::from([
            (headers::EVENT_TYPE.to_string(), event.event_type.clone()),
            (headers::EVENT_VERSION.to_string(), event.event_version.clone()),
            (headers::CONTENT_TYPE.to_string(), headers::JSON.to_string()),
            (headers::DELIVERY_MODE.to_string(), headers::PERSISTENT.to_string()),
        ]);
        if let Some(correlation_id) = &event.correlation_id {
            message_headers.insert(headers::CORRELATION_ID.to_string(), correlation_id.clone());
        }
        otel::inject_to_headers(&mut message_headers);

        let key = event
            .typed_payload()
            .ok()
            .flatten()
            .map(|p| p.partition_key().to_string());

        Ok(OutboundMessage {
            topic: routing_key.to_string(),
            key,
            payload,
            headers: message_headers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CartCleared;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    fn cleared() -> EventPayload {
        EventPayload::CartCleared(CartCleared {
            user_id: "u1".to_string(),
            reason: "user_requested".to_string(),
        })
    }

    fn receipt() -> DeliveryReceipt {
        DeliveryReceipt {
            partition: 0,
            offset: 7,
        }
    }

    #[tokio::test]
    async fn test_publish_sets_headers_and_key() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let captured = sent.clone();

        let mut transport = MockEventTransport::new();
        transport.expect_is_healthy().returning(|| true);
        transport.expect_reconnect().never();
        transport.expect_send().times(1).returning(move |msg| {
            captured.lock().push(msg.clone());
            Ok(receipt())
        });

        let publisher = EventPublisher::new(Arc::new(transport), fast_policy());
        let event = publisher
            .publish_payload(&cleared(), Some("req-9"))
            .await
            .unwrap();

        let sent = sent.lock();
        let message = &sent[0];
        assert_eq!(message.topic, "cart.cleared");
        assert_eq!(message.key.as_deref(), Some("u1"));
        assert_eq!(message.headers[headers::EVENT_TYPE], "cart.cleared");
        assert_eq!(message.headers[headers::EVENT_VERSION], "1.0.0");
        assert_eq!(message.headers[headers::CONTENT_TYPE], "application/json");
        assert_eq!(message.headers[headers::DELIVERY_MODE], "persistent");
        assert_eq!(message.headers[headers::CORRELATION_ID], "req-9");
        assert_eq!(
            DomainEvent::from_slice(&message.payload).unwrap().event_id,
            event.event_id
        );
    }

    #[tokio::test]
    async fn test_reconnects_until_broker_recovers() {
        let health_checks = Arc::new(AtomicU32::new(0));
        let checks = health_checks.clone();

        let mut transport = MockEventTransport::new();
        // 前两次尝试连接不可用，第三次恢复
        transport
            .expect_is_healthy()
            .returning(move || checks.fetch_add(1, Ordering::SeqCst) >= 2);
        transport
            .expect_reconnect()
            .times(2)
            .returning(|| Err(ServiceError::Transport("connection refused".to_string())));
        transport.expect_send().times(1).returning(|_| Ok(receipt()));

        let publisher = EventPublisher::new(Arc::new(transport), fast_policy());
        let result = publisher.publish_payload(&cleared(), None).await;

        assert!(result.is_ok());
        assert_eq!(health_checks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_same_bytes_on_every_attempt() {
        let payloads = Arc::new(Mutex::new(Vec::new()));
        let captured = payloads.clone();

        let mut transport = MockEventTransport::new();
        transport.expect_is_healthy().returning(|| true);
        transport.expect_send().times(3).returning(move |msg| {
            let mut seen = captured.lock();
            seen.push(msg.payload.clone());
            if seen.len() < 3 {
                Err(ServiceError::Transport("channel closed".to_string()))
            } else {
                Ok(receipt())
            }
        });

        let publisher = EventPublisher::new(Arc::new(transport), fast_policy());
        publisher.publish_payload(&cleared(), None).await.unwrap();

        let payloads = payloads.lock();
        assert_eq!(payloads.len(), 3);
        assert!(payloads.iter().all(|p| p == &payloads[0]));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let mut transport = MockEventTransport::new();
        transport.expect_is_healthy().returning(|| true);
        transport
            .expect_send()
            .times(3)
            .returning(|_| Err(ServiceError::Transport("broker down".to_string())));

        let publisher = EventPublisher::new(Arc::new(transport), fast_policy());
        let result = publisher.publish_payload(&cleared(), None).await;

        assert!(matches!(result, Err(ServiceError::Transport(_))));
    }

    #[tokio::test]
    async fn test_rejected_message_is_not_retried() {
        let mut transport = MockEventTransport::new();
        transport.expect_is_healthy().returning(|| true);
        transport
            .expect_send()
            .times(1)
            .returning(|_| Err(ServiceError::PublishRejected("message too large".to_string())));

        let publisher = EventPublisher::new(Arc::new(transport), fast_policy());
        let result = publisher.publish_payload(&cleared(), None).await;

        assert!(matches!(result, Err(ServiceError::PublishRejected(_))));
    }

    #[tokio::test]
    async fn test_publish_or_log_swallows_failure() {
        let mut transport = MockEventTransport::new();
        transport.expect_is_healthy().returning(|| false);
        transport
            .expect_reconnect()
            .times(3)
            .returning(|| Err(ServiceError::Transport("refused".to_string())));
        transport.expect_send().never();

        let publisher = EventPublisher::new(Arc::new(transport), fast_policy());
        assert!(publisher.publish_or_log(&cleared(), None).await.is_none());
    }
}
