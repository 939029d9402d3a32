//! 死信队列
//!
//! 毒消息或投递次数耗尽的消息被包装为 `DeadLetterMessage` 写入死信 topic，
//! 保留原始位置、负载和失败原因，等待人工处理，不再自动重投。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::kafka::{ConsumerMessage, headers};
use crate::observability::metrics;
use crate::publisher::{DeliveryReceipt, EventTransport, OutboundMessage, deliver};
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// DeadLetterMessage — 死信消息信封
// ---------------------------------------------------------------------------

/// 死信消息信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    /// 原始消息 ID（能解析时为 event_id，否则为 topic/partition/offset）
    pub message_id: String,
    pub source_topic: String,
    pub partition: i32,
    pub offset: i64,
    /// 原始负载（非 UTF-8 字节按有损方式转换）
    pub payload: String,
    pub headers: HashMap<String, String>,
    pub reason: String,
    pub delivery_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
    pub source_service: String,
}

impl DeadLetterMessage {
    pub fn from_consumed(
        message: &ConsumerMessage,
        message_id: impl Into<String>,
        reason: impl Into<String>,
        source_service: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            source_topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
            headers: message.headers.clone(),
            reason: reason.into(),
            delivery_count: message.delivery_count(),
            dead_lettered_at: Utc::now(),
            source_service: source_service.into(),
        }
    }
}

/// 无法解析出 event_id 时使用的消息定位标识
pub fn fallback_message_id(message: &ConsumerMessage) -> String {
    format!("{}/{}/{}", message.topic, message.partition, message.offset)
}

// ---------------------------------------------------------------------------
// DlqProducer — 将失败消息发送到死信队列
// ---------------------------------------------------------------------------

/// DLQ 生产者
#[derive(Clone)]
pub struct DlqProducer {
    transport: Arc<dyn EventTransport>,
    topic: String,
    source_service: String,
    policy: RetryPolicy,
}

impl DlqProducer {
    pub fn new(
        transport: Arc<dyn EventTransport>,
        topic: &str,
        source_service: &str,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            topic: topic.to_string(),
            source_service: source_service.to_string(),
            policy,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 将消息写入死信 topic，失败按投递重试策略重试
    pub async fn send(
        &self,
        message: &ConsumerMessage,
        message_id: &str,
        reason: &str,
    ) -> Result<DeliveryReceipt> {
        let envelope =
            DeadLetterMessage::from_consumed(message, message_id, reason, &self.source_service);

        let outbound = OutboundMessage {
            topic: self.topic.clone(),
            key: Some(message_id.to_string()),
            payload: serde_json::to_vec(&envelope)?,
            headers: HashMap::from([
                (headers::CONTENT_TYPE.to_string(), headers::JSON.to_string()),
                (headers::ORIGINAL_TOPIC.to_string(), message.topic.clone()),
            ]),
        };

        let receipt = deliver(self.transport.as_ref(), &self.policy, "send_to_dlq", &outbound).await?;

        metrics::record_dead_letter(&message.topic);
        warn!(
            message_id,
            source_topic = %message.topic,
            delivery_count = envelope.delivery_count,
            reason,
            "消息已发送到死信队列"
        );

        Ok(receipt)
    }
}
