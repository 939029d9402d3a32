//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为事件传输与消费者抽象，统一消息头、错误映射和
//! 偏移量提交语义。路由键即 topic 名称；启动和重连时都会声明所需 topic。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::config::{ConsumerConfig, KafkaConfig, PublisherConfig};
use crate::error::ServiceError;
use crate::events::{DomainEvent, EventType};
use crate::publisher::{DeliveryReceipt, EventTransport, OutboundMessage};

/// 元数据探测超时，用于健康检查
const METADATA_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// 消息头常量
// ---------------------------------------------------------------------------

pub mod headers {
    pub const EVENT_TYPE: &str = "event-type";
    pub const EVENT_VERSION: &str = "event-version";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const DELIVERY_MODE: &str = "delivery-mode";
    pub const CORRELATION_ID: &str = "correlation-id";
    /// 含首次投递在内的投递次数，重新入队时递增
    pub const DELIVERY_COUNT: &str = "x-delivery-count";
    pub const ORIGINAL_TOPIC: &str = "x-original-topic";

    pub const JSON: &str = "application/json";
    pub const PERSISTENT: &str = "persistent";
}

/// 事件在 broker 上用到的全部 topic（各事件类型的路由键加死信 topic）
pub fn event_topics(dead_letter_topic: &str) -> Vec<String> {
    EventType::ALL
        .iter()
        .map(|t| t.routing_key().to_string())
        .chain(std::iter::once(dead_letter_topic.to_string()))
        .collect()
}

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给异步处理函数。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl ConsumerMessage {
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let timestamp = msg.timestamp().to_millis();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for header in h.iter() {
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp,
            headers,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// 当前是第几次投递，缺失或无法解析时按首次投递处理
    pub fn delivery_count(&self) -> u32 {
        self.header(headers::DELIVERY_COUNT)
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(1)
    }

    pub fn payload_str(&self) -> Result<&str, ServiceError> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| ServiceError::PoisonMessage(format!("负载非 UTF-8 编码: {e}")))
    }

    /// 解析事件信封
    pub fn event(&self) -> Result<DomainEvent, ServiceError> {
        DomainEvent::from_slice(&self.payload)
    }
}

// ---------------------------------------------------------------------------
// 客户端配置
// ---------------------------------------------------------------------------

fn base_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.brokers)
        .set("client.id", &config.client_id);
    client
}

/// 持久化投递：全部副本确认 + 幂等生产者
fn producer_config(config: &KafkaConfig, publisher: &PublisherConfig) -> ClientConfig {
    let mut client = base_config(config);
    client
        .set("acks", "all")
        .set("enable.idempotence", "true")
        .set("message.timeout.ms", publisher.send_timeout_ms.to_string());
    client
}

/// 手动存储偏移量，由自动提交按间隔刷到 broker
fn consumer_config(config: &KafkaConfig, consumer: &ConsumerConfig) -> ClientConfig {
    let session_timeout_ms = consumer.heartbeat_seconds * 1000;
    let mut client = base_config(config);
    client
        .set("group.id", &config.consumer_group)
        .set("auto.offset.reset", &config.auto_offset_reset)
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false")
        .set("session.timeout.ms", session_timeout_ms.to_string())
        .set("heartbeat.interval.ms", (session_timeout_ms / 3).to_string())
        .set(
            "max.poll.interval.ms",
            (consumer.blocked_timeout_seconds * 1000).to_string(),
        );
    client
}

fn owned_headers(map: &HashMap<String, String>) -> OwnedHeaders {
    map.iter().fold(OwnedHeaders::new(), |acc, (key, value)| {
        acc.insert(Header {
            key: key.as_str(),
            value: Some(value.as_str()),
        })
    })
}

/// 投递失败分类：消息本身被拒绝的错误不可重试，其余按传输故障处理
fn classify_send_error(err: KafkaError) -> ServiceError {
    match err.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::MessageSizeTooLarge
            | RDKafkaErrorCode::InvalidMessage
            | RDKafkaErrorCode::InvalidMessageSize
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::UnknownTopicOrPartition,
        ) => ServiceError::PublishRejected(err.to_string()),
        _ => ServiceError::Transport(err.to_string()),
    }
}

// ---------------------------------------------------------------------------
// KafkaTransport
// ---------------------------------------------------------------------------

/// 基于 Kafka 的事件传输
///
/// 生产者放在 `ArcSwap` 中，重连时原子替换，不阻塞并发中的发送。
pub struct KafkaTransport {
    producer: ArcSwap<FutureProducer>,
    producer_config: ClientConfig,
    admin_config: ClientConfig,
    topics: Vec<String>,
    partitions: i32,
    replication_factor: i32,
    send_timeout: Duration,
}

impl KafkaTransport {
    /// 创建生产者并声明 topic
    pub async fn connect(
        kafka: &KafkaConfig,
        publisher: &PublisherConfig,
        topics: Vec<String>,
    ) -> Result<Self, ServiceError> {
        let producer_config = producer_config(kafka, publisher);
        let producer: FutureProducer = producer_config
            .create()
            .map_err(|e| ServiceError::Transport(format!("创建生产者失败: {e}")))?;

        let transport = Self {
            producer: ArcSwap::from_pointee(producer),
            producer_config,
            admin_config: base_config(kafka),
            topics,
            partitions: kafka.topic_partitions,
            replication_factor: kafka.replication_factor,
            send_timeout: publisher.send_timeout(),
        };

        // broker 暂不可用时照常启动，首次发布前的健康检查会触发重连并重新声明
        if let Err(e) = transport.ensure_topics().await {
            warn!(error = %e, "启动时声明 topic 失败");
        }

        info!(brokers = %kafka.brokers, topics = ?transport.topics, "Kafka 生产者已初始化");
        Ok(transport)
    }

    /// 声明 topic，已存在视为成功
    pub async fn ensure_topics(&self) -> Result<(), ServiceError> {
        if self.topics.is_empty() {
            return Ok(());
        }

        let admin: AdminClient<DefaultClientContext> = self
            .admin_config
            .create()
            .map_err(|e| ServiceError::Transport(format!("创建管理客户端失败: {e}")))?;

        let new_topics: Vec<NewTopic<'_>> = self
            .topics
            .iter()
            .map(|name| {
                NewTopic::new(
                    name,
                    self.partitions,
                    TopicReplication::Fixed(self.replication_factor),
                )
            })
            .collect();

        let results = admin
            .create_topics(&new_topics, &AdminOptions::new())
            .await
            .map_err(|e| ServiceError::Transport(format!("声明 topic 失败: {e}")))?;

        for result in results {
            match result {
                Ok(topic) => debug!(topic, "topic 已创建"),
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((topic, code)) => {
                    return Err(ServiceError::Transport(format!(
                        "声明 topic {topic} 失败: {code}"
                    )));
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl EventTransport for KafkaTransport {
    async fn is_healthy(&self) -> bool {
        let producer = self.producer.load_full();
        tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, METADATA_TIMEOUT)
                .is_ok()
        })
        .await
        .unwrap_or(false)
    }

    async fn reconnect(&self) -> Result<(), ServiceError> {
        warn!("重建 Kafka 生产者");
        let producer: FutureProducer = self
            .producer_config
            .create()
            .map_err(|e| ServiceError::Transport(format!("重建生产者失败: {e}")))?;
        self.producer.store(Arc::new(producer));
        self.ensure_topics().await
    }

    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, ServiceError> {
        let producer = self.producer.load_full();
        let mut record = FutureRecord::to(&message.topic)
            .payload(&message.payload)
            .headers(owned_headers(&message.headers));
        if let Some(key) = &message.key {
            record = record.key(key);
        }

        let delivery = producer
            .send(record, self.send_timeout)
            .await
            .map_err(|(e, _)| classify_send_error(e))?;

        debug!(
            topic = %message.topic,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok(DeliveryReceipt {
            partition: delivery.partition,
            offset: delivery.offset,
        })
    }
}

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// 面向事件消费的 Kafka 消费者
///
/// 只在处理完成后存储偏移量，处理中的消息在重连后会被重新投递。
pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

impl KafkaConsumer {
    pub fn new(kafka: &KafkaConfig, settings: &ConsumerConfig) -> Result<Self, ServiceError> {
        let consumer: StreamConsumer = consumer_config(kafka, settings)
            .create()
            .map_err(|e| ServiceError::Transport(format!("创建消费者失败: {e}")))?;

        info!(
            brokers = %kafka.brokers,
            group_id = %kafka.consumer_group,
            "Kafka 消费者已初始化"
        );
        Ok(Self { consumer })
    }

    pub fn subscribe(&self, topics: &[String]) -> Result<(), ServiceError> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&topics)
            .map_err(|e| ServiceError::Transport(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    /// 消息流；流上的错误表示连接层故障
    pub fn stream(&self) -> impl Stream<Item = Result<ConsumerMessage, ServiceError>> + '_ {
        self.consumer.stream().map(|result| {
            result
                .map(|msg| ConsumerMessage::from_borrowed(&msg))
                .map_err(|e| ServiceError::Transport(format!("接收 Kafka 消息出错: {e}")))
        })
    }

    /// 存储待提交偏移量（下一条要读取的位置）
    ///
    /// `StreamConsumer::store_offset` 会在传入值上加一，这里走 `store_offsets`
    /// 原样提交 `next_offset`。
    pub fn store_offset(&self, topic: &str, partition: i32, next_offset: i64) -> Result<(), ServiceError> {
        let positions = commit_positions(topic, partition, next_offset)?;
        self.consumer
            .store_offsets(&positions)
            .map_err(|e| ServiceError::Transport(format!("存储偏移量失败: {e}")))
    }
}

/// 构造提交给 broker 的位置列表，偏移量即消费组下次读取的位置
fn commit_positions(
    topic: &str,
    partition: i32,
    next_offset: i64,
) -> Result<TopicPartitionList, ServiceError> {
    let mut positions = TopicPartitionList::new();
    positions
        .add_partition_offset(topic, partition, Offset::Offset(next_offset))
        .map_err(|e| ServiceError::Transport(format!("构造提交位置失败: {e}")))?;
    Ok(positions)
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn message_with_headers(headers: HashMap<String, String>) -> ConsumerMessage {
        ConsumerMessage {
            topic: "catalog.updated".to_string(),
            partition: 0,
            offset: 42,
            key: Some("BOOK-1".to_string()),
            payload: b"hello".to_vec(),
            timestamp: Some(1_700_000_000_000),
            headers,
        }
    }

    #[test]
    fn test_commit_positions_keep_next_offset() {
        let positions = commit_positions("catalog.updated", 2, 12).unwrap();

        let elem = positions.find_partition("catalog.updated", 2).unwrap();
        assert_eq!(elem.offset(), Offset::Offset(12));
        assert_eq!(positions.count(), 1);
    }

    #[test]
    fn test_event_topics_include_dead_letter() {
        let topics = event_topics("cart.dlq");
        assert_eq!(topics.len(), EventType::ALL.len() + 1);
        assert!(topics.contains(&"catalog.updated".to_string()));
        assert!(topics.contains(&"payment.receipt".to_string()));
        assert_eq!(topics.last().map(String::as_str), Some("cart.dlq"));
    }

    #[test]
    fn test_delivery_count_defaults_to_first() {
        let msg = message_with_headers(HashMap::new());
        assert_eq!(msg.delivery_count(), 1);

        let msg = message_with_headers(HashMap::from([(
            headers::DELIVERY_COUNT.to_string(),
            "garbage".to_string(),
        )]));
        assert_eq!(msg.delivery_count(), 1);

        let msg = message_with_headers(HashMap::from([(
            headers::DELIVERY_COUNT.to_string(),
            "0".to_string(),
        )]));
        assert_eq!(msg.delivery_count(), 1);
    }

    #[test]
    fn test_delivery_count_from_header() {
        let msg = message_with_headers(HashMap::from([(
            headers::DELIVERY_COUNT.to_string(),
            "4".to_string(),
        )]));
        assert_eq!(msg.delivery_count(), 4);
        assert_eq!(msg.header(headers::DELIVERY_COUNT), Some("4"));
    }

    #[test]
    fn test_payload_str() {
        let msg = message_with_headers(HashMap::new());
        assert_eq!(msg.payload_str().unwrap(), "hello");

        let mut invalid = msg.clone();
        invalid.payload = vec![0xFF, 0xFE];
        assert!(matches!(
            invalid.payload_str(),
            Err(ServiceError::PoisonMessage(_))
        ));
    }

    #[test]
    fn test_invalid_envelope_is_poison() {
        let msg = message_with_headers(HashMap::new());
        assert!(matches!(msg.event(), Err(ServiceError::PoisonMessage(_))));
    }

    #[test]
    fn test_classify_send_error() {
        let rejected = classify_send_error(KafkaError::MessageProduction(
            RDKafkaErrorCode::MessageSizeTooLarge,
        ));
        assert!(matches!(rejected, ServiceError::PublishRejected(_)));
        assert!(!rejected.is_transient_delivery());

        let transient = classify_send_error(KafkaError::MessageProduction(
            RDKafkaErrorCode::BrokerTransportFailure,
        ));
        assert!(transient.is_transient_delivery());

        let timed_out =
            classify_send_error(KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut));
        assert!(timed_out.is_transient_delivery());
    }

    #[test]
    fn test_consumer_config_timeouts() {
        let config = consumer_config(&KafkaConfig::default(), &ConsumerConfig::default());
        assert_eq!(config.get("session.timeout.ms"), Some("30000"));
        assert_eq!(config.get("heartbeat.interval.ms"), Some("10000"));
        assert_eq!(config.get("max.poll.interval.ms"), Some("300000"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
    }

    #[test]
    fn test_producer_config_is_durable() {
        let config = producer_config(&KafkaConfig::default(), &PublisherConfig::default());
        assert_eq!(config.get("acks"), Some("all"));
        assert_eq!(config.get("enable.idempotence"), Some("true"));
        assert_eq!(config.get("message.timeout.ms"), Some("5000"));
    }
}
