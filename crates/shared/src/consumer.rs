//! 事件消费
//!
//! `EventDispatcher` 对单条消息做解码、幂等校验和处理器分发，产出处置结果；
//! `ConsumerRunner` 负责 Kafka 订阅循环，按处置结果确认、重新入队或写入死信，
//! 连接层故障时按固定间隔无限重连。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, field, info, info_span, warn};

use crate::config::{ConsumerConfig, KafkaConfig, PublisherConfig};
use crate::dlq::{DlqProducer, fallback_message_id};
use crate::error::{Result, ServiceError};
use crate::events::{DomainEvent, EventPayload, EventType};
use crate::idempotency::IdempotencyLedger;
use crate::kafka::{ConsumerMessage, KafkaConsumer, headers};
use crate::observability::{metrics, tracing as otel};
use crate::publisher::{EventTransport, OutboundMessage, deliver};
use crate::retry::RetryPolicy;

/// 事件处理器
///
/// 同一事件可能被重复投递，实现必须幂等。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &DomainEvent, payload: &EventPayload) -> Result<()>;
}

/// 确认类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Processed,
    /// 幂等账本中已存在
    Duplicate,
    /// 未知事件类型或未注册处理器
    Ignored,
}

impl ConsumeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Duplicate => "duplicate",
            Self::Ignored => "ignored",
        }
    }
}

/// 单条消息的处置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack(ConsumeOutcome),
    /// 以递增后的投递次数重新入队
    Requeue { delivery_count: u32, reason: String },
    DeadLetter { reason: String },
}

// ---------------------------------------------------------------------------
// EventDispatcher
// ---------------------------------------------------------------------------

/// 事件分发器
///
/// 顺序：解码信封与负载 → 幂等校验 → 处理器 → 写幂等记录 → 确认。
/// 不依赖具体 broker。
pub struct EventDispatcher {
    consumer_name: String,
    handlers: HashMap<EventType, Arc<dyn EventHandler>>,
    ledger: Arc<dyn IdempotencyLedger>,
    max_deliveries: u32,
}

impl EventDispatcher {
    pub fn new(
        consumer_name: &str,
        ledger: Arc<dyn IdempotencyLedger>,
        max_deliveries: u32,
    ) -> Self {
        Self {
            consumer_name: consumer_name.to_string(),
            handlers: HashMap::new(),
            ledger,
            max_deliveries: max_deliveries.max(1),
        }
    }

    pub fn register(mut self, event_type: EventType, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(event_type, handler);
        self
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// 已注册处理器的路由键
    pub fn event_types(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .handlers
            .keys()
            .map(|t| t.routing_key().to_string())
            .collect();
        topics.sort();
        topics
    }

    pub async fn dispatch(&self, message: &ConsumerMessage) -> Disposition {
        let span = info_span!(
            "consume_event",
            consumer = %self.consumer_name,
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            event_type = field::Empty,
            event_id = field::Empty,
        );
        otel::set_parent_from_headers(&span, &message.headers);

        let start = Instant::now();
        let (event_type, disposition) = self
            .dispatch_inner(message, &span)
            .instrument(span.clone())
            .await;

        let outcome = match &disposition {
            Disposition::Ack(outcome) => outcome.as_str(),
            Disposition::Requeue { .. } => "requeued",
            Disposition::DeadLetter { .. } if event_type.is_none() => "invalid_payload",
            Disposition::DeadLetter { .. } => "dead_lettered",
        };
        metrics::record_event_consumed(
            event_type.as_deref().unwrap_or(message.topic.as_str()),
            outcome,
            start.elapsed().as_secs_f64(),
        );

        disposition
    }

    /// 返回可识别的事件类型（用于指标，负载无效时为 None）与处置
    async fn dispatch_inner(
        &self,
        message: &ConsumerMessage,
        span: &tracing::Span,
    ) -> (Option<String>, Disposition) {
        let event = match message.event() {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "事件信封无效，直接进入死信");
                return (None, Disposition::DeadLetter { reason: e.to_string() });
            }
        };
        span.record("event_type", event.event_type.as_str());
        span.record("event_id", field::display(event.event_id));

        let payload = match event.typed_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "事件负载无效，直接进入死信");
                return (None, Disposition::DeadLetter { reason: e.to_string() });
            }
        };

        let event_type = Some(event.event_type.clone());
        let delivery_count = message.delivery_count();

        match self.ledger.has_processed(&event.event_id).await {
            Ok(true) => {
                info!("事件已处理过，跳过");
                return (event_type, Disposition::Ack(ConsumeOutcome::Duplicate));
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "幂等账本不可用");
                return (event_type, self.retry_or_dead_letter(delivery_count, &e));
            }
        }

        let handler = payload.as_ref().and_then(|p| {
            self.handlers
                .get(&p.event_type())
                .map(|handler| (handler, p))
        });
        let Some((handler, payload)) = handler else {
            info!("没有对应的处理器，确认并忽略");
            return (event_type, Disposition::Ack(ConsumeOutcome::Ignored));
        };

        if let Err(e) = handler.handle(&event, payload).await {
            if matches!(e, ServiceError::PoisonMessage(_)) {
                warn!(error = %e, "处理器判定为毒消息");
                return (event_type, Disposition::DeadLetter { reason: e.to_string() });
            }
            error!(error = %e, delivery_count, "事件处理失败");
            return (event_type, self.retry_or_dead_letter(delivery_count, &e));
        }

        match self
            .ledger
            .mark_processed(&event.event_id, &event.event_type)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!("幂等记录已被并发写入"),
            // 处理器本身幂等，重复投递时结果不变
            Err(e) => warn!(error = %e, "写入幂等记录失败"),
        }

        debug!("事件处理完成");
        (event_type, Disposition::Ack(ConsumeOutcome::Processed))
    }

    fn retry_or_dead_letter(&self, delivery_count: u32, err: &ServiceError) -> Disposition {
        if delivery_count >= self.max_deliveries {
            Disposition::DeadLetter {
                reason: format!("已达最大投递次数 {}: {err}", self.max_deliveries),
            }
        } else {
            Disposition::Requeue {
                delivery_count: delivery_count + 1,
                reason: err.to_string(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// InflightOffsets
// ---------------------------------------------------------------------------

/// 单个分区的水位；`stored` 是已交给 broker 的下一条读取位置
#[derive(Debug)]
struct PartitionOffsets {
    pending: BTreeSet<i64>,
    highest_done: i64,
    stored: i64,
}

impl PartitionOffsets {
    /// 以本次会话在该分区收到的第一条消息为起点
    fn starting_at(offset: i64) -> Self {
        Self {
            pending: BTreeSet::new(),
            highest_done: offset - 1,
            stored: offset,
        }
    }
}

/// 并发处理下的偏移量水位
///
/// 只有低于最小未完成偏移量的消息才能提交，避免乱序完成时跳过未处理的消息。
#[derive(Debug, Default)]
pub struct InflightOffsets {
    partitions: Mutex<HashMap<(String, i32), PartitionOffsets>>,
}

impl InflightOffsets {
    pub fn begin(&self, topic: &str, partition: i32, offset: i64) {
        self.partitions
            .lock()
            .entry((topic.to_string(), partition))
            .or_insert_with(|| PartitionOffsets::starting_at(offset))
            .pending
            .insert(offset);
    }

    /// 标记完成，返回新的可提交位置（下一条要读取的偏移量）
    pub fn complete(&self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let mut partitions = self.partitions.lock();
        let state = partitions.get_mut(&(topic.to_string(), partition))?;

        if !state.pending.remove(&offset) {
            return None;
        }
        state.highest_done = state.highest_done.max(offset);

        let next = match state.pending.first() {
            Some(&lowest) => lowest,
            None => state.highest_done + 1,
        };

        if next > state.stored {
            state.stored = next;
            Some(next)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// ConsumerRunner
// ---------------------------------------------------------------------------

/// Kafka 消费循环
pub struct ConsumerRunner {
    kafka: KafkaConfig,
    settings: ConsumerConfig,
    dispatcher: Arc<EventDispatcher>,
    transport: Arc<dyn EventTransport>,
    dlq: DlqProducer,
    policy: RetryPolicy,
}

impl ConsumerRunner {
    pub fn new(
        kafka: KafkaConfig,
        settings: ConsumerConfig,
        publisher: &PublisherConfig,
        dispatcher: Arc<EventDispatcher>,
        transport: Arc<dyn EventTransport>,
    ) -> Self {
        let policy = publisher.retry_policy();
        let dlq = DlqProducer::new(
            transport.clone(),
            &settings.dead_letter_topic,
            dispatcher.consumer_name(),
            policy.clone(),
        );

        Self {
            kafka,
            settings,
            dispatcher,
            transport,
            dlq,
            policy,
        }
    }

    /// 订阅的 topic：配置优先，否则取已注册处理器的路由键
    pub fn topics(&self) -> Vec<String> {
        if self.settings.topics.is_empty() {
            self.dispatcher.event_types()
        } else {
            self.settings.topics.clone()
        }
    }

    /// 运行直到收到关闭信号；连接故障后等待固定间隔重连，不设上限
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let consumer_name = self.dispatcher.consumer_name().to_string();
        info!(consumer = %consumer_name, topics = ?self.topics(), "事件消费循环已启动");

        loop {
            if is_shutdown(&shutdown) {
                break;
            }

            match self.consume_once(shutdown.clone()).await {
                Ok(()) => break,
                Err(e) => {
                    error!(
                        consumer = %consumer_name,
                        error = %e,
                        delay_ms = self.settings.reconnect_delay_ms,
                        "消费连接中断，稍后重连"
                    );
                    metrics::record_consumer_reconnect(&consumer_name);

                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.reconnect_delay()) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        info!(consumer = %consumer_name, "事件消费循环已退出");
    }

    /// 建立一次连接并消费到关闭或出错
    ///
    /// 正常关闭返回 Ok；连接或处置失败返回 Err，未提交的消息在重连后重新投递。
    async fn consume_once(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let consumer = KafkaConsumer::new(&self.kafka, &self.settings)?;
        consumer.subscribe(&self.topics())?;

        let offsets = InflightOffsets::default();
        let consumer = &consumer;
        let offsets = &offsets;

        consumer
            .stream()
            .take_until(wait_for_shutdown(shutdown.clone()))
            .try_for_each_concurrent(self.settings.prefetch.max(1), |message| {
                offsets.begin(&message.topic, message.partition, message.offset);
                async move {
                    self.apply(&message).await?;
                    if let Some(next) =
                        offsets.complete(&message.topic, message.partition, message.offset)
                    {
                        consumer.store_offset(&message.topic, message.partition, next)?;
                    }
                    Ok(())
                }
            })
            .await?;

        if is_shutdown(&shutdown) {
            Ok(())
        } else {
            Err(ServiceError::Transport("Kafka 消息流意外结束".to_string()))
        }
    }

    async fn apply(&self, message: &ConsumerMessage) -> Result<()> {
        match self.dispatcher.dispatch(message).await {
            Disposition::Ack(_) => Ok(()),
            Disposition::Requeue {
                delivery_count,
                reason,
            } => {
                debug!(delivery_count, reason, "重新入队");
                let outbound = requeue_message(message, delivery_count);
                deliver(self.transport.as_ref(), &self.policy, "requeue_event", &outbound)
                    .await
                    .map(|_| ())
            }
            Disposition::DeadLetter { reason } => {
                let message_id = message
                    .event()
                    .map(|e| e.event_id.to_string())
                    .unwrap_or_else(|_| fallback_message_id(message));
                self.dlq.send(message, &message_id, &reason).await.map(|_| ())
            }
        }
    }
}

/// 复制原消息并写入新的投递次数
pub fn requeue_message(message: &ConsumerMessage, delivery_count: u32) -> OutboundMessage {
    let mut message_headers = message.headers.clone();
    message_headers.insert(
        headers::DELIVERY_COUNT.to_string(),
        delivery_count.to_string(),
    );

    OutboundMessage {
        topic: message.topic.clone(),
        key: message.key.clone(),
        payload: message.payload.clone(),
        headers: message_headers,
    }
}

fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
