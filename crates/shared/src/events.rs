//! 领域事件模型
//!
//! 定义事件信封 `DomainEvent` 与按事件类型区分的强类型负载 `EventPayload`。
//! 线上传输时 payload 是 JSON 对象；消费方在分发前按 `event_type` 解码为封闭的负载集合，
//! 结构不符的已知事件视为毒消息，未知事件类型则保持前向兼容（确认并忽略）。

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ServiceError;
use crate::money::Money;

pub const EVENT_VERSION: &str = "1.0.0";

// ---------------------------------------------------------------------------
// EventType — 已知事件类型
// ---------------------------------------------------------------------------

/// 已知事件类型
///
/// 事件类型同时决定负载结构和路由键（topic 名称）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    // 目录与库存（购物车消费）
    CatalogUpdated,
    InventoryUpdated,

    // 购物车发布
    CartItemAdded,
    CartItemRemoved,
    CartCleared,
    CartCheckoutRequested,

    // 支付发布
    PaymentSucceeded,
    PaymentFailed,
    PaymentReceipt,
}

impl EventType {
    pub const ALL: [EventType; 9] = [
        Self::CatalogUpdated,
        Self::InventoryUpdated,
        Self::CartItemAdded,
        Self::CartItemRemoved,
        Self::CartCleared,
        Self::CartCheckoutRequested,
        Self::PaymentSucceeded,
        Self::PaymentFailed,
        Self::PaymentReceipt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CatalogUpdated => "catalog.updated",
            Self::InventoryUpdated => "inventory.updated",
            Self::CartItemAdded => "cart.item_added",
            Self::CartItemRemoved => "cart.item_removed",
            Self::CartCleared => "cart.cleared",
            Self::CartCheckoutRequested => "cart.checkout_requested",
            Self::PaymentSucceeded => "payment.succeeded",
            Self::PaymentFailed => "payment.failed",
            Self::PaymentReceipt => "payment.receipt",
        }
    }

    /// 路由键与事件类型同名
    pub fn routing_key(&self) -> &'static str {
        self.as_str()
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// 负载结构
// ---------------------------------------------------------------------------

/// 目录商品变更
///
/// `fields_changed` 列出变更的字段名，变更后的值以同名字段平铺在负载中。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogUpdated {
    pub sku: String,
    #[serde(default)]
    pub fields_changed: Vec<String>,
    /// 新价格（最小货币单位）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl CatalogUpdated {
    pub fn touches_pricing(&self) -> bool {
        self.fields_changed
            .iter()
            .any(|f| f == "price" || f == "currency")
    }

    fn validate(&self) -> Result<(), String> {
        if self.sku.is_empty() {
            return Err("sku is required".to_string());
        }
        if self.fields_changed.iter().any(|f| f == "price") && self.price.is_none() {
            return Err("price listed in fields_changed but missing".to_string());
        }
        if self.fields_changed.iter().any(|f| f == "currency")
            && self.currency.as_deref().is_none_or(str::is_empty)
        {
            return Err("currency listed in fields_changed but missing".to_string());
        }
        Ok(())
    }
}

/// 库存变更
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryUpdated {
    pub item_id: String,
    pub previous_quantity: i64,
    pub new_quantity: i64,
    pub delta: i64,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItemAdded {
    pub user_id: String,
    pub sku: String,
    pub qty: i32,
    /// 单价（最小货币单位）
    pub price: i64,
    pub currency: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItemRemoved {
    pub user_id: String,
    pub sku: String,
    pub qty: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartCleared {
    pub user_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutItem {
    pub sku: String,
    pub qty: i32,
    pub price: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutRequested {
    pub user_id: String,
    pub items: Vec<CheckoutItem>,
    pub total_amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentSucceeded {
    pub order_id: String,
    pub payment_id: String,
    pub user_id: String,
    pub amount: Money,
    pub status: String,
    pub payment_method: String,
    #[serde(default)]
    pub transaction_id: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentFailed {
    pub order_id: String,
    pub payment_id: String,
    pub user_id: String,
    pub amount: Money,
    pub status: String,
    pub payment_method: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptData {
    pub payment_method: String,
    pub last4: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub transaction_id: Option<String>,
    pub captured_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub order_id: String,
    pub payment_id: String,
    pub user_id: String,
    pub receipt_data: ReceiptData,
}

// ---------------------------------------------------------------------------
// EventPayload — 按事件类型区分的负载
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    CatalogUpdated(CatalogUpdated),
    InventoryUpdated(InventoryUpdated),
    CartItemAdded(CartItemAdded),
    CartItemRemoved(CartItemRemoved),
    CartCleared(CartCleared),
    CheckoutRequested(CheckoutRequested),
    PaymentSucceeded(PaymentSucceeded),
    PaymentFailed(PaymentFailed),
    PaymentReceipt(PaymentReceipt),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::CatalogUpdated(_) => EventType::CatalogUpdated,
            Self::InventoryUpdated(_) => EventType::InventoryUpdated,
            Self::CartItemAdded(_) => EventType::CartItemAdded,
            Self::CartItemRemoved(_) => EventType::CartItemRemoved,
            Self::CartCleared(_) => EventType::CartCleared,
            Self::CheckoutRequested(_) => EventType::CartCheckoutRequested,
            Self::PaymentSucceeded(_) => EventType::PaymentSucceeded,
            Self::PaymentFailed(_) => EventType::PaymentFailed,
            Self::PaymentReceipt(_) => EventType::PaymentReceipt,
        }
    }

    /// 分区键：同一实体的事件落在同一分区，保持相对顺序
    pub fn partition_key(&self) -> &str {
        match self {
            Self::CatalogUpdated(p) => &p.sku,
            Self::InventoryUpdated(p) => &p.item_id,
            Self::CartItemAdded(p) => &p.user_id,
            Self::CartItemRemoved(p) => &p.user_id,
            Self::CartCleared(p) => &p.user_id,
            Self::CheckoutRequested(p) => &p.user_id,
            Self::PaymentSucceeded(p) => &p.order_id,
            Self::PaymentFailed(p) => &p.order_id,
            Self::PaymentReceipt(p) => &p.order_id,
        }
    }

    /// 按事件类型解码负载
    ///
    /// 未知事件类型返回 `Ok(None)`；已知类型结构不符返回 `PoisonMessage`。
    pub fn decode(event_type: &str, payload: &Map<String, Value>) -> Result<Option<Self>, ServiceError> {
        let Some(kind) = EventType::parse(event_type) else {
            return Ok(None);
        };

        let decoded = match kind {
            EventType::CatalogUpdated => {
                let body: CatalogUpdated = decode_body(kind, payload)?;
                body.validate()
                    .map_err(|reason| poison(kind, &reason))?;
                Self::CatalogUpdated(body)
            }
            EventType::InventoryUpdated => Self::InventoryUpdated(decode_body(kind, payload)?),
            EventType::CartItemAdded => Self::CartItemAdded(decode_body(kind, payload)?),
            EventType::CartItemRemoved => Self::CartItemRemoved(decode_body(kind, payload)?),
            EventType::CartCleared => Self::CartCleared(decode_body(kind, payload)?),
            EventType::CartCheckoutRequested => {
                Self::CheckoutRequested(decode_body(kind, payload)?)
            }
            EventType::PaymentSucceeded => Self::PaymentSucceeded(decode_body(kind, payload)?),
            EventType::PaymentFailed => Self::PaymentFailed(decode_body(kind, payload)?),
            EventType::PaymentReceipt => Self::PaymentReceipt(decode_body(kind, payload)?),
        };

        Ok(Some(decoded))
    }

    fn to_map(&self) -> Result<Map<String, Value>, ServiceError> {
        let value = match self {
            Self::CatalogUpdated(p) => serde_json::to_value(p)?,
            Self::InventoryUpdated(p) => serde_json::to_value(p)?,
            Self::CartItemAdded(p) => serde_json::to_value(p)?,
            Self::CartItemRemoved(p) => serde_json::to_value(p)?,
            Self::CartCleared(p) => serde_json::to_value(p)?,
            Self::CheckoutRequested(p) => serde_json::to_value(p)?,
            Self::PaymentSucceeded(p) => serde_json::to_value(p)?,
            Self::PaymentFailed(p) => serde_json::to_value(p)?,
            Self::PaymentReceipt(p) => serde_json::to_value(p)?,
        };

        match value {
            Value::Object(map) => Ok(map),
            other => Err(ServiceError::Internal(format!(
                "事件负载必须是 JSON 对象: {other}"
            ))),
        }
    }
}

fn decode_body<T: DeserializeOwned>(
    kind: EventType,
    payload: &Map<String, Value>,
) -> Result<T, ServiceError> {
    serde_json::from_value(Value::Object(payload.clone()))
        .map_err(|e| poison(kind, &e.to_string()))
}

fn poison(kind: EventType, reason: &str) -> ServiceError {
    ServiceError::PoisonMessage(format!("{kind} 负载无效: {reason}"))
}

// ---------------------------------------------------------------------------
// DomainEvent — 事件信封
// ---------------------------------------------------------------------------

/// 事件信封
///
/// `event_id` 在生产方创建时生成一次，重试与重投递都复用同一个 id，
/// 消费方以此做幂等校验。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub event_type: String,
    #[serde(default = "default_event_version")]
    pub event_version: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

fn default_event_version() -> String {
    EVENT_VERSION.to_string()
}

impl DomainEvent {
    /// 由强类型负载构建事件，生成 UUID v7 作为 event_id
    pub fn new(payload: &EventPayload) -> Result<Self, ServiceError> {
        Ok(Self {
            event_id: Uuid::now_v7(),
            event_type: payload.event_type().as_str().to_string(),
            event_version: EVENT_VERSION.to_string(),
            timestamp: Utc::now(),
            correlation_id: None,
            payload: payload.to_map()?,
        })
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// 解码强类型负载，语义见 [`EventPayload::decode`]
    pub fn typed_payload(&self) -> Result<Option<EventPayload>, ServiceError> {
        EventPayload::decode(&self.event_type, &self.payload)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ServiceError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// 解析线上字节；非 JSON 或缺少必需字段都视为毒消息
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ServiceError> {
        let event: Self = serde_json::from_slice(bytes)
            .map_err(|e| ServiceError::PoisonMessage(format!("事件信封无效: {e}")))?;

        if event.event_type.is_empty() {
            return Err(ServiceError::PoisonMessage("event_type 为空".to_string()));
        }

        Ok(event)
    }
}
