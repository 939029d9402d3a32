//! 支付服务
//!
//! 授权与扣款状态机，扣款成功后发布支付事件并通知订单服务。
//!
//! ## 模块结构
//!
//! - `models`: 支付领域模型与状态流转
//! - `error`: 错误类型定义
//! - `store`: 支付记录存储
//! - `processor`: 支付处理器（模拟收单方）
//! - `events`: 支付事件发布
//! - `order_client`: 订单服务 gRPC 客户端
//! - `lock`: 订单级互斥锁
//! - `service`: 支付状态机
//! - `grpc`: gRPC 服务端实现

pub mod error;
pub mod events;
pub mod grpc;
pub mod lock;
pub mod models;
pub mod order_client;
pub mod processor;
pub mod service;
pub mod store;

pub use error::{PaymentError, Result};
pub use events::PaymentEvents;
pub use grpc::PaymentServiceImpl;
pub use models::{Payment, PaymentMethod, PaymentMethodType, PaymentStatus};
pub use order_client::{NoopOrderNotifier, OrderClient, OrderNotifier};
pub use processor::{Declined, MockProcessor, PaymentProcessor};
pub use service::PaymentService;
pub use store::{InMemoryPaymentStore, PaymentStore};
