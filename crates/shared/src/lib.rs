//! 共享库
//!
//! 购物车、支付等服务共用的基础设施：金额类型、领域事件信封、错误分类、配置加载、
//! 事件发布（有界重试 + 重连）、幂等消费（幂等账本 + 死信）、Redis / PostgreSQL 连接、
//! 健康检查与可观测性。

pub mod cache;
pub mod config;
pub mod consumer;
pub mod database;
pub mod dlq;
pub mod error;
pub mod events;
pub mod health;
pub mod idempotency;
pub mod kafka;
pub mod money;
pub mod observability;
pub mod publisher;
pub mod retry;
pub mod test_utils;

pub use error::{Result, ServiceError};
pub use events::{DomainEvent, EventPayload};
pub use money::Money;
