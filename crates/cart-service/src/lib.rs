//! 购物车服务
//!
//! 管理用户购物车，并通过事件与目录、订单侧保持一致。
//!
//! ## 核心功能
//!
//! - **购物车维护**：加购、移除、清空、查询，总价始终等于各行小计之和
//! - **结算**：发布 `cart.checkout_requested`，由订单侧异步创建订单
//! - **价格同步**：消费 `catalog.updated`，把新单价写入所有包含该商品的购物车
//!
//! ## 模块结构
//!
//! - `models`: 购物车领域模型
//! - `error`: 错误类型定义
//! - `repository`: 购物车仓储（PostgreSQL / 内存）
//! - `catalog_client`: 目录服务 gRPC 客户端
//! - `service`: 业务服务层
//! - `handlers`: 事件处理器
//! - `grpc`: gRPC 服务端实现

pub mod catalog_client;
pub mod error;
pub mod grpc;
pub mod handlers;
pub mod models;
pub mod repository;
pub mod service;

/// 购物车表结构迁移
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use catalog_client::{BookInfo, CatalogClient, CatalogLookup};
pub use error::{CartError, Result};
pub use grpc::CartServiceImpl;
pub use handlers::{InventoryHandler, PriceSyncHandler};
pub use models::{Cart, CartItem};
pub use repository::{CartRepository, CartRepositoryTrait, InMemoryCartRepository};
pub use service::CartService;
