//! 仓储 Trait 定义

use async_trait::async_trait;
use bookstore_shared::Money;

use crate::error::Result;
use crate::models::{Cart, CartItem};

/// 购物车仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CartRepositoryTrait: Send + Sync {
    async fn get_cart(&self, user_id: &str) -> Result<Option<Cart>>;

    /// 整体覆盖写入
    async fn save_cart(&self, cart: &Cart) -> Result<()>;

    /// 在同一次原子写入中加入或合并明细，购物车不存在时创建
    ///
    /// 返回写入后的购物车和是否为新明细。
    async fn add_item(
        &self,
        user_id: &str,
        sku: &str,
        qty: i32,
        price: &Money,
        title: &str,
    ) -> Result<(Cart, bool)>;

    /// 在同一次原子写入中移除明细；购物车或明细不存在时返回 None
    async fn remove_item(&self, user_id: &str, sku: &str) -> Result<Option<(Cart, CartItem)>>;

    /// 返回是否存在并被删除
    async fn delete_cart(&self, user_id: &str) -> Result<bool>;

    /// 更新所有包含该 sku 的购物车中的单价并重算总价，返回更新的购物车数量
    async fn update_item_price(&self, sku: &str, price: &Money) -> Result<u64>;
}
