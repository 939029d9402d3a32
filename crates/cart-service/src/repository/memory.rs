//! 内存购物车仓储，用于测试和 `--memory` 模式

use async_trait::async_trait;
use bookstore_shared::Money;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::warn;

use super::traits::CartRepositoryTrait;
use crate::error::Result;
use crate::models::{Cart, CartItem};

#[derive(Default)]
pub struct InMemoryCartRepository {
    carts: DashMap<String, Cart>,
}

impl InMemoryCartRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.carts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.carts.is_empty()
    }
}

#[async_trait]
impl CartRepositoryTrait for InMemoryCartRepository {
    async fn get_cart(&self, user_id: &str) -> Result<Option<Cart>> {
        Ok(self.carts.get(user_id).map(|c| c.clone()))
    }

    async fn save_cart(&self, cart: &Cart) -> Result<()> {
        self.carts.insert(cart.user_id.clone(), cart.clone());
        Ok(())
    }

    async fn add_item(
        &self,
        user_id: &str,
        sku: &str,
        qty: i32,
        price: &Money,
        title: &str,
    ) -> Result<(Cart, bool)> {
        // entry 持有分片写锁，读改写期间改价无法插入
        match self.carts.entry(user_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let mut cart = occupied.get().clone();
                let is_new = cart.add_or_merge(sku, qty, price.clone(), title)?;
                occupied.insert(cart.clone());
                Ok((cart, is_new))
            }
            Entry::Vacant(vacant) => {
                let mut cart = Cart::empty(user_id);
                let is_new = cart.add_or_merge(sku, qty, price.clone(), title)?;
                vacant.insert(cart.clone());
                Ok((cart, is_new))
            }
        }
    }

    async fn remove_item(&self, user_id: &str, sku: &str) -> Result<Option<(Cart, CartItem)>> {
        let Some(mut entry) = self.carts.get_mut(user_id) else {
            return Ok(None);
        };

        let mut cart = entry.value().clone();
        let Some(removed) = cart.remove_item(sku)? else {
            return Ok(None);
        };
        *entry = cart.clone();
        Ok(Some((cart, removed)))
    }

    async fn delete_cart(&self, user_id: &str) -> Result<bool> {
        Ok(self.carts.remove(user_id).is_some())
    }

    async fn update_item_price(&self, sku: &str, price: &Money) -> Result<u64> {
        let mut updated = 0u64;
        for mut entry in self.carts.iter_mut() {
            match entry.reprice(sku, price) {
                Ok(true) => updated += 1,
                Ok(false) => {}
                Err(e) => warn!(user_id = %entry.key(), sku, error = %e, "购物车改价失败，已跳过"),
            }
        }
        Ok(updated)
    }
}
