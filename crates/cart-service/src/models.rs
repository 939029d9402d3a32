//! 购物车领域模型
//!
//! 购物车只有一种币种，总价在每次变更后由明细重新求和，不做增量维护。

use bookstore_shared::Money;
use bookstore_shared::events::{CheckoutItem, CheckoutRequested};
use bookstore_shared::money::{DEFAULT_CURRENCY, MoneyError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CartError, Result};

/// 购物车明细
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub sku: String,
    /// 至少为 1
    pub qty: i32,
    /// 单价
    pub price: Money,
    pub title: String,
}

impl CartItem {
    pub fn line_total(&self) -> std::result::Result<Money, MoneyError> {
        self.price.checked_mul(i64::from(self.qty))
    }
}

/// 用户购物车
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub user_id: String,
    /// 按加入顺序排列
    pub items: Vec<CartItem>,
    pub total: Money,
    pub updated_at: DateTime<Utc>,
}

impl Cart {
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            items: Vec::new(),
            total: Money::zero(DEFAULT_CURRENCY),
            updated_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get_item(&self, sku: &str) -> Option<&CartItem> {
        self.items.iter().find(|item| item.sku == sku)
    }

    /// 加入商品；已存在则累加数量并刷新单价与标题
    ///
    /// 返回是否为新明细。
    pub fn add_or_merge(&mut self, sku: &str, qty: i32, price: Money, title: &str) -> Result<bool> {
        if let Some(other) = self
            .items
            .iter()
            .find(|item| item.sku != sku && !item.price.same_unit(&price))
        {
            return Err(CartError::CurrencyMismatch {
                cart: other.price.currency.clone(),
                item: price.currency,
            });
        }

        let is_new = match self.items.iter_mut().find(|item| item.sku == sku) {
            Some(item) => {
                item.qty = item.qty.checked_add(qty).ok_or(MoneyError::Overflow)?;
                item.price = price;
                item.title = title.to_string();
                false
            }
            None => {
                self.items.push(CartItem {
                    sku: sku.to_string(),
                    qty,
                    price,
                    title: title.to_string(),
                });
                true
            }
        };

        self.recompute_total()?;
        Ok(is_new)
    }

    /// 移除明细，返回被移除的项
    pub fn remove_item(&mut self, sku: &str) -> Result<Option<CartItem>> {
        let Some(index) = self.items.iter().position(|item| item.sku == sku) else {
            return Ok(None);
        };

        let removed = self.items.remove(index);
        self.recompute_total()?;
        Ok(Some(removed))
    }

    /// 更新某个 sku 的单价，数量不变
    ///
    /// 返回是否命中。改价后与其他明细币种冲突时返回错误且购物车不变。
    pub fn reprice(&mut self, sku: &str, price: &Money) -> Result<bool> {
        let Some(index) = self.items.iter().position(|item| item.sku == sku) else {
            return Ok(false);
        };

        let previous = std::mem::replace(&mut self.items[index].price, price.clone());
        if let Err(e) = self.recompute_total() {
            self.items[index].price = previous;
            return Err(e);
        }
        Ok(true)
    }

    /// 按明细重新计算总价
    pub fn recompute_total(&mut self) -> Result<()> {
        let zero = match self.items.first() {
            Some(first) => Money::zero(first.price.currency.clone())
                .with_decimal_places(first.price.decimal_places),
            None => Money::zero(self.total.currency.clone())
                .with_decimal_places(self.total.decimal_places),
        };

        let lines = self
            .items
            .iter()
            .map(CartItem::line_total)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        self.total = Money::sum(zero, lines.iter())?;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn checkout_payload(&self) -> CheckoutRequested {
        CheckoutRequested {
            user_id: self.user_id.clone(),
            items: self
                .items
                .iter()
                .map(|item| CheckoutItem {
                    sku: item.sku.clone(),
                    qty: item.qty,
                    price: item.price.amount,
                })
                .collect(),
            total_amount: self.total.amount,
            currency: self.total.currency.clone(),
        }
    }
}
