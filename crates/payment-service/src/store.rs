//! 支付记录存储
//!
//! 按 `payment_id` 保存全部记录，另按 `order_id` 索引当前可复用的 AUTHORIZED 记录。

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::{PaymentError, Result};
use crate::models::{Payment, PaymentStatus};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn get(&self, payment_id: &str) -> Result<Option<Payment>>;

    /// payment_id 已存在时返回 false 且不覆盖
    async fn put_if_absent(&self, payment: &Payment) -> Result<bool>;

    async fn update(&self, payment: &Payment) -> Result<()>;

    /// 该订单当前 AUTHORIZED 的支付
    async fn find_by_order_id(&self, order_id: &str) -> Result<Option<Payment>>;
}

/// 内存实现，进程重启后数据丢失
#[derive(Default)]
pub struct InMemoryPaymentStore {
    payments: DashMap<String, Payment>,
    by_order: DashMap<String, String>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.payments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payments.is_empty()
    }

    /// 某订单的全部记录（含失败记录）
    pub fn payments_for_order(&self, order_id: &str) -> Vec<Payment> {
        self.payments
            .iter()
            .filter(|entry| entry.order_id == order_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn reindex(&self, payment: &Payment) {
        if payment.status == PaymentStatus::Authorized {
            self.by_order
                .insert(payment.order_id.clone(), payment.payment_id.clone());
        } else {
            self.by_order
                .remove_if(&payment.order_id, |_, id| *id == payment.payment_id);
        }
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn get(&self, payment_id: &str) -> Result<Option<Payment>> {
        Ok(self.payments.get(payment_id).map(|p| p.value().clone()))
    }

    async fn put_if_absent(&self, payment: &Payment) -> Result<bool> {
        let inserted = match self.payments.entry(payment.payment_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(payment.clone());
                true
            }
        };
        if inserted {
            self.reindex(payment);
        }
        Ok(inserted)
    }

    async fn update(&self, payment: &Payment) -> Result<()> {
        match self.payments.get_mut(&payment.payment_id) {
            Some(mut existing) => *existing = payment.clone(),
            None => return Err(PaymentError::PaymentNotFound(payment.payment_id.clone())),
        }
        self.reindex(payment);
        Ok(())
    }

    async fn find_by_order_id(&self, order_id: &str) -> Result<Option<Payment>> {
        let Some(payment_id) = self.by_order.get(order_id).map(|id| id.value().clone()) else {
            return Ok(None);
        };
        Ok(self
            .payments
            .get(&payment_id)
            .filter(|p| p.status == PaymentStatus::Authorized)
            .map(|p| p.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PaymentMethod, PaymentMethodType};
    use bookstore_shared::Money;
    use chrono::Utc;

    fn authorized(order_id: &str) -> Payment {
        let mut payment = Payment::pending(
            order_id,
            "U1",
            Money::new(5000, "USD"),
            PaymentMethod {
                method_type: PaymentMethodType::CreditCard,
                last4: "4242".into(),
                token: "tok_1".into(),
            },
        );
        payment.mark_authorized("TXN-ABC".into());
        payment
    }

    #[tokio::test]
    async fn test_put_if_absent_does_not_overwrite() {
        let store = InMemoryPaymentStore::new();
        let payment = authorized("O1");

        assert!(store.put_if_absent(&payment).await.unwrap());
        let mut other = payment.clone();
        other.user_id = "U2".into();
        assert!(!store.put_if_absent(&other).await.unwrap());

        let stored = store.get(&payment.payment_id).await.unwrap().unwrap();
        assert_eq!(stored.user_id, "U1");
    }

    #[tokio::test]
    async fn test_order_index_tracks_authorized_only() {
        let store = InMemoryPaymentStore::new();
        let mut payment = authorized("O1");
        store.put_if_absent(&payment).await.unwrap();
        assert!(store.find_by_order_id("O1").await.unwrap().is_some());

        payment.mark_captured(Utc::now());
        store.update(&payment).await.unwrap();
        assert!(store.find_by_order_id("O1").await.unwrap().is_none());
        assert_eq!(store.payments_for_order("O1").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_payment_is_not_indexed() {
        let store = InMemoryPaymentStore::new();
        let mut payment = authorized("O1");
        payment.mark_failed("declined");

        store.put_if_absent(&payment).await.unwrap();
        assert!(store.find_by_order_id("O1").await.unwrap().is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_payment_is_not_found() {
        let store = InMemoryPaymentStore::new();
        let result = store.update(&authorized("O1")).await;
        assert!(matches!(result, Err(PaymentError::PaymentNotFound(_))));
    }
}
