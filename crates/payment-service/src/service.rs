//! 支付状态机
//!
//! 同一订单的授权与扣款在订单级互斥锁内执行，保证：
//! - 并发授权只产生一条 AUTHORIZED 记录
//! - 扣款结果不会被并发请求的失败覆盖

use std::sync::Arc;
use std::time::Instant;

use bookstore_shared::observability::metrics;
use bookstore_shared::{Money, ServiceError};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::error::{PaymentError, Result};
use crate::events::PaymentEvents;
use crate::lock::OrderLocks;
use crate::models::{Payment, PaymentMethod, PaymentStatus};
use crate::order_client::{ORDER_CONFIRMED, OrderNotifier};
use crate::processor::{Declined, PaymentProcessor};
use crate::store::PaymentStore;

pub struct PaymentService {
    store: Arc<dyn PaymentStore>,
    processor: Arc<dyn PaymentProcessor>,
    events: PaymentEvents,
    orders: Arc<dyn OrderNotifier>,
    order_locks: OrderLocks,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        processor: Arc<dyn PaymentProcessor>,
        events: PaymentEvents,
        orders: Arc<dyn OrderNotifier>,
    ) -> Self {
        Self {
            store,
            processor,
            events,
            orders,
            order_locks: OrderLocks::new(),
        }
    }

    pub fn events(&self) -> &PaymentEvents {
        &self.events
    }

    /// 授权（预留资金）
    ///
    /// 订单已有 AUTHORIZED 支付时原样返回。处理器拒绝时保存 FAILED 记录并返回错误，
    /// 失败记录不会被后续授权复用。
    #[instrument(skip(self, amount, method), fields(amount = amount.amount, currency = %amount.currency))]
    pub async fn authorize(
        &self,
        order_id: &str,
        amount: Money,
        method: PaymentMethod,
        user_id: &str,
    ) -> Result<Payment> {
        let start = Instant::now();
        let result = self.authorize_inner(order_id, amount, method, user_id).await;
        metrics::record_payment_operation(
            "authorize",
            outcome(&result),
            start.elapsed().as_secs_f64(),
        );
        result
    }

    async fn authorize_inner(
        &self,
        order_id: &str,
        amount: Money,
        method: PaymentMethod,
        user_id: &str,
    ) -> Result<Payment> {
        validate_authorization(order_id, &amount, &method, user_id)?;

        let _guard = self.order_locks.acquire(order_id).await;

        if let Some(existing) = self.store.find_by_order_id(order_id).await? {
            info!(payment_id = %existing.payment_id, "订单已有授权，直接返回");
            return Ok(existing);
        }

        let mut payment = Payment::pending(order_id, user_id, amount, method);

        match self
            .processor
            .authorize(&payment.amount, &payment.method, order_id)
            .await
        {
            Ok(transaction_id) => {
                payment.mark_authorized(transaction_id);
                self.insert(&payment).await?;
                info!(
                    payment_id = %payment.payment_id,
                    transaction_id = ?payment.transaction_id,
                    "Payment authorized"
                );
                Ok(payment)
            }
            Err(Declined(reason)) => {
                payment.mark_failed(reason.clone());
                self.insert(&payment).await?;
                warn!(payment_id = %payment.payment_id, %reason, "Payment authorization failed");
                Err(PaymentError::AuthorizationDeclined {
                    payment_id: payment.payment_id,
                    reason,
                })
            }
        }
    }

    /// 扣款
    ///
    /// 仅 AUTHORIZED 可扣款。成功后依次发布 payment.succeeded、payment.receipt 并通知订单服务确认，
    /// 失败则转为 FAILED 并发布 payment.failed。事件与通知失败不回滚状态。
    #[instrument(skip(self))]
    pub async fn capture(&self, payment_id: &str) -> Result<Payment> {
        let start = Instant::now();
        let result = self.capture_inner(payment_id).await;
        metrics::record_payment_operation(
            "capture",
            outcome(&result),
            start.elapsed().as_secs_f64(),
        );
        result
    }

    async fn capture_inner(&self, payment_id: &str) -> Result<Payment> {
        require("payment_id", payment_id)?;

        let order_id = self.load(payment_id).await?.order_id;
        let guard = self.order_locks.acquire(&order_id).await;

        // 持锁后重新读取，避免基于过期状态迁移
        let mut payment = self.load(payment_id).await?;
        if payment.status != PaymentStatus::Authorized {
            return Err(PaymentError::InvalidTransition {
                payment_id: payment.payment_id,
                status: payment.status,
                action: "capture",
            });
        }
        let Some(transaction_id) = payment.transaction_id.clone() else {
            return Err(ServiceError::Internal(format!(
                "AUTHORIZED 支付缺少交易号: {payment_id}"
            ))
            .into());
        };

        match self.processor.capture(&transaction_id, &payment.amount).await {
            Ok(()) => {
                payment.mark_captured(Utc::now());
                self.store.update(&payment).await?;
                drop(guard);

                info!(order_id = %payment.order_id, amount = payment.amount.amount, "Payment captured");
                self.after_capture(&payment).await;
                Ok(payment)
            }
            Err(Declined(reason)) => {
                payment.mark_failed(reason.clone());
                self.store.update(&payment).await?;
                drop(guard);

                warn!(order_id = %payment.order_id, %reason, "Payment capture failed");
                self.events.failed(&payment, &reason).await;
                Err(PaymentError::CaptureFailed {
                    payment_id: payment.payment_id,
                    reason,
                })
            }
        }
    }

    pub async fn get_payment(&self, payment_id: &str) -> Result<Payment> {
        require("payment_id", payment_id)?;
        self.load(payment_id).await
    }

    async fn after_capture(&self, payment: &Payment) {
        self.events.succeeded(payment).await;
        self.events.receipt(payment).await;

        if let Err(e) = self
            .orders
            .update_order_status(&payment.order_id, ORDER_CONFIRMED)
            .await
        {
            warn!(order_id = %payment.order_id, error = %e, "订单状态更新失败");
        }
    }

    async fn load(&self, payment_id: &str) -> Result<Payment> {
        self.store
            .get(payment_id)
            .await?
            .ok_or_else(|| PaymentError::PaymentNotFound(payment_id.to_string()))
    }

    async fn insert(&self, payment: &Payment) -> Result<()> {
        if !self.store.put_if_absent(payment).await? {
            return Err(ServiceError::Internal(format!(
                "支付 ID 冲突: {}",
                payment.payment_id
            ))
            .into());
        }
        Ok(())
    }

    /// 当前持有或等待中的订单锁数量
    pub fn active_order_locks(&self) -> usize {
        self.order_locks.len()
    }
}

fn outcome<T>(result: &Result<T>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(PaymentError::AuthorizationDeclined { .. } | PaymentError::CaptureFailed { .. }) => {
            "declined"
        }
        Err(_) => "error",
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ServiceError::invalid_argument(field, format!("{field} is required")).into());
    }
    Ok(())
}

fn validate_authorization(
    order_id: &str,
    amount: &Money,
    method: &PaymentMethod,
    user_id: &str,
) -> Result<()> {
    require("order_id", order_id)?;
    require("user_id", user_id)?;
    if !amount.is_positive() {
        return Err(ServiceError::invalid_argument("amount", "amount must be positive").into());
    }
    if amount.currency.trim().is_empty() {
        return Err(ServiceError::invalid_argument("currency", "currency is required").into());
    }
    if method.token.trim().is_empty() {
        return Err(
            ServiceError::invalid_argument("method", "payment method token is required").into(),
        );
    }
    Ok(())
}
