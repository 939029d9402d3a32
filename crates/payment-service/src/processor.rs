//! 支付处理器
//!
//! `MockProcessor` 模拟外部收单方：金额上限、支付方式校验、网络延迟，
//! 以及“已授权未扣款”交易集合（同一交易只能扣款一次）。

use std::time::Duration;

use async_trait::async_trait;
use bookstore_shared::Money;
use bookstore_shared::money::DEFAULT_CURRENCY;
use bookstore_shared::config::PaymentConfig;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::{PaymentMethod, PaymentMethodType, new_transaction_id};

/// 处理器拒绝，消息原样写入支付记录的 error_message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct Declined(pub String);

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// 成功返回交易号
    async fn authorize(
        &self,
        amount: &Money,
        method: &PaymentMethod,
        order_id: &str,
    ) -> Result<String, Declined>;

    async fn capture(&self, transaction_id: &str, amount: &Money) -> Result<(), Declined>;
}

/// 模拟处理器
pub struct MockProcessor {
    max_amount: i64,
    latency: Duration,
    /// transaction_id → 授权金额（最小单位）
    authorized: DashMap<String, i64>,
}

impl MockProcessor {
    pub fn new(config: &PaymentConfig) -> Self {
        Self {
            max_amount: config.max_amount,
            latency: Duration::from_millis(config.simulated_latency_ms),
            authorized: DashMap::new(),
        }
    }

    /// 已授权、尚未扣款的交易数
    pub fn pending_captures(&self) -> usize {
        self.authorized.len()
    }

    /// 上限按被授权金额的币种与小数位展示，USD 使用 `$` 前缀
    fn limit_message(&self, amount: &Money) -> String {
        let ceiling = Money::new(self.max_amount, amount.currency.clone())
            .with_decimal_places(amount.decimal_places);
        let shown = match ceiling.to_decimal() {
            Ok(value) if ceiling.currency == DEFAULT_CURRENCY => format!("${value}"),
            Ok(_) => ceiling.to_string(),
            Err(_) => format!("{} minor units {}", ceiling.amount, ceiling.currency),
        };
        format!("Amount exceeds limit of {shown}")
    }

    async fn simulate_latency(&self, factor: f64) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency.mul_f64(factor)).await;
        }
    }
}

#[async_trait]
impl PaymentProcessor for MockProcessor {
    async fn authorize(
        &self,
        amount: &Money,
        method: &PaymentMethod,
        order_id: &str,
    ) -> Result<String, Declined> {
        info!(
            amount = amount.amount,
            method_type = %method.method_type,
            order_id,
            "Processing authorization"
        );
        self.simulate_latency(1.0).await;

        if amount.amount >= self.max_amount {
            warn!(amount = amount.amount, max_amount = self.max_amount, "金额超过上限，拒绝授权");
            return Err(Declined(self.limit_message(amount)));
        }

        if method.method_type == PaymentMethodType::Unspecified {
            warn!(order_id, "支付方式无效，拒绝授权");
            return Err(Declined("Invalid payment method".to_string()));
        }

        let transaction_id = new_transaction_id();
        self.authorized
            .insert(transaction_id.clone(), amount.amount);

        info!(%transaction_id, amount = amount.amount, "Authorization approved");
        Ok(transaction_id)
    }

    async fn capture(&self, transaction_id: &str, amount: &Money) -> Result<(), Declined> {
        info!(transaction_id, amount = amount.amount, "Processing capture");
        self.simulate_latency(0.6).await;

        // 金额一致时才移出集合，第二次扣款找不到交易
        let removed = self
            .authorized
            .remove_if(transaction_id, |_, authorized| *authorized == amount.amount);

        match removed {
            Some(_) => {
                info!(transaction_id, "Capture successful");
                Ok(())
            }
            None if self.authorized.contains_key(transaction_id) => {
                warn!(transaction_id, amount = amount.amount, "扣款金额与授权金额不一致");
                Err(Declined(
                    "Capture amount does not match authorized amount".to_string(),
                ))
            }
            None => {
                warn!(transaction_id, "交易不存在或已扣款");
                Err(Declined(
                    "Transaction not found or already captured".to_string(),
                ))
            }
        }
    }
}
