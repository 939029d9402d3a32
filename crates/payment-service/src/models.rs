//! 支付领域模型
//!
//! 状态流转：`PENDING → AUTHORIZED → CAPTURED`，`PENDING` 与 `AUTHORIZED` 均可进入 `FAILED`。
//! `CAPTURED` 和 `FAILED` 是终态。

use std::fmt;

use bookstore_shared::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 支付状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Authorized,
    Captured,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Authorized => "AUTHORIZED",
            Self::Captured => "CAPTURED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Captured | Self::Failed)
    }

    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Authorized)
                | (Self::Pending, Self::Failed)
                | (Self::Authorized, Self::Captured)
                | (Self::Authorized, Self::Failed)
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 支付方式类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethodType {
    #[default]
    Unspecified,
    CreditCard,
    DebitCard,
    Paypal,
    BankTransfer,
}

impl PaymentMethodType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "UNSPECIFIED",
            Self::CreditCard => "CREDIT_CARD",
            Self::DebitCard => "DEBIT_CARD",
            Self::Paypal => "PAYPAL",
            Self::BankTransfer => "BANK_TRANSFER",
        }
    }
}

impl fmt::Display for PaymentMethodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub method_type: PaymentMethodType,
    pub last4: String,
    pub token: String,
}

/// 支付记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub payment_id: String,
    pub order_id: String,
    pub user_id: String,
    pub amount: Money,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub captured_at: Option<DateTime<Utc>>,
    pub transaction_id: Option<String>,
    pub error_message: Option<String>,
}

impl Payment {
    /// 新建 PENDING 支付，ID 在此生成
    pub fn pending(order_id: &str, user_id: &str, amount: Money, method: PaymentMethod) -> Self {
        Self {
            payment_id: new_payment_id(),
            order_id: order_id.to_string(),
            user_id: user_id.to_string(),
            amount,
            method,
            status: PaymentStatus::Pending,
            created_at: Utc::now(),
            captured_at: None,
            transaction_id: None,
            error_message: None,
        }
    }

    pub fn mark_authorized(&mut self, transaction_id: String) -> bool {
        if !self.status.can_transition_to(PaymentStatus::Authorized) {
            return false;
        }
        self.status = PaymentStatus::Authorized;
        self.transaction_id = Some(transaction_id);
        true
    }

    pub fn mark_captured(&mut self, at: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(PaymentStatus::Captured) {
            return false;
        }
        self.status = PaymentStatus::Captured;
        self.captured_at = Some(at);
        true
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> bool {
        if !self.status.can_transition_to(PaymentStatus::Failed) {
            return false;
        }
        self.status = PaymentStatus::Failed;
        self.error_message = Some(reason.into());
        true
    }
}

/// `PAY-` + 16 位大写十六进制
pub fn new_payment_id() -> String {
    format!("PAY-{}", hex_prefix(16))
}

/// `TXN-` + 12 位大写十六进制
pub fn new_transaction_id() -> String {
    format!("TXN-{}", hex_prefix(12))
}

fn hex_prefix(len: usize) -> String {
    Uuid::new_v4().simple().to_string()[..len].to_uppercase()
}
