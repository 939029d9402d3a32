//! 金额类型
//!
//! 金额一律以整数最小货币单位（如美分）存储和运算，
//! 只在系统边界（线协议、持久化、展示）与十进制数互相转换。

use std::fmt;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ServiceError;

pub const DEFAULT_DECIMAL_PLACES: u32 = 2;
pub const DEFAULT_CURRENCY: &str = "USD";

/// 十进制转换允许的最大小数位数
const MAX_DECIMAL_PLACES: u32 = 18;

fn default_decimal_places() -> u32 {
    DEFAULT_DECIMAL_PLACES
}

/// 解析线上的小数位：未设置或为负时取默认值，显式 0 保留
pub fn decimal_places_from_wire(value: Option<i32>) -> u32 {
    value
        .and_then(|places| u32::try_from(places).ok())
        .unwrap_or(DEFAULT_DECIMAL_PLACES)
}

/// 金额运算错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoneyError {
    #[error("币种不一致: {left} 与 {right}")]
    CurrencyMismatch { left: String, right: String },

    #[error("金额溢出")]
    Overflow,

    #[error("金额 {value} 无法精确表示为 {decimal_places} 位小数")]
    PrecisionLoss { value: String, decimal_places: u32 },

    #[error("不支持的小数位数: {0}")]
    UnsupportedScale(u32),
}

impl From<MoneyError> for ServiceError {
    fn from(err: MoneyError) -> Self {
        ServiceError::Validation(err.to_string())
    }
}

/// 定点金额
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    /// 最小货币单位数量
    pub amount: i64,
    pub currency: String,
    #[serde(default = "default_decimal_places")]
    pub decimal_places: u32,
}

impl Money {
    pub fn new(amount: i64, currency: impl Into<String>) -> Self {
        Self {
            amount,
            currency: currency.into(),
            decimal_places: DEFAULT_DECIMAL_PLACES,
        }
    }

    pub fn with_decimal_places(mut self, decimal_places: u32) -> Self {
        self.decimal_places = decimal_places;
        self
    }

    pub fn zero(currency: impl Into<String>) -> Self {
        Self::new(0, currency)
    }

    pub fn is_positive(&self) -> bool {
        self.amount > 0
    }

    pub fn is_zero(&self) -> bool {
        self.amount == 0
    }

    /// 币种与精度都一致才允许直接运算
    pub fn same_unit(&self, other: &Money) -> bool {
        self.currency == other.currency && self.decimal_places == other.decimal_places
    }

    fn ensure_same_unit(&self, other: &Money) -> Result<(), MoneyError> {
        if self.same_unit(other) {
            Ok(())
        } else {
            Err(MoneyError::CurrencyMismatch {
                left: self.unit_label(),
                right: other.unit_label(),
            })
        }
    }

    fn unit_label(&self) -> String {
        format!("{}/{}", self.currency, self.decimal_places)
    }

    pub fn checked_add(&self, other: &Money) -> Result<Money, MoneyError> {
        self.ensure_same_unit(other)?;
        let amount = self
            .amount
            .checked_add(other.amount)
            .ok_or(MoneyError::Overflow)?;
        Ok(Money {
            amount,
            ..self.clone()
        })
    }

    pub fn checked_sub(&self, other: &Money) -> Result<Money, MoneyError> {
        self.ensure_same_unit(other)?;
        let amount = self
            .amount
            .checked_sub(other.amount)
            .ok_or(MoneyError::Overflow)?;
        Ok(Money {
            amount,
            ..self.clone()
        })
    }

    /// 单价乘数量
    pub fn checked_mul(&self, quantity: i64) -> Result<Money, MoneyError> {
        let amount = self
            .amount
            .checked_mul(quantity)
            .ok_or(MoneyError::Overflow)?;
        Ok(Money {
            amount,
            ..self.clone()
        })
    }

    /// 在同一计价单位下求和，空集合得到零
    pub fn sum<'a>(
        zero: Money,
        items: impl IntoIterator<Item = &'a Money>,
    ) -> Result<Money, MoneyError> {
        items
            .into_iter()
            .try_fold(zero, |acc, item| acc.checked_add(item))
    }

    /// 转换为十进制展示值（如 1999 -> 19.99）
    pub fn to_decimal(&self) -> Result<Decimal, MoneyError> {
        if self.decimal_places > MAX_DECIMAL_PLACES {
            return Err(MoneyError::UnsupportedScale(self.decimal_places));
        }
        Decimal::try_new(self.amount, self.decimal_places)
            .map_err(|_| MoneyError::UnsupportedScale(self.decimal_places))
    }

    /// 从十进制值构造
    ///
    /// 小数位超过 `decimal_places` 时拒绝而不是舍入。
    pub fn from_decimal(
        value: Decimal,
        currency: impl Into<String>,
        decimal_places: u32,
    ) -> Result<Money, MoneyError> {
        if decimal_places > MAX_DECIMAL_PLACES {
            return Err(MoneyError::UnsupportedScale(decimal_places));
        }

        let factor = 10i64
            .checked_pow(decimal_places)
            .ok_or(MoneyError::Overflow)?;
        let scaled = value
            .checked_mul(Decimal::from(factor))
            .ok_or(MoneyError::Overflow)?;

        if !scaled.fract().is_zero() {
            return Err(MoneyError::PrecisionLoss {
                value: value.to_string(),
                decimal_places,
            });
        }

        let amount = scaled.trunc().to_i64().ok_or(MoneyError::Overflow)?;

        Ok(Money {
            amount,
            currency: currency.into(),
            decimal_places,
        })
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_decimal() {
            Ok(value) => write!(f, "{} {}", value, self.currency),
            Err(_) => write!(f, "{} minor units {}", self.amount, self.currency),
        }
    }
}
