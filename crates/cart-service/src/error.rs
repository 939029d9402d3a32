//! 购物车服务错误类型

use bookstore_shared::ServiceError;
use bookstore_shared::money::MoneyError;
use thiserror::Error;

/// 购物车服务错误类型
#[derive(Debug, Error)]
pub enum CartError {
    #[error("商品不存在: {0}")]
    BookNotFound(String),

    #[error("商品已下架: {0}")]
    BookInactive(String),

    #[error("购物车为空: user_id={0}")]
    EmptyCart(String),

    #[error("币种不一致: 购物车为 {cart}, 商品为 {item}")]
    CurrencyMismatch { cart: String, item: String },

    #[error("金额错误: {0}")]
    Money(#[from] MoneyError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

pub type Result<T> = std::result::Result<T, CartError>;

impl From<sqlx::Error> for CartError {
    fn from(err: sqlx::Error) -> Self {
        Self::Service(ServiceError::Database(err))
    }
}

impl From<serde_json::Error> for CartError {
    fn from(err: serde_json::Error) -> Self {
        Self::Service(ServiceError::Serialization(err))
    }
}

impl CartError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BookNotFound(_) => "BOOK_NOT_FOUND",
            Self::BookInactive(_) => "BOOK_INACTIVE",
            Self::EmptyCart(_) => "EMPTY_CART",
            Self::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            Self::Money(_) => "INVALID_AMOUNT",
            Self::Service(e) => e.code(),
        }
    }

    /// 折叠为共享错误分类，供事件处理器和 gRPC 层使用
    pub fn into_service_error(self) -> ServiceError {
        match self {
            Self::BookNotFound(sku) => ServiceError::not_found("Book", sku),
            Self::BookInactive(_) | Self::EmptyCart(_) => {
                ServiceError::FailedPrecondition(self.to_string())
            }
            Self::CurrencyMismatch { .. } | Self::Money(_) => ServiceError::Validation(self.to_string()),
            Self::Service(e) => e,
        }
    }
}

impl From<CartError> for ServiceError {
    fn from(err: CartError) -> Self {
        err.into_service_error()
    }
}

impl From<CartError> for tonic::Status {
    fn from(err: CartError) -> Self {
        err.into_service_error().to_grpc_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn test_status_mapping() {
        let cases = vec![
            (CartError::BookNotFound("BOOK-404".into()), Code::NotFound),
            (CartError::BookInactive("BOOK-1".into()), Code::FailedPrecondition),
            (CartError::EmptyCart("u1".into()), Code::FailedPrecondition),
            (
                CartError::CurrencyMismatch {
                    cart: "USD".into(),
                    item: "EUR".into(),
                },
                Code::InvalidArgument,
            ),
            (
                CartError::Service(ServiceError::unavailable("catalog", "timeout")),
                Code::Unavailable,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(tonic::Status::from(err).code(), expected);
        }
    }

    #[test]
    fn test_error_code() {
        assert_eq!(CartError::EmptyCart("u1".into()).error_code(), "EMPTY_CART");
        assert_eq!(
            CartError::Service(ServiceError::Validation("qty".into())).error_code(),
            "VALIDATION_ERROR"
        );
    }
}
