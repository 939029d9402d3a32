//! 支付服务错误类型

use bookstore_shared::ServiceError;
use thiserror::Error;

use crate::models::PaymentStatus;

/// 支付服务错误类型
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("支付不存在: {0}")]
    PaymentNotFound(String),

    #[error("Authorization failed: {reason}")]
    AuthorizationDeclined { payment_id: String, reason: String },

    #[error("Capture failed: {reason}")]
    CaptureFailed { payment_id: String, reason: String },

    #[error("Cannot {action} payment {payment_id} in status {status}")]
    InvalidTransition {
        payment_id: String,
        status: PaymentStatus,
        action: &'static str,
    },

    #[error(transparent)]
    Service(#[from] ServiceError),
}

pub type Result<T> = std::result::Result<T, PaymentError>;

impl PaymentError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::PaymentNotFound(_) => "PAYMENT_NOT_FOUND",
            Self::AuthorizationDeclined { .. } => "AUTHORIZATION_DECLINED",
            Self::CaptureFailed { .. } => "CAPTURE_FAILED",
            Self::InvalidTransition { .. } => "INVALID_STATE",
            Self::Service(e) => e.code(),
        }
    }

    /// 失败记录的支付 ID（授权被拒或扣款失败时存在）
    pub fn payment_id(&self) -> Option<&str> {
        match self {
            Self::AuthorizationDeclined { payment_id, .. }
            | Self::CaptureFailed { payment_id, .. } => Some(payment_id),
            _ => None,
        }
    }

    pub fn into_service_error(self) -> ServiceError {
        match self {
            Self::PaymentNotFound(id) => ServiceError::not_found("Payment", id),
            Self::AuthorizationDeclined { .. } | Self::CaptureFailed { .. } => {
                ServiceError::FailedPrecondition(self.to_string())
            }
            Self::InvalidTransition {
                payment_id,
                status,
                action,
            } => ServiceError::InvalidState {
                entity: "Payment".to_string(),
                id: payment_id,
                state: status.to_string(),
                action: action.to_string(),
            },
            Self::Service(e) => e,
        }
    }
}

impl From<PaymentError> for ServiceError {
    fn from(err: PaymentError) -> Self {
        err.into_service_error()
    }
}

impl From<PaymentError> for tonic::Status {
    fn from(err: PaymentError) -> Self {
        err.into_service_error().to_grpc_status()
    }
}
