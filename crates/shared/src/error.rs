//! 统一错误处理模块
//!
//! 按处理策略对错误分类：输入校验和状态冲突直接返回调用方，
//! 依赖不可用单独成类以便 RPC 层映射为可重试状态码，
//! 消息传输类错误在本地重试预算内吸收，无法解析的消息直接进入死信。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum ServiceError {
    // ==================== 输入校验 ====================
    #[error("参数验证失败: {0}")]
    Validation(String),

    #[error("无效的参数: {field} - {message}")]
    InvalidArgument { field: String, message: String },

    // ==================== 资源与状态 ====================
    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: String, id: String },

    #[error("前置条件不满足: {0}")]
    FailedPrecondition(String),

    #[error("状态不允许此操作: {entity} id={id} 当前状态={state} 操作={action}")]
    InvalidState {
        entity: String,
        id: String,
        state: String,
        action: String,
    },

    // ==================== 外部依赖 ====================
    #[error("依赖服务不可用: {service} - {message}")]
    DependencyUnavailable { service: String, message: String },

    #[error("依赖服务超时: {service}")]
    DependencyTimeout { service: String },

    // ==================== 消息投递 ====================
    #[error("消息传输错误: {0}")]
    Transport(String),

    #[error("消息被 broker 拒绝: {0}")]
    PublishRejected(String),

    #[error("无法解析的消息: {0}")]
    PoisonMessage(String),

    // ==================== 存储 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis 错误: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, ServiceError>;

impl ServiceError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn invalid_argument(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn unavailable(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DependencyUnavailable {
            service: service.into(),
            message: message.into(),
        }
    }

    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::FailedPrecondition(_) => "FAILED_PRECONDITION",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::DependencyUnavailable { .. } => "DEPENDENCY_UNAVAILABLE",
            Self::DependencyTimeout { .. } => "DEPENDENCY_TIMEOUT",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::PublishRejected(_) => "PUBLISH_REJECTED",
            Self::PoisonMessage(_) => "POISON_MESSAGE",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Redis(_) => "REDIS_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误（由调用方决定是否真的重试）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::DependencyUnavailable { .. }
                | Self::DependencyTimeout { .. }
                | Self::Database(_)
                | Self::Redis(_)
        )
    }

    /// 是否为连接/通道级别的投递失败
    ///
    /// 发布器只在这类错误上重试；broker 的应用层拒绝不重试。
    pub fn is_transient_delivery(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// 转换为 gRPC 状态码
    pub fn to_grpc_status(&self) -> tonic::Status {
        use tonic::{Code, Status};

        let code = match self {
            Self::Validation(_) | Self::InvalidArgument { .. } => Code::InvalidArgument,
            Self::NotFound { .. } => Code::NotFound,
            Self::FailedPrecondition(_) | Self::InvalidState { .. } => Code::FailedPrecondition,
            Self::DependencyUnavailable { .. } => Code::Unavailable,
            Self::DependencyTimeout { .. } => Code::DeadlineExceeded,
            _ => Code::Internal,
        };

        Status::new(code, self.to_string())
    }
}

impl From<ServiceError> for tonic::Status {
    fn from(err: ServiceError) -> Self {
        err.to_grpc_status()
    }
}
