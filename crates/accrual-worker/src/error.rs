//! 积分对账服务错误类型
//!
//! 对账循环内的任何错误都只作为可观测事件记录，不会终止后台循环；
//! 只有配置错误会在启动阶段向上传播。

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccrualError {
    #[error("积分服务请求失败: order={order}, 原因={reason}")]
    Transport { order: String, reason: String },

    #[error("积分服务返回非预期状态: order={order}, http_status={status}")]
    UnexpectedStatus { order: String, status: u16 },

    #[error("积分服务响应解析失败: order={order}, 原因={reason}")]
    Decode { order: String, reason: String },

    #[error("订单不存在: {0}")]
    OrderNotFound(String),

    #[error("无效的订单号: {0}")]
    InvalidOrderNumber(String),

    #[error("订单已被其他用户上传: {0}")]
    OrderOwnedByAnotherUser(String),

    #[error("订单号已被使用: {0}")]
    OrderAlreadyUsed(String),

    #[error("无效的积分金额: {0}")]
    InvalidAmount(String),

    #[error("积分余额不足: user={user_id}, 请求={requested}, 可用={available}")]
    InsufficientFunds {
        user_id: String,
        requested: Decimal,
        available: Decimal,
    },

    #[error("注入的存储故障: order={0}")]
    InjectedFailure(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Shared(#[from] loyalty_shared::error::LoyaltyError),
}

pub type Result<T> = std::result::Result<T, AccrualError>;

impl AccrualError {
    /// 下一个对账周期是否有机会自愈
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. }
            | Self::UnexpectedStatus { .. }
            | Self::Decode { .. }
            | Self::Database(_)
            | Self::InjectedFailure(_) => true,
            Self::Shared(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "ACCRUAL_TRANSPORT_ERROR",
            Self::UnexpectedStatus { .. } => "ACCRUAL_UNEXPECTED_STATUS",
            Self::Decode { .. } => "ACCRUAL_DECODE_ERROR",
            Self::OrderNotFound(_) => "ORDER_NOT_FOUND",
            Self::InvalidOrderNumber(_) => "INVALID_ORDER_NUMBER",
            Self::OrderOwnedByAnotherUser(_) => "ORDER_OWNED_BY_ANOTHER_USER",
            Self::OrderAlreadyUsed(_) => "ORDER_ALREADY_USED",
            Self::InvalidAmount(_) => "INVALID_AMOUNT",
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Self::InjectedFailure(_) => "INJECTED_FAILURE",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Shared(e) => e.code(),
        }
    }
}
