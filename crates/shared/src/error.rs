//! 统一错误处理模块
//!
//! 定义基础设施层共享的错误类型，使用 thiserror 提供良好的错误信息。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum LoyaltyError {
    // ==================== 数据库错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    // ==================== 配置错误 ====================
    #[error("配置错误: {0}")]
    Config(#[from] config::ConfigError),

    #[error("无效的配置项: {field} - {message}")]
    InvalidConfig { field: String, message: String },

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, LoyaltyError>;

impl LoyaltyError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 配置错误在启动阶段即为致命错误，重试没有意义
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = LoyaltyError::Internal("数据库迁移失败".to_string());
        assert_eq!(err.code(), "INTERNAL_ERROR");

        let err = LoyaltyError::InvalidConfig {
            field: "accrual.base_url".to_string(),
            message: "不能为空".to_string(),
        };
        assert_eq!(err.code(), "INVALID_CONFIG");
    }

    #[test]
    fn test_is_retryable() {
        let db_err = LoyaltyError::Database(sqlx::Error::PoolTimedOut);
        assert!(db_err.is_retryable());

        let config_err = LoyaltyError::InvalidConfig {
            field: "accrual.workers".to_string(),
            message: "必须大于 0".to_string(),
        };
        assert!(!config_err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = LoyaltyError::InvalidConfig {
            field: "accrual.workers".to_string(),
            message: "必须大于 0".to_string(),
        };
        assert_eq!(err.to_string(), "无效的配置项: accrual.workers - 必须大于 0");
    }
}
