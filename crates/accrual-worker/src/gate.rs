//! 限流闸门
//!
//! 持久化"某服务在此时间之前不得轮询"的时间戳，每个轮询周期开始前查询。
//! 读取失败按无限制处理（fail-open），写入失败只记日志：
//! 错过一次限流窗口可以恢复，下一次 429 会重新建立闸门。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::repository::AccrualRepositoryTrait;

#[derive(Clone)]
pub struct RateGate {
    repo: Arc<dyn AccrualRepositoryTrait>,
    service_name: String,
}

impl RateGate {
    pub fn new(repo: Arc<dyn AccrualRepositoryTrait>, service_name: impl Into<String>) -> Self {
        Self {
            repo,
            service_name: service_name.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// 当前闸门时间，None 表示可以立即轮询
    pub async fn not_before(&self) -> Option<DateTime<Utc>> {
        match self.repo.get_retry_not_before(&self.service_name).await {
            Ok(not_before) => not_before,
            Err(e) => {
                warn!(
                    service = %self.service_name,
                    error = %e,
                    "读取限流闸门失败，按无限制处理"
                );
                None
            }
        }
    }

    /// 登记新的闸门时间，失败时不中断当前周期
    pub async fn set_not_before(&self, not_before: DateTime<Utc>) -> bool {
        match self
            .repo
            .set_retry_not_before(&self.service_name, not_before)
            .await
        {
            Ok(()) => {
                info!(service = %self.service_name, %not_before, "已设置限流闸门");
                true
            }
            Err(e) => {
                warn!(
                    service = %self.service_name,
                    %not_before,
                    error = %e,
                    "写入限流闸门失败"
                );
                false
            }
        }
    }
}
