//! 仓储 Trait 定义
//!
//! 对账核心只依赖这里的抽象，PostgreSQL 与内存实现可互换，支持 mock 测试

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::Result;
use crate::models::{AccrualUpdate, Balance, Order, Registration, Withdrawal};

/// 一次批量写入的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// 实际发生状态变更的订单数
    pub updated: usize,
    /// 已处于终态而被跳过的订单数
    pub skipped: usize,
    /// 本批次入账的积分总额
    pub credited: Decimal,
}

/// 对账仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccrualRepositoryTrait: Send + Sync {
    /// 状态为 NEW 或 PROCESSING 的订单号，按上传时间升序
    async fn list_pending_orders(&self) -> Result<Vec<String>>;

    /// 在单个事务中写入整批结果
    ///
    /// 任一订单失败则整批回滚；只有从非终态进入 PROCESSED 时才给订单所有者入账
    async fn apply_accrual_batch(&self, updates: &[AccrualUpdate]) -> Result<BatchSummary>;

    // 限流闸门
    async fn get_retry_not_before(&self, service_name: &str) -> Result<Option<DateTime<Utc>>>;
    async fn set_retry_not_before(
        &self,
        service_name: &str,
        not_before: DateTime<Utc>,
    ) -> Result<()>;
}

/// 订单、余额与提现仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderRepositoryTrait: Send + Sync {
    /// 上传订单，订单号必须通过 Luhn 校验
    async fn register_order(&self, user_id: &str, number: &str) -> Result<Registration>;
    async fn get_order(&self, number: &str) -> Result<Option<Order>>;
    /// 用户上传的全部订单，按上传时间倒序
    async fn list_orders(&self, user_id: &str) -> Result<Vec<Order>>;
    /// 用户没有余额记录时返回零余额
    async fn get_balance(&self, user_id: &str) -> Result<Balance>;

    /// 以一个新的订单号提现积分
    ///
    /// 订单号需通过 Luhn 校验，且未被上传或提现使用过；
    /// 余额不足时返回 InsufficientFunds，余额与提现记录都不变
    async fn withdraw(&self, user_id: &str, order: &str, sum: Decimal) -> Result<Withdrawal>;
    /// 用户的提现记录，按处理时间倒序
    async fn list_withdrawals(&self, user_id: &str) -> Result<Vec<Withdrawal>>;
}
