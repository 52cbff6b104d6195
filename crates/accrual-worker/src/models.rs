//! 订单、余额与积分计算结果模型
//!
//! 所有枚举都支持数据库（sqlx）和 JSON（serde）序列化

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::{AccrualError, Result};

/// 积分金额的小数位数，与数据库 NUMERIC(18, 2) 一致
pub const POINTS_SCALE: u32 = 2;

/// 按数据库的舍入规则（四舍五入）把积分规整到 POINTS_SCALE 位
pub fn round_points(points: Decimal) -> Decimal {
    points.round_dp_with_strategy(POINTS_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// 校验提现金额：必须为正，且不超过 POINTS_SCALE 位小数
pub fn validate_points_amount(sum: Decimal) -> Result<Decimal> {
    if sum <= Decimal::ZERO {
        return Err(AccrualError::InvalidAmount(format!("金额必须大于 0: {sum}")));
    }
    if sum.normalize().scale() > POINTS_SCALE {
        return Err(AccrualError::InvalidAmount(format!(
            "金额最多 {POINTS_SCALE} 位小数: {sum}"
        )));
    }
    Ok(sum)
}

/// 订单处理状态
///
/// 只允许向前流转：NEW → PROCESSING → {INVALID | PROCESSED}
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// 已上传，尚未被积分服务受理
    #[default]
    New,
    /// 积分服务计算中
    Processing,
    /// 积分服务拒绝，不会产生积分
    Invalid,
    /// 计算完成，积分已入账
    Processed,
}

impl OrderStatus {
    /// 终态不再发生任何变化
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Invalid | Self::Processed)
    }

    /// 状态在流转链上的位置
    fn rank(self) -> u8 {
        match self {
            Self::New => 0,
            Self::Processing => 1,
            Self::Invalid | Self::Processed => 2,
        }
    }

    /// 是否允许从 self 流转到 next
    ///
    /// 终态之间不能互相转换，非终态允许原地停留
    pub fn can_advance_to(self, next: OrderStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Processing => "PROCESSING",
            Self::Invalid => "INVALID",
            Self::Processed => "PROCESSED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 积分服务返回的订单状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccrualStatus {
    Registered,
    Invalid,
    Processing,
    Processed,
}

impl AccrualStatus {
    /// 映射为本地订单状态
    ///
    /// REGISTERED 表示积分服务已受理，本地视为 PROCESSING
    pub fn order_status(self) -> OrderStatus {
        match self {
            Self::Registered | Self::Processing => OrderStatus::Processing,
            Self::Invalid => OrderStatus::Invalid,
            Self::Processed => OrderStatus::Processed,
        }
    }
}

/// 单个订单的积分计算结果，仅在一个对账周期内存在
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccrualOutcome {
    pub order: String,
    pub status: AccrualStatus,
    /// 仅在 PROCESSED 时有意义
    pub accrual: Decimal,
}

impl AccrualOutcome {
    /// 转换为写库用的更新记录
    pub fn to_update(&self) -> AccrualUpdate {
        let status = self.status.order_status();
        let accrual = if status == OrderStatus::Processed {
            self.accrual
        } else {
            Decimal::ZERO
        };
        AccrualUpdate {
            order: self.order.clone(),
            status,
            accrual,
        }
    }
}

/// 批量写库的单条记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccrualUpdate {
    pub order: String,
    pub status: OrderStatus,
    pub accrual: Decimal,
}

/// 用户上传的订单
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    pub number: String,
    pub user_id: String,
    pub status: OrderStatus,
    pub accrual: Decimal,
    pub uploaded_at: DateTime<Utc>,
}

/// 用户积分余额
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub user_id: String,
    pub current: Decimal,
    pub withdrawn: Decimal,
}

impl Balance {
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            ..Default::default()
        }
    }
}

/// 积分提现记录，order 是用户为本次提现提交的新订单号
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Withdrawal {
    #[sqlx(rename = "number")]
    pub order: String,
    pub user_id: String,
    pub sum: Decimal,
    pub processed_at: DateTime<Utc>,
}

/// 订单上传结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// 新订单，等待轮询
    Registered,
    /// 同一用户重复上传
    AlreadyRegistered,
}

/// 经 Luhn 校验的订单号
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderNumber(String);

impl OrderNumber {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if luhn_valid(trimmed) {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(AccrualError::InvalidOrderNumber(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Luhn 校验：只接受非空的十进制数字串
pub fn luhn_valid(number: &str) -> bool {
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }

    let sum: u32 = number
        .bytes()
        .rev()
        .enumerate()
        .map(|(i, b)| {
            let digit = u32::from(b - b'0');
            if i % 2 == 1 {
                let doubled = digit * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                digit
            }
        })
        .sum();

    sum % 10 == 0
}
