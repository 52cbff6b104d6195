//! 响应分类器
//!
//! 把每次查询的原始结果归入唯一的一类结果。
//! 纯函数：不访问仓储，也不触碰限流闸门。

use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::client::AccrualResponse;
use crate::error::AccrualError;
use crate::models::{AccrualOutcome, AccrualStatus, round_points};

/// 单个订单一次查询的分类结果
#[derive(Debug)]
pub enum FetchResult {
    /// 200 且响应体可解析
    Success(AccrualOutcome),
    /// 204，积分服务没有该订单的记录，本周期不处理
    Unresolved { order: String },
    /// 429，需要在 retry_after 之后才能再次轮询
    Throttled {
        order: String,
        retry_after: Duration,
        message: Option<String>,
    },
    /// 传输失败、解析失败或其他状态码
    Failed { order: String, error: AccrualError },
}

impl FetchResult {
    pub fn order(&self) -> &str {
        match self {
            Self::Success(outcome) => &outcome.order,
            Self::Unresolved { order }
            | Self::Throttled { order, .. }
            | Self::Failed { order, .. } => order,
        }
    }

    /// 指标标签
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Unresolved { .. } => "unresolved",
            Self::Throttled { .. } => "throttled",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Deserialize)]
struct AccrualBody {
    order: String,
    status: AccrualStatus,
    #[serde(default)]
    accrual: Option<Decimal>,
}

/// 分类一次查询的结果
///
/// `default_retry_after` 用于 429 响应缺少或无法解析 Retry-After 的情况
pub fn classify(
    order: &str,
    response: Result<AccrualResponse, AccrualError>,
    default_retry_after: Duration,
) -> FetchResult {
    let response = match response {
        Ok(response) => response,
        Err(error) => {
            return FetchResult::Failed {
                order: order.to_string(),
                error,
            };
        }
    };

    match response.status {
        200 => match decode_body(order, &response.body) {
            Ok(outcome) => FetchResult::Success(outcome),
            Err(error) => FetchResult::Failed {
                order: order.to_string(),
                error,
            },
        },
        204 => FetchResult::Unresolved {
            order: order.to_string(),
        },
        429 => FetchResult::Throttled {
            order: order.to_string(),
            retry_after: response
                .retry_after
                .as_deref()
                .and_then(parse_retry_after)
                .unwrap_or(default_retry_after),
            message: Some(response.body.trim())
                .filter(|m| !m.is_empty())
                .map(str::to_string),
        },
        status => FetchResult::Failed {
            order: order.to_string(),
            error: AccrualError::UnexpectedStatus {
                order: order.to_string(),
                status,
            },
        },
    }
}

/// Retry-After 只支持整数秒
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn decode_body(order: &str, body: &str) -> Result<AccrualOutcome, AccrualError> {
    let decode_err = |reason: String| AccrualError::Decode {
        order: order.to_string(),
        reason,
    };

    let parsed: AccrualBody = serde_json::from_str(body).map_err(|e| decode_err(e.to_string()))?;

    if parsed.order != order {
        return Err(decode_err(format!("响应中的订单号不匹配: {}", parsed.order)));
    }

    let accrual = parsed.accrual.unwrap_or(Decimal::ZERO);
    if accrual.is_sign_negative() && !accrual.is_zero() {
        return Err(decode_err(format!("积分不能为负: {accrual}")));
    }

    Ok(AccrualOutcome {
        order: parsed.order,
        status: parsed.status,
        accrual: round_points(accrual),
    })
}
