//! 对账器
//!
//! 每个周期做两件事：
//! 1. 把所有 Success 结果作为一个批次在单个事务里写入订单和余额
//! 2. 若出现 Throttled 结果，计算 now + retry_after 并登记到限流闸门；
//!    retry_after 超过配置上限时按上限截断
//!
//! 事务失败只记录日志，同一批订单会在下个周期被重新查询。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use loyalty_shared::observability::metrics;
use rust_decimal::prelude::ToPrimitive;
use tracing::{error, info, warn};

use crate::classifier::FetchResult;
use crate::clock::Clock;
use crate::gate::RateGate;
use crate::models::AccrualUpdate;
use crate::repository::{AccrualRepositoryTrait, BatchSummary};

/// 单个周期的对账结果
#[derive(Debug, Default)]
pub struct CycleReport {
    pub succeeded: usize,
    pub unresolved: usize,
    pub throttled: usize,
    pub failed: usize,
    /// 批次写入成功时的统计
    pub applied: Option<BatchSummary>,
    /// 批次写入是否失败
    pub apply_failed: bool,
    /// 本周期登记的闸门时间
    pub throttled_until: Option<DateTime<Utc>>,
}

/// 本周期需要登记的最长退避，以及触发它的订单
struct Throttle {
    order: String,
    delay: Duration,
}

pub struct Reconciler {
    repo: Arc<dyn AccrualRepositoryTrait>,
    gate: RateGate,
    clock: Arc<dyn Clock>,
    max_retry_after: Duration,
}

impl Reconciler {
    pub fn new(
        repo: Arc<dyn AccrualRepositoryTrait>,
        gate: RateGate,
        clock: Arc<dyn Clock>,
        max_retry_after: Duration,
    ) -> Self {
        Self {
            repo,
            gate,
            clock,
            max_retry_after,
        }
    }

    pub async fn reconcile(&self, results: Vec<FetchResult>) -> CycleReport {
        let mut report = CycleReport::default();
        let mut updates: Vec<AccrualUpdate> = Vec::new();
        let mut throttle: Option<Throttle> = None;

        for result in results {
            metrics::record_accrual_fetch(result.label());
            match result {
                FetchResult::Success(outcome) => {
                    report.succeeded += 1;
                    updates.push(outcome.to_update());
                }
                FetchResult::Unresolved { order } => {
                    report.unresolved += 1;
                    warn!(order = %order, http_status = 204, "积分服务没有该订单的记录");
                }
                FetchResult::Throttled {
                    order,
                    retry_after: delay,
                    message,
                } => {
                    report.throttled += 1;
                    metrics::record_rate_limited();
                    info!(
                        order = %order,
                        http_status = 429,
                        retry_after_secs = delay.as_secs(),
                        message = message.as_deref().unwrap_or(""),
                        "积分服务限流"
                    );
                    if throttle.as_ref().is_none_or(|t| delay > t.delay) {
                        throttle = Some(Throttle { order, delay });
                    }
                }
                FetchResult::Failed { order, error } => {
                    report.failed += 1;
                    warn!(
                        order = %order,
                        error = %error,
                        code = error.error_code(),
                        "查询积分结果失败，下个周期重试"
                    );
                }
            }
        }

        if !updates.is_empty() {
            self.apply_batch(&updates, &mut report).await;
        }

        if let Some(throttle) = throttle {
            report.throttled_until = self.register_throttle(throttle).await;
        }

        report
    }

    async fn apply_batch(&self, updates: &[AccrualUpdate], report: &mut CycleReport) {
        match self.repo.apply_accrual_batch(updates).await {
            Ok(summary) => {
                for update in updates {
                    metrics::record_accrual_applied(update.status.as_str(), 1);
                }
                if let Some(points) = summary.credited.to_f64() {
                    metrics::record_points_credited(points);
                }
                info!(
                    batch_size = updates.len(),
                    updated = summary.updated,
                    skipped = summary.skipped,
                    credited = %summary.credited,
                    "积分结果已入库"
                );
                report.applied = Some(summary);
            }
            Err(e) => {
                report.apply_failed = true;
                let orders: Vec<&str> = updates.iter().map(|u| u.order.as_str()).collect();
                error!(
                    batch_size = updates.len(),
                    orders = ?orders,
                    error = %e,
                    "积分结果批量写入失败，整批回滚"
                );
            }
        }
    }

    /// 登记闸门，返回成功写入的闸门时间
    async fn register_throttle(&self, throttle: Throttle) -> Option<DateTime<Utc>> {
        let mut delay = throttle.delay;
        if delay > self.max_retry_after {
            warn!(
                order = %throttle.order,
                retry_after_secs = throttle.delay.as_secs(),
                max_retry_after_secs = self.max_retry_after.as_secs(),
                "Retry-After 超过上限，按上限退避"
            );
            delay = self.max_retry_after;
        }

        let now = self.clock.now();
        let not_before = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or_else(|| {
                warn!(
                    order = %throttle.order,
                    retry_after_secs = delay.as_secs(),
                    %now,
                    "闸门时间溢出，使用最大可表示时间"
                );
                DateTime::<Utc>::MAX_UTC
            });

        self.gate
            .set_not_before(not_before)
            .await
            .then_some(not_before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::AccrualError;
    use crate::models::{AccrualOutcome, AccrualStatus, OrderStatus};
    use crate::repository::traits::MockAccrualRepositoryTrait;
    use rust_decimal::Decimal;

    fn success(order: &str, status: AccrualStatus, accrual: i64) -> FetchResult {
        FetchResult::Success(AccrualOutcome {
            order: order.to_string(),
            status,
            accrual: Decimal::new(accrual, 0),
        })
    }

    fn throttled(order: &str, secs: u64) -> FetchResult {
        FetchResult::Throttled {
            order: order.to_string(),
            retry_after: Duration::from_secs(secs),
            message: None,
        }
    }

    fn reconciler(repo: MockAccrualRepositoryTrait) -> Reconciler {
        reconciler_with_clock(repo, Arc::new(SystemClock))
    }

    fn reconciler_with_clock(
        repo: MockAccrualRepositoryTrait,
        clock: Arc<dyn Clock>,
    ) -> Reconciler {
        let repo: Arc<dyn AccrualRepositoryTrait> = Arc::new(repo);
        let gate = RateGate::new(repo.clone(), "accrual");
        Reconciler::new(repo, gate, clock, Duration::from_secs(MAX_RETRY_SECS))
    }

    const MAX_RETRY_SECS: u64 = 86_400;

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    #[tokio::test]
    async fn test_no_successes_means_no_store_write() {
        let mut repo = MockAccrualRepositoryTrait::new();
        repo.expect_apply_accrual_batch().never();
        repo.expect_set_retry_not_before().never();

        let report = reconciler(repo)
            .reconcile(vec![
                FetchResult::Unresolved {
                    order: "200".to_string(),
                },
                FetchResult::Failed {
                    order: "300".to_string(),
                    error: AccrualError::UnexpectedStatus {
                        order: "300".to_string(),
                        status: 500,
                    },
                },
            ])
            .await;

        assert_eq!(report.unresolved, 1);
        assert_eq!(report.failed, 1);
        assert!(report.applied.is_none());
        assert!(!report.apply_failed);
    }

    #[tokio::test]
    async fn test_successes_applied_as_one_batch() {
        let mut repo = MockAccrualRepositoryTrait::new();
        repo.expect_apply_accrual_batch()
            .times(1)
            .withf(|updates| {
                updates.len() == 2
                    && updates.iter().any(|u| {
                        u.order == "100"
                            && u.status == OrderStatus::Processed
                            && u.accrual == Decimal::new(50, 0)
                    })
                    && updates
                        .iter()
                        .any(|u| u.order == "400" && u.status == OrderStatus::Processing)
            })
            .returning(|_| {
                Ok(BatchSummary {
                    updated: 2,
                    skipped: 0,
                    credited: Decimal::new(50, 0),
                })
            });

        let report = reconciler(repo)
            .reconcile(vec![
                success("100", AccrualStatus::Processed, 50),
                success("400", AccrualStatus::Registered, 0),
            ])
            .await;

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.applied.unwrap().credited, Decimal::new(50, 0));
    }

    #[tokio::test]
    async fn test_apply_failure_is_logged_not_propagated() {
        let mut repo = MockAccrualRepositoryTrait::new();
        repo.expect_apply_accrual_batch()
            .times(1)
            .returning(|_| Err(AccrualError::Database(sqlx::Error::PoolTimedOut)));

        let report = reconciler(repo)
            .reconcile(vec![success("100", AccrualStatus::Processed, 50)])
            .await;

        assert!(report.apply_failed);
        assert!(report.applied.is_none());
    }

    #[tokio::test]
    async fn test_largest_retry_after_wins() {
        let mut repo = MockAccrualRepositoryTrait::new();
        let before = Utc::now();
        repo.expect_set_retry_not_before()
            .times(1)
            .withf(move |name, not_before| {
                name.to_string() == "accrual"
                    && *not_before >= before + chrono::Duration::seconds(120)
                    && *not_before <= Utc::now() + chrono::Duration::seconds(120)
            })
            .returning(|_, _| Ok(()));

        let report = reconciler(repo)
            .reconcile(vec![throttled("300", 60), throttled("500", 120)])
            .await;

        assert_eq!(report.throttled, 2);
        assert!(report.throttled_until.is_some());
    }

    #[tokio::test]
    async fn test_gate_write_failure_does_not_abort_cycle() {
        let mut repo = MockAccrualRepositoryTrait::new();
        repo.expect_apply_accrual_batch()
            .times(1)
            .returning(|_| Ok(BatchSummary::default()));
        repo.expect_set_retry_not_before()
            .times(1)
            .returning(|_, _| Err(AccrualError::Database(sqlx::Error::PoolClosed)));

        let report = reconciler(repo)
            .reconcile(vec![
                success("100", AccrualStatus::Invalid, 0),
                throttled("300", 60),
            ])
            .await;

        assert!(report.applied.is_some());
        assert!(report.throttled_until.is_none());
    }

    #[tokio::test]
    async fn test_huge_retry_after_is_capped_not_dropped() {
        let now = Utc::now();
        let expected = now + chrono::Duration::seconds(MAX_RETRY_SECS as i64);
        let mut repo = MockAccrualRepositoryTrait::new();
        repo.expect_set_retry_not_before()
            .times(1)
            .withf(move |_, not_before| *not_before == expected)
            .returning(|_, _| Ok(()));

        let report = reconciler_with_clock(repo, Arc::new(FixedClock(now)))
            .reconcile(vec![
                throttled("300", 60),
                throttled("500", 100_000_000_000_000),
            ])
            .await;

        assert_eq!(report.throttled, 2);
        assert_eq!(report.throttled_until, Some(expected));
    }

    #[tokio::test]
    async fn test_gate_overflow_falls_back_to_max_time() {
        let now = DateTime::<Utc>::MAX_UTC - chrono::Duration::seconds(1);
        let mut repo = MockAccrualRepositoryTrait::new();
        repo.expect_set_retry_not_before()
            .times(1)
            .withf(|_, not_before| *not_before == DateTime::<Utc>::MAX_UTC)
            .returning(|_, _| Ok(()));

        let report = reconciler_with_clock(repo, Arc::new(FixedClock(now)))
            .reconcile(vec![throttled("300", 60)])
            .await;

        assert_eq!(report.throttled_until, Some(DateTime::<Utc>::MAX_UTC));
    }
}
