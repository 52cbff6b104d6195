//! 积分轮询循环
//!
//! 进程生命周期内唯一的后台循环：
//! 检查关闭信号 → 查询限流闸门 → 拉取待处理订单 → 并发查询 → 分类 → 对账 → 等待。
//! 周期之间严格串行；周期内的任何错误都不会终止循环，只有关闭信号可以。
//! 所有等待都可被关闭信号打断。

use std::sync::Arc;
use std::time::{Duration, Instant};

use loyalty_shared::config::AccrualConfig;
use loyalty_shared::observability::metrics;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::client::AccrualClient;
use crate::clock::Clock;
use crate::dispatcher::Dispatcher;
use crate::gate::RateGate;
use crate::reconciler::{CycleReport, Reconciler};
use crate::repository::AccrualRepositoryTrait;

/// 轮询循环参数
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub service_name: String,
    pub workers: usize,
    pub idle_interval: Duration,
    pub active_interval: Duration,
    pub default_retry_after: Duration,
    pub max_retry_after: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self::from(&AccrualConfig::default())
    }
}

impl From<&AccrualConfig> for PollerConfig {
    fn from(config: &AccrualConfig) -> Self {
        Self {
            service_name: config.service_name.clone(),
            workers: config.workers,
            idle_interval: config.idle_interval(),
            active_interval: config.active_interval(),
            default_retry_after: config.default_retry_after(),
            max_retry_after: config.max_retry_after(),
        }
    }
}

/// 单次周期的结果
#[derive(Debug)]
pub enum CycleOutcome {
    /// 没有待处理订单，未调用分发器
    Idle,
    /// 读取待处理订单失败
    StoreUnavailable,
    /// 完成了一次查询与对账
    Reconciled(CycleReport),
    /// 等待或分发期间收到关闭信号
    Cancelled,
}

pub struct AccrualPoller {
    config: PollerConfig,
    repo: Arc<dyn AccrualRepositoryTrait>,
    gate: RateGate,
    dispatcher: Dispatcher,
    reconciler: Reconciler,
    clock: Arc<dyn Clock>,
}

impl AccrualPoller {
    pub fn new(
        config: PollerConfig,
        repo: Arc<dyn AccrualRepositoryTrait>,
        client: Arc<dyn AccrualClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let gate = RateGate::new(repo.clone(), config.service_name.clone());
        let dispatcher = Dispatcher::new(client, config.workers, config.default_retry_after);
        let reconciler = Reconciler::new(
            repo.clone(),
            gate.clone(),
            clock.clone(),
            config.max_retry_after,
        );
        Self {
            config,
            repo,
            gate,
            dispatcher,
            reconciler,
            clock,
        }
    }

    /// 主循环：持续轮询直到收到关闭信号
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            service = %self.config.service_name,
            workers = self.dispatcher.workers(),
            idle_interval = ?self.config.idle_interval,
            active_interval = ?self.config.active_interval,
            "积分轮询循环已启动"
        );

        loop {
            if is_shutdown(&shutdown) {
                break;
            }

            let wait = match self.run_cycle(&mut shutdown).await {
                CycleOutcome::Cancelled => break,
                CycleOutcome::Reconciled(_) => self.config.active_interval,
                CycleOutcome::Idle | CycleOutcome::StoreUnavailable => self.config.idle_interval,
            };

            metrics::set_worker_last_run("accrual_poller");

            if sleep_or_shutdown(wait, &mut shutdown).await {
                break;
            }
        }

        info!("积分轮询循环已停止");
    }

    /// 执行一个完整周期（不含周期末尾的等待）
    pub async fn run_cycle(&self, shutdown: &mut watch::Receiver<bool>) -> CycleOutcome {
        if self.wait_for_gate(shutdown).await {
            return CycleOutcome::Cancelled;
        }

        let pending = match self.repo.list_pending_orders().await {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "读取待处理订单失败");
                return CycleOutcome::StoreUnavailable;
            }
        };

        if pending.is_empty() {
            debug!("没有待处理订单");
            return CycleOutcome::Idle;
        }

        let started = Instant::now();
        let total = pending.len();
        debug!(batch_size = total, "开始查询积分结果");

        let results = tokio::select! {
            biased;

            _ = wait_for_shutdown(shutdown) => {
                info!("分发期间收到关闭信号，放弃本周期");
                return CycleOutcome::Cancelled;
            }
            results = self.dispatcher.dispatch(pending) => results,
        };

        let report = self.reconciler.reconcile(results).await;
        metrics::record_accrual_cycle(total, started.elapsed().as_secs_f64());

        info!(
            batch_size = total,
            succeeded = report.succeeded,
            unresolved = report.unresolved,
            throttled = report.throttled,
            failed = report.failed,
            apply_failed = report.apply_failed,
            "对账周期完成"
        );

        CycleOutcome::Reconciled(report)
    }

    /// 闸门时间在未来时等待到该时刻，返回 true 表示期间收到关闭信号
    async fn wait_for_gate(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let Some(not_before) = self.gate.not_before().await else {
            return false;
        };

        let now = self.clock.now();
        if not_before <= now {
            return false;
        }

        let wait = (not_before - now).to_std().unwrap_or_default();
        info!(%not_before, wait_secs = wait.as_secs(), "限流闸门生效，暂停轮询");
        sleep_or_shutdown(wait, shutdown).await
    }
}

fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// 等待关闭信号；发送端被 drop 也视为关闭
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// 可被关闭信号打断的 sleep，返回 true 表示收到关闭信号
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;

        _ = wait_for_shutdown(shutdown) => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockAccrualClient;
    use crate::clock::SystemClock;
    use crate::repository::traits::MockAccrualRepositoryTrait;

    #[tokio::test]
    async fn test_empty_pending_list_is_idle() {
        let mut repo = MockAccrualRepositoryTrait::new();
        repo.expect_get_retry_not_before().returning(|_| Ok(None));
        repo.expect_list_pending_orders().times(1).returning(|| Ok(Vec::new()));
        repo.expect_apply_accrual_batch().never();
        repo.expect_set_retry_not_before().never();

        let mut client = MockAccrualClient::new();
        client.expect_fetch().never();

        let poller = AccrualPoller::new(
            PollerConfig::default(),
            Arc::new(repo),
            Arc::new(client),
            Arc::new(SystemClock),
        );
        let (_tx, mut rx) = watch::channel(false);

        assert!(matches!(poller.run_cycle(&mut rx).await, CycleOutcome::Idle));
    }

    #[tokio::test]
    async fn test_store_error_does_not_stop_cycle() {
        let mut repo = MockAccrualRepositoryTrait::new();
        repo.expect_get_retry_not_before().returning(|_| Ok(None));
        repo.expect_list_pending_orders()
            .returning(|| Err(crate::error::AccrualError::Database(sqlx::Error::PoolTimedOut)));

        let poller = AccrualPoller::new(
            PollerConfig::default(),
            Arc::new(repo),
            Arc::new(MockAccrualClient::new()),
            Arc::new(SystemClock),
        );
        let (_tx, mut rx) = watch::channel(false);

        assert!(matches!(
            poller.run_cycle(&mut rx).await,
            CycleOutcome::StoreUnavailable
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted_by_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let sleeper = tokio::spawn(async move {
            sleep_or_shutdown(Duration::from_secs(3600), &mut rx).await
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        tx.send(true).unwrap();

        assert!(sleeper.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sender_counts_as_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        assert!(sleep_or_shutdown(Duration::from_secs(3600), &mut rx).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_without_shutdown() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(!sleep_or_shutdown(Duration::from_millis(100), &mut rx).await);
    }

    #[test]
    fn test_poller_config_from_accrual_config() {
        let config = PollerConfig::from(&AccrualConfig {
            workers: 4,
            idle_interval_ms: 250,
            ..AccrualConfig::default()
        });
        assert_eq!(config.workers, 4);
        assert_eq!(config.idle_interval, Duration::from_millis(250));
        assert_eq!(config.active_interval, Duration::from_millis(100));
        assert_eq!(config.service_name, "accrual");
        assert_eq!(config.max_retry_after, Duration::from_secs(86_400));
    }
}
