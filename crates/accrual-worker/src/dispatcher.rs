//! 查询分发器
//!
//! 固定数量的请求者从共享队列领取订单号，各自调用积分服务并把分类结果送入结果通道。
//! 结果通道容量等于批次大小，收满即返回；每个提交的订单号恰好产生一个结果。
//! 单个请求失败只会变成一条 Failed 结果，不会阻塞其他请求。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::classifier::{FetchResult, classify};
use crate::client::AccrualClient;
use crate::error::AccrualError;

pub struct Dispatcher {
    client: Arc<dyn AccrualClient>,
    workers: usize,
    default_retry_after: Duration,
}

impl Dispatcher {
    pub fn new(client: Arc<dyn AccrualClient>, workers: usize, default_retry_after: Duration) -> Self {
        Self {
            client,
            workers: workers.max(1),
            default_retry_after,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// 并发查询一批订单，返回与输入一一对应（顺序不定）的结果
    ///
    /// 返回的 future 被 drop 时，JoinSet 会中止所有仍在执行的请求者
    pub async fn dispatch(&self, orders: Vec<String>) -> Vec<FetchResult> {
        let total = orders.len();
        if total == 0 {
            return Vec::new();
        }

        let queue = Arc::new(Mutex::new(VecDeque::from(orders.clone())));
        let (tx, mut rx) = mpsc::channel::<FetchResult>(total);

        let mut requesters = JoinSet::new();
        for worker_id in 0..self.workers.min(total) {
            let queue = queue.clone();
            let tx = tx.clone();
            let client = self.client.clone();
            let default_retry_after = self.default_retry_after;

            requesters.spawn(async move {
                loop {
                    let next = queue.lock().pop_front();
                    let Some(order) = next else {
                        break;
                    };
                    let response = client.fetch(&order).await;
                    let result = classify(&order, response, default_retry_after);
                    debug!(worker_id, order = %order, outcome = result.label(), "查询完成");
                    if tx.send(result).await.is_err() {
                        break;
                    }
                }
            });
        }
        // 所有请求者退出后通道关闭，recv 返回 None
        drop(tx);

        let mut results = Vec::with_capacity(total);
        while results.len() < total {
            match rx.recv().await {
                Some(result) => results.push(result),
                None => break,
            }
        }

        while let Some(joined) = requesters.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "请求者任务异常退出");
            }
        }

        if results.len() < total {
            backfill_missing(&orders, &mut results);
        }

        results
    }
}

/// 请求者异常退出时补齐缺失的结果，保证输出与输入一一对应
fn backfill_missing(orders: &[String], results: &mut Vec<FetchResult>) {
    let mut outstanding: HashMap<&str, usize> = HashMap::new();
    for order in orders {
        *outstanding.entry(order.as_str()).or_default() += 1;
    }
    for result in results.iter() {
        if let Some(count) = outstanding.get_mut(result.order()) {
            *count = count.saturating_sub(1);
        }
    }

    let mut missing = Vec::new();
    for (order, count) in outstanding {
        for _ in 0..count {
            missing.push(FetchResult::Failed {
                order: order.to_string(),
                error: AccrualError::Transport {
                    order: order.to_string(),
                    reason: "请求者任务异常退出".to_string(),
                },
            });
        }
    }

    error!(missing = missing.len(), "部分订单未返回结果，已标记为失败");
    results.extend(missing);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{AccrualResponse, MockAccrualClient};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn orders(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}", 1000 + i)).collect()
    }

    #[tokio::test]
    async fn test_empty_batch_does_not_call_client() {
        let mut client = MockAccrualClient::new();
        client.expect_fetch().never();

        let dispatcher = Dispatcher::new(Arc::new(client), 4, Duration::from_secs(60));
        assert!(dispatcher.dispatch(Vec::new()).await.is_empty());
    }

    #[tokio::test]
    async fn test_every_order_yields_exactly_one_result() {
        let mut client = MockAccrualClient::new();
        client.expect_fetch().times(25).returning(|order| {
            let n: u32 = order.parse().unwrap();
            match n % 3 {
                0 => Ok(AccrualResponse::new(
                    200,
                    format!(r#"{{"order":"{order}","status":"PROCESSED","accrual":10}}"#),
                )),
                1 => Ok(AccrualResponse::new(204, "")),
                _ => Err(AccrualError::Transport {
                    order: order.to_string(),
                    reason: "connection refused".to_string(),
                }),
            }
        });

        let dispatcher = Dispatcher::new(Arc::new(client), 4, Duration::from_secs(60));
        let input = orders(25);
        let results = dispatcher.dispatch(input.clone()).await;

        assert_eq!(results.len(), 25);
        let mut seen: Vec<String> = results.iter().map(|r| r.order().to_string()).collect();
        seen.sort();
        let mut expected = input;
        expected.sort();
        assert_eq!(seen, expected);

        assert!(results.iter().any(|r| matches!(r, FetchResult::Success(_))));
        assert!(results.iter().any(|r| matches!(r, FetchResult::Unresolved { .. })));
        assert!(results.iter().any(|r| matches!(r, FetchResult::Failed { .. })));
    }

    #[tokio::test]
    async fn test_duplicate_orders_each_get_a_result() {
        let mut client = MockAccrualClient::new();
        client
            .expect_fetch()
            .times(3)
            .returning(|_| Ok(AccrualResponse::new(204, "")));

        let dispatcher = Dispatcher::new(Arc::new(client), 2, Duration::from_secs(60));
        let results = dispatcher
            .dispatch(vec!["100".to_string(), "100".to_string(), "200".to_string()])
            .await;
        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().filter(|r| r.order() == "100").count(), 2);
    }

    /// 并发度不超过配置的请求者数量
    struct CountingClient {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl AccrualClient for CountingClient {
        async fn fetch(&self, _order: &str) -> crate::error::Result<AccrualResponse> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(AccrualResponse::new(204, ""))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bounded_by_worker_count() {
        let client = Arc::new(CountingClient {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let dispatcher = Dispatcher::new(client.clone(), 3, Duration::from_secs(60));
        let results = dispatcher.dispatch(orders(20)).await;

        assert_eq!(results.len(), 20);
        let peak = client.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak={peak}");
        assert!(peak >= 2, "请求应并发执行, peak={peak}");
    }

    #[test]
    fn test_backfill_missing_results() {
        let input = vec!["1".to_string(), "2".to_string(), "2".to_string()];
        let mut results = vec![FetchResult::Unresolved {
            order: "2".to_string(),
        }];
        backfill_missing(&input, &mut results);

        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().filter(|r| r.order() == "2").count(), 2);
        assert_eq!(results.iter().filter(|r| r.order() == "1").count(), 1);
    }
}
