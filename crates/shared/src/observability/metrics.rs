//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    register_common_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册预定义的业务指标描述
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "accrual_fetch_total",
        "Total number of accrual service lookups by outcome"
    );
    metrics::describe_histogram!(
        "accrual_cycle_duration_seconds",
        "Duration of one reconciliation cycle in seconds"
    );
    metrics::describe_counter!(
        "accrual_batch_applied_total",
        "Total number of accrual results applied to orders"
    );
    metrics::describe_counter!(
        "accrual_points_credited_total",
        "Total loyalty points credited to user balances"
    );
    metrics::describe_counter!(
        "accrual_rate_limited_total",
        "Total number of rate-limit responses from the accrual service"
    );
    metrics::describe_gauge!(
        "worker_last_run_timestamp",
        "Unix timestamp of the last completed worker cycle"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一次积分服务查询的分类结果（success / unresolved / throttled / failed）
#[inline]
pub fn record_accrual_fetch(outcome: &'static str) {
    metrics::counter!("accrual_fetch_total", "outcome" => outcome).increment(1);
}

/// 记录一个对账周期的耗时
#[inline]
pub fn record_accrual_cycle(pending: usize, duration_secs: f64) {
    metrics::histogram!("accrual_cycle_duration_seconds").record(duration_secs);
    metrics::gauge!("accrual_pending_orders").set(pending as f64);
}

/// 记录写入订单的结果数量
#[inline]
pub fn record_accrual_applied(status: &str, count: u64) {
    metrics::counter!("accrual_batch_applied_total", "status" => status.to_string())
        .increment(count);
}

/// 记录入账积分
#[inline]
pub fn record_points_credited(points: f64) {
    metrics::counter!("accrual_points_credited_total").increment(points.max(0.0).round() as u64);
}

/// 记录限流响应
#[inline]
pub fn record_rate_limited() {
    metrics::counter!("accrual_rate_limited_total").increment(1);
}

/// 记录 Worker 最近一次完成周期的时间
#[inline]
pub fn set_worker_last_run(worker: &'static str) {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    metrics::gauge!("worker_last_run_timestamp", "worker" => worker).set(now);
}
