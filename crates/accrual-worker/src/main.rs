//! 积分对账服务
//!
//! 后台轮询积分计算服务，把结果写回订单与用户余额。

use std::sync::Arc;

use accrual_worker::repository::PgAccrualRepository;
use accrual_worker::{AccrualPoller, HttpAccrualClient, PollerConfig, SystemClock};
use loyalty_shared::{config::AppConfig, database::Database, observability};
use tokio::sync::watch;
use tracing::{error, info};

const SERVICE_NAME: &str = "accrual-worker";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load(SERVICE_NAME)?;

    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    // 配置错误是致命的，循环不会启动
    config.accrual.validate()?;
    let client = HttpAccrualClient::new(&config.accrual.base_url, config.accrual.request_timeout())?;

    info!(
        environment = %config.environment,
        accrual_base_url = %config.accrual.base_url,
        "Starting {}...",
        SERVICE_NAME
    );

    let db = Database::connect(&config.database).await?;
    db.migrate().await?;

    let repo = Arc::new(PgAccrualRepository::new(db.pool().clone()));
    let poller = AccrualPoller::new(
        PollerConfig::from(&config.accrual),
        repo,
        Arc::new(client),
        Arc::new(SystemClock),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller_handle = tokio::spawn(async move {
        poller.run(shutdown_rx).await;
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    if let Err(e) = poller_handle.await {
        error!(error = %e, "积分轮询任务异常退出");
    }

    db.close().await;
    info!("{} shutdown complete", SERVICE_NAME);

    Ok(())
}

/// 监听关闭信号
///
/// K8s 通过 SIGTERM 通知 Pod 停止；本地开发通过 Ctrl+C。
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "注册 Ctrl+C 处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "注册 SIGTERM 处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}
