//! PostgreSQL 连接池
//!
//! 启动时建立连接池、确认数据库可达并执行 migrations/ 下的迁移脚本。

use crate::config::DatabaseConfig;
use crate::error::{LoyaltyError, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};

pub struct Database {
    pool: PgPool,
}

impl Database {
    /// 建立连接池，并用一次查询确认数据库可达
    #[instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.url)
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;
        info!("数据库连接池已就绪");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 执行仓库根目录 migrations/ 下尚未应用的迁移
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| LoyaltyError::Internal(format!("数据库迁移失败: {e}")))?;
        info!("数据库迁移完成");
        Ok(())
    }

    /// 等待在途查询结束后关闭连接池
    pub async fn close(self) {
        self.pool.close().await;
        info!("数据库连接池已关闭");
    }
}
