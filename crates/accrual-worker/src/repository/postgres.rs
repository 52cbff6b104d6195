//! PostgreSQL 对账仓储
//!
//! 批量写入在单个事务内完成：逐单加行锁读取当前状态与所有者，
//! 终态订单直接跳过，保证同一订单的积分只入账一次。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, instrument};

use super::traits::{AccrualRepositoryTrait, BatchSummary, OrderRepositoryTrait};
use crate::error::{AccrualError, Result};
use crate::models::{
    AccrualUpdate, Balance, Order, OrderNumber, OrderStatus, Registration, Withdrawal,
    validate_points_amount,
};

/// 加锁读取到的订单当前状态
#[derive(sqlx::FromRow)]
struct LockedOrder {
    user_id: String,
    status: OrderStatus,
}

pub struct PgAccrualRepository {
    pool: PgPool,
}

impl PgAccrualRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 在事务中写入单条结果，返回本条入账的积分（未入账为 None）
    ///
    /// 返回 Ok(None) 且不修改数据表示订单已处于终态
    async fn apply_one_in_tx(
        tx: &mut PgConnection,
        update: &AccrualUpdate,
    ) -> Result<Option<Decimal>> {
        let locked = sqlx::query_as::<_, LockedOrder>(
            r#"
            SELECT user_id, status
            FROM orders
            WHERE number = $1
            FOR UPDATE
            "#,
        )
        .bind(&update.order)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AccrualError::OrderNotFound(update.order.clone()))?;

        if !locked.status.can_advance_to(update.status) {
            debug!(
                order = %update.order,
                current = %locked.status,
                next = %update.status,
                "订单状态不可回退，跳过"
            );
            return Ok(None);
        }

        sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, accrual = $3, updated_at = NOW()
            WHERE number = $1
            "#,
        )
        .bind(&update.order)
        .bind(update.status)
        .bind(update.accrual)
        .execute(&mut *tx)
        .await?;

        if update.status != OrderStatus::Processed {
            return Ok(Some(Decimal::ZERO));
        }

        sqlx::query(
            r#"
            INSERT INTO user_balances (user_id, current, withdrawn, updated_at)
            VALUES ($1, $2, 0, NOW())
            ON CONFLICT (user_id) DO UPDATE
            SET current = user_balances.current + EXCLUDED.current,
                updated_at = NOW()
            "#,
        )
        .bind(&locked.user_id)
        .bind(update.accrual)
        .execute(&mut *tx)
        .await?;

        Ok(Some(update.accrual))
    }
}

#[async_trait]
impl AccrualRepositoryTrait for PgAccrualRepository {
    async fn list_pending_orders(&self) -> Result<Vec<String>> {
        let numbers = sqlx::query_scalar::<_, String>(
            r#"
            SELECT number
            FROM orders
            WHERE status IN ('NEW', 'PROCESSING')
            ORDER BY uploaded_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(numbers)
    }

    #[instrument(skip(self, updates), fields(batch_size = updates.len()))]
    async fn apply_accrual_batch(&self, updates: &[AccrualUpdate]) -> Result<BatchSummary> {
        let mut tx = self.pool.begin().await?;
        let mut summary = BatchSummary::default();

        for update in updates {
            // 出错时 tx 被 drop，整批自动回滚
            match Self::apply_one_in_tx(&mut tx, update).await? {
                Some(credited) => {
                    summary.updated += 1;
                    summary.credited += credited;
                }
                None => summary.skipped += 1,
            }
        }

        tx.commit().await?;
        Ok(summary)
    }

    async fn get_retry_not_before(&self, service_name: &str) -> Result<Option<DateTime<Utc>>> {
        let not_before = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT not_before FROM retry_gates WHERE service_name = $1",
        )
        .bind(service_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(not_before)
    }

    async fn set_retry_not_before(
        &self,
        service_name: &str,
        not_before: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO retry_gates (service_name, not_before, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (service_name) DO UPDATE
            SET not_before = EXCLUDED.not_before, updated_at = NOW()
            "#,
        )
        .bind(service_name)
        .bind(not_before)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl OrderRepositoryTrait for PgAccrualRepository {
    async fn register_order(&self, user_id: &str, number: &str) -> Result<Registration> {
        let number = OrderNumber::parse(number)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO orders (number, user_id, status, accrual, uploaded_at)
            VALUES ($1, $2, 'NEW', 0, NOW())
            ON CONFLICT (number) DO NOTHING
            "#,
        )
        .bind(number.as_str())
        .bind(user_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(Registration::Registered);
        }

        let owner: String = sqlx::query_scalar("SELECT user_id FROM orders WHERE number = $1")
            .bind(number.as_str())
            .fetch_one(&self.pool)
            .await?;

        if owner == user_id {
            Ok(Registration::AlreadyRegistered)
        } else {
            Err(AccrualError::OrderOwnedByAnotherUser(number.to_string()))
        }
    }

    async fn get_order(&self, number: &str) -> Result<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(
            r#"
            SELECT number, user_id, status, accrual, uploaded_at
            FROM orders
            WHERE number = $1
            "#,
        )
        .bind(number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    async fn list_orders(&self, user_id: &str) -> Result<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(
            r#"
            SELECT number, user_id, status, accrual, uploaded_at
            FROM orders
            WHERE user_id = $1
            ORDER BY uploaded_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    async fn get_balance(&self, user_id: &str) -> Result<Balance> {
        let row: Option<(Decimal, Decimal)> = sqlx::query_as(
            "SELECT current, withdrawn FROM user_balances WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((current, withdrawn)) => Balance {
                user_id: user_id.to_string(),
                current,
                withdrawn,
            },
            None => Balance::empty(user_id),
        })
    }

    #[instrument(skip(self))]
    async fn withdraw(&self, user_id: &str, order: &str, sum: Decimal) -> Result<Withdrawal> {
        let number = OrderNumber::parse(order)?;
        let sum = validate_points_amount(sum)?;

        let mut tx = self.pool.begin().await?;

        let uploaded: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM orders WHERE number = $1)")
                .bind(number.as_str())
                .fetch_one(&mut *tx)
                .await?;
        if uploaded {
            return Err(AccrualError::OrderAlreadyUsed(number.to_string()));
        }

        // 锁住余额行，避免并发提现超额扣减
        let available = sqlx::query_scalar::<_, Decimal>(
            "SELECT current FROM user_balances WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .unwrap_or(Decimal::ZERO);

        if available < sum {
            return Err(AccrualError::InsufficientFunds {
                user_id: user_id.to_string(),
                requested: sum,
                available,
            });
        }

        let withdrawal = sqlx::query_as::<_, Withdrawal>(
            r#"
            INSERT INTO withdrawals (number, user_id, sum, processed_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (number) DO NOTHING
            RETURNING number, user_id, sum, processed_at
            "#,
        )
        .bind(number.as_str())
        .bind(user_id)
        .bind(sum)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AccrualError::OrderAlreadyUsed(number.to_string()))?;

        sqlx::query(
            r#"
            UPDATE user_balances
            SET current = current - $2,
                withdrawn = withdrawn + $2,
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(sum)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(sum = %sum, "提现完成");
        Ok(withdrawal)
    }

    async fn list_withdrawals(&self, user_id: &str) -> Result<Vec<Withdrawal>> {
        let withdrawals = sqlx::query_as::<_, Withdrawal>(
            r#"
            SELECT number, user_id, sum, processed_at
            FROM withdrawals
            WHERE user_id = $1
            ORDER BY processed_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(withdrawals)
    }
}
