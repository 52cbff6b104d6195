//! 内存对账仓储
//!
//! 使用 parking_lot::Mutex 保护的内存存储，适用于测试和本地联调。
//! 批量写入先在副本上执行，全部成功后再整体替换，语义上等同于数据库事务。
//! 支持注入故障，便于验证原子性和闸门的容错行为。

use std::cmp::Reverse;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;

use super::traits::{AccrualRepositoryTrait, BatchSummary, OrderRepositoryTrait};
use crate::error::{AccrualError, Result};
use crate::models::{
    AccrualUpdate, Balance, Order, OrderNumber, OrderStatus, Registration, Withdrawal,
    validate_points_amount,
};

#[derive(Debug, Clone, Default)]
struct State {
    orders: HashMap<String, Order>,
    /// 上传顺序，uploaded_at 相同时用于稳定排序
    sequence: HashMap<String, u64>,
    next_sequence: u64,
    balances: HashMap<String, Balance>,
    gates: HashMap<String, DateTime<Utc>>,
    /// 按提现顺序追加
    withdrawals: Vec<Withdrawal>,
}

impl State {
    fn insert_order(&mut self, order: Order) {
        self.sequence.insert(order.number.clone(), self.next_sequence);
        self.next_sequence += 1;
        self.orders.insert(order.number.clone(), order);
    }
}

#[derive(Debug, Default)]
struct Faults {
    /// 下一批写入在第 k 条（从 0 开始）时失败
    fail_batch_at: Option<usize>,
    fail_gate_reads: bool,
    fail_gate_writes: bool,
    fail_pending_reads: bool,
}

#[derive(Debug, Default)]
pub struct MemoryAccrualRepository {
    state: Mutex<State>,
    faults: Mutex<Faults>,
    writes: Mutex<usize>,
}

impl MemoryAccrualRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接写入订单，不做 Luhn 校验（用于准备测试数据）
    pub fn insert_order(&self, user_id: &str, number: &str, uploaded_at: DateTime<Utc>) {
        self.state.lock().insert_order(Order {
            number: number.to_string(),
            user_id: user_id.to_string(),
            status: OrderStatus::New,
            accrual: Decimal::ZERO,
            uploaded_at,
        });
    }

    /// 让下一次批量写入在第 `index` 条记录处失败
    pub fn fail_next_batch_at(&self, index: usize) {
        self.faults.lock().fail_batch_at = Some(index);
    }

    pub fn set_gate_read_failure(&self, fail: bool) {
        self.faults.lock().fail_gate_reads = fail;
    }

    pub fn set_gate_write_failure(&self, fail: bool) {
        self.faults.lock().fail_gate_writes = fail;
    }

    pub fn set_pending_read_failure(&self, fail: bool) {
        self.faults.lock().fail_pending_reads = fail;
    }

    /// 成功提交的写操作次数（批量写入、闸门写入、订单上传、提现）
    pub fn write_count(&self) -> usize {
        *self.writes.lock()
    }

    fn record_write(&self) {
        *self.writes.lock() += 1;
    }
}

fn apply_one(state: &mut State, update: &AccrualUpdate) -> Result<Option<Decimal>> {
    let order = state
        .orders
        .get_mut(&update.order)
        .ok_or_else(|| AccrualError::OrderNotFound(update.order.clone()))?;

    if !order.status.can_advance_to(update.status) {
        return Ok(None);
    }

    order.status = update.status;
    order.accrual = update.accrual;

    if update.status != OrderStatus::Processed {
        return Ok(Some(Decimal::ZERO));
    }

    let user_id = order.user_id.clone();
    let balance = state
        .balances
        .entry(user_id.clone())
        .or_insert_with(|| Balance::empty(&user_id));
    balance.current += update.accrual;

    Ok(Some(update.accrual))
}

#[async_trait]
impl AccrualRepositoryTrait for MemoryAccrualRepository {
    async fn list_pending_orders(&self) -> Result<Vec<String>> {
        if self.faults.lock().fail_pending_reads {
            return Err(AccrualError::InjectedFailure("list_pending_orders".to_string()));
        }

        let state = self.state.lock();
        let mut pending: Vec<&Order> = state
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .collect();
        pending.sort_by_key(|o| (o.uploaded_at, state.sequence.get(&o.number).copied()));

        Ok(pending.into_iter().map(|o| o.number.clone()).collect())
    }

    async fn apply_accrual_batch(&self, updates: &[AccrualUpdate]) -> Result<BatchSummary> {
        let fail_at = self.faults.lock().fail_batch_at.take();

        let mut state = self.state.lock();
        let mut draft = state.clone();
        let mut summary = BatchSummary::default();

        for (index, update) in updates.iter().enumerate() {
            if fail_at == Some(index) {
                return Err(AccrualError::InjectedFailure(update.order.clone()));
            }
            match apply_one(&mut draft, update)? {
                Some(credited) => {
                    summary.updated += 1;
                    summary.credited += credited;
                }
                None => summary.skipped += 1,
            }
        }

        *state = draft;
        drop(state);
        self.record_write();
        Ok(summary)
    }

    async fn get_retry_not_before(&self, service_name: &str) -> Result<Option<DateTime<Utc>>> {
        if self.faults.lock().fail_gate_reads {
            return Err(AccrualError::InjectedFailure(format!("gate:{service_name}")));
        }
        Ok(self.state.lock().gates.get(service_name).copied())
    }

    async fn set_retry_not_before(
        &self,
        service_name: &str,
        not_before: DateTime<Utc>,
    ) -> Result<()> {
        if self.faults.lock().fail_gate_writes {
            return Err(AccrualError::InjectedFailure(format!("gate:{service_name}")));
        }
        self.state
            .lock()
            .gates
            .insert(service_name.to_string(), not_before);
        self.record_write();
        Ok(())
    }
}

#[async_trait]
impl OrderRepositoryTrait for MemoryAccrualRepository {
    async fn register_order(&self, user_id: &str, number: &str) -> Result<Registration> {
        let number = OrderNumber::parse(number)?;

        let mut state = self.state.lock();
        if let Some(existing) = state.orders.get(number.as_str()) {
            return if existing.user_id == user_id {
                Ok(Registration::AlreadyRegistered)
            } else {
                Err(AccrualError::OrderOwnedByAnotherUser(number.to_string()))
            };
        }

        state.insert_order(Order {
            number: number.to_string(),
            user_id: user_id.to_string(),
            status: OrderStatus::New,
            accrual: Decimal::ZERO,
            uploaded_at: Utc::now(),
        });
        drop(state);
        self.record_write();
        Ok(Registration::Registered)
    }

    async fn get_order(&self, number: &str) -> Result<Option<Order>> {
        Ok(self.state.lock().orders.get(number).cloned())
    }

    async fn list_orders(&self, user_id: &str) -> Result<Vec<Order>> {
        let state = self.state.lock();
        let mut orders: Vec<&Order> = state
            .orders
            .values()
            .filter(|o| o.user_id == user_id)
            .collect();
        orders.sort_by_key(|o| Reverse((o.uploaded_at, state.sequence.get(&o.number).copied())));

        Ok(orders.into_iter().cloned().collect())
    }

    async fn get_balance(&self, user_id: &str) -> Result<Balance> {
        Ok(self
            .state
            .lock()
            .balances
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| Balance::empty(user_id)))
    }

    async fn withdraw(&self, user_id: &str, order: &str, sum: Decimal) -> Result<Withdrawal> {
        let number = OrderNumber::parse(order)?;
        let sum = validate_points_amount(sum)?;

        let mut state = self.state.lock();
        let used = state.orders.contains_key(number.as_str())
            || state.withdrawals.iter().any(|w| w.order == number.as_str());
        if used {
            return Err(AccrualError::OrderAlreadyUsed(number.to_string()));
        }

        let available = state
            .balances
            .get(user_id)
            .map_or(Decimal::ZERO, |b| b.current);
        if available < sum {
            return Err(AccrualError::InsufficientFunds {
                user_id: user_id.to_string(),
                requested: sum,
                available,
            });
        }

        let balance = state
            .balances
            .entry(user_id.to_string())
            .or_insert_with(|| Balance::empty(user_id));
        balance.current -= sum;
        balance.withdrawn += sum;

        let withdrawal = Withdrawal {
            order: number.to_string(),
            user_id: user_id.to_string(),
            sum,
            processed_at: Utc::now(),
        };
        state.withdrawals.push(withdrawal.clone());
        drop(state);
        self.record_write();
        Ok(withdrawal)
    }

    async fn list_withdrawals(&self, user_id: &str) -> Result<Vec<Withdrawal>> {
        let state = self.state.lock();
        let mut withdrawals: Vec<Withdrawal> = state
            .withdrawals
            .iter()
            .rev()
            .filter(|w| w.user_id == user_id)
            .cloned()
            .collect();
        // 稳定排序，同一时刻的记录保持后提现的在前
        withdrawals.sort_by_key(|w| Reverse(w.processed_at));

        Ok(withdrawals)
    }
}
