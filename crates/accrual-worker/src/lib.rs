//! 积分对账服务
//!
//! 轮询外部积分计算服务，按限流信号退避，并把计算结果原子地合并进订单状态与用户余额。
//! 一个后台循环串行执行各个周期，周期内由固定数量的请求者并发查询。

pub mod classifier;
pub mod client;
pub mod clock;
pub mod dispatcher;
pub mod error;
pub mod gate;
pub mod models;
pub mod poller;
pub mod reconciler;
pub mod repository;

pub use classifier::FetchResult;
pub use client::{AccrualClient, AccrualResponse, HttpAccrualClient};
pub use clock::{Clock, SystemClock, TokioClock};
pub use error::{AccrualError, Result};
pub use poller::{AccrualPoller, CycleOutcome, PollerConfig};
