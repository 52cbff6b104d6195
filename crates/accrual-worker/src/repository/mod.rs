//! 数据访问层
//!
//! - `postgres`: 生产使用的 PostgreSQL 实现
//! - `memory`: 测试与本地联调使用的内存实现

pub mod memory;
pub mod postgres;
pub mod traits;

pub use memory::MemoryAccrualRepository;
pub use postgres::PgAccrualRepository;
pub use traits::{AccrualRepositoryTrait, BatchSummary, OrderRepositoryTrait};
