//! 时间源抽象
//!
//! 轮询循环和限流闸门通过 Clock 获取当前时间，测试时可注入与 tokio 计时器同步的时钟。

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// 系统 UTC 时钟
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 跟随 tokio 计时器前进的时钟
///
/// 在 `start_paused` 的测试中 tokio 会自动推进时间，
/// 该时钟返回 `base + 已流逝的 tokio 时间`，让 sleep 与时间戳保持一致。
#[derive(Debug, Clone)]
pub struct TokioClock {
    base: DateTime<Utc>,
    start: tokio::time::Instant,
}

impl TokioClock {
    pub fn starting_at(base: DateTime<Utc>) -> Self {
        Self {
            base,
            start: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.start.elapsed())
            .ok()
            .and_then(|elapsed| self.base.checked_add_signed(elapsed))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let base = Utc::now();
        let clock = TokioClock::starting_at(base);
        assert_eq!(clock.now(), base);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(clock.now(), base + chrono::Duration::seconds(60));
    }

    #[test]
    fn test_system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
