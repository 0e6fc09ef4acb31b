use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// 聚合器限速器：保证相邻两次放行之间至少间隔 `min_interval`。
///
/// 显式构造、显式传递，生命周期等于一次用户会话；同一会话内对
/// 定价 / 构建接口的调用共享同一个实例。缓存命中不经过这里。
pub struct RateLimiter {
    min_interval: Duration,
    last_release: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_release: Mutex::new(None),
        }
    }

    /// 等待到距上次放行至少 `min_interval`，随后立即记录新的放行时刻。
    /// 锁覆盖整个等待过程，调用方按 FIFO 顺序放行。
    pub async fn wait(&self) {
        let mut last = self.last_release.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                let remaining = self.min_interval - elapsed;
                trace!(target: "throttle", remaining_ms = remaining.as_millis() as u64, "限速等待");
                tokio::time::sleep(remaining).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_wait_releases_immediately() {
        let limiter = RateLimiter::new(Duration::from_millis(500));
        let start = Instant::now();
        limiter.wait().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_waits_take_at_least_n_minus_one_intervals() {
        let interval = Duration::from_millis(500);
        let limiter = RateLimiter::new(interval);
        let start = Instant::now();
        for _ in 0..4 {
            limiter.wait().await;
        }
        assert!(start.elapsed() >= interval * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_time_counts_against_the_interval() {
        let interval = Duration::from_millis(500);
        let limiter = RateLimiter::new(interval);
        limiter.wait().await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        let start = Instant::now();
        limiter.wait().await;
        // 已经过了 400ms，只需再补 100ms。
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }
}
