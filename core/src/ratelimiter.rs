//! Token-bucket pacing for calls against a shared external service.

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct RateLimiter {
    sem: Arc<Semaphore>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("available", &self.sem.available_permits()).finish()
    }
}

impl RateLimiter {
    /// Allow `per_minute` acquisitions per minute with at most `burst` banked.
    /// Must be called inside a tokio runtime; the refill task stops once the
    /// last clone is dropped.
    pub fn per_minute(per_minute: u32, burst: u32) -> Self {
        let burst = burst.max(1) as usize;
        let sem = Arc::new(Semaphore::new(burst));
        let weak: Weak<Semaphore> = Arc::downgrade(&sem);
        let interval_ms = (60_000u64 / per_minute.max(1) as u64).max(1);
        tokio::spawn(async move {
            let mut t = tokio::time::interval(Duration::from_millis(interval_ms));
            t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            t.tick().await;
            loop {
                t.tick().await;
                let Some(sem) = weak.upgrade() else { break };
                if sem.available_permits() < burst {
                    sem.add_permits(1);
                }
            }
        });
        RateLimiter { sem }
    }

    pub async fn acquire(&self) {
        if let Ok(permit) = self.sem.acquire().await {
            permit.forget();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_then_paced() {
        let rl = RateLimiter::per_minute(60, 2);
        rl.acquire().await;
        rl.acquire().await;
        let before = tokio::time::Instant::now();
        rl.acquire().await;
        assert!(before.elapsed() >= Duration::from_millis(900));
    }
}
