//! Bounded worker admission and retry backoff.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Admission gate bounding the number of in-flight workers of one stage.
#[derive(Clone)]
pub struct WorkerPool {
    name: &'static str,
    slots: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(size: usize, name: &'static str) -> Self {
        Self {
            name,
            slots: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Wait for a free slot. The permit is released on drop, so holding it
    /// across the spawned future bounds the stage's concurrency.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.slots
            .clone()
            .acquire_owned()
            .await
            .unwrap_or_else(|_| panic!("worker pool {} closed", self.name))
    }
}

/// Exponential backoff with jitter, capped.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Delay for the next retry: `base * 2^attempt` capped, plus up to 10%
    /// jitter so synchronized workers fan out.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(0..=exp.as_millis().max(1) as u64 / 10);
        exp + Duration::from_millis(jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_bounds_in_flight_permits() {
        let pool = WorkerPool::new(2, "test");
        let a = pool.acquire().await;
        let _b = pool.acquire().await;
        assert!(pool.slots.try_acquire().is_err());
        drop(a);
        assert!(pool.slots.try_acquire().is_ok());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(80));
        let first = backoff.next_delay();
        let second = backoff.next_delay();
        assert!(first >= Duration::from_millis(10));
        assert!(second >= first || second >= Duration::from_millis(20));
        for _ in 0..10 {
            assert!(backoff.next_delay() <= Duration::from_millis(88));
        }
    }
}
