//! Hybrid timestamp source
//!
//! Millisecond timestamps anchored to the wall clock at startup and
//! advanced by the tokio clock, so interval-driven logic and the
//! timestamps it compares against always share one timeline.

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Clock {
    base_ms: i64,
    started: Instant,
}

impl Clock {
    pub fn start() -> Self {
        Self {
            base_ms: relay_core::epoch_ms(),
            started: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.base_ms + self.started.elapsed().as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn follows_the_runtime_clock() {
        let clock = Clock::start();
        let before = clock.now_ms();
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        assert!(clock.now_ms() - before >= 30_000);
    }
}
