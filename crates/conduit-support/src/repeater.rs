use std::time::{Duration, Instant};

/// Fires at most once per `interval`. Used to drive the dispatcher's idle
/// timer and anything else that wants a cheap periodic check without
/// spinning up a dedicated timer thread.
#[derive(Clone, Copy, Debug)]
pub struct Repeater {
    interval: Duration,
    last_acted: Instant,
}

impl Repeater {
    #[inline]
    pub fn every(interval: Duration) -> Self {
        Self { interval, last_acted: Instant::now() }
    }

    /// `interval == Duration::ZERO` means "never fires".
    #[inline]
    pub fn fired(&mut self) -> bool {
        if self.interval.is_zero() {
            return false;
        }
        let el = self.last_acted.elapsed();
        if el >= self.interval {
            self.last_acted = Instant::now();
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn reset(&mut self) {
        self.last_acted = Instant::now();
    }

    pub fn force_fire(&mut self) {
        self.last_acted = Instant::now() - self.interval.max(Duration::from_nanos(1));
    }
}
