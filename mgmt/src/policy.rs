// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Retry and rate limiting policies.

use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

/// Coalesces bursts of notifications: after the first one, wait for the window and swallow
/// whatever else arrived meanwhile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Debounce {
    window: Duration,
}

impl Debounce {
    #[must_use]
    pub const fn new(window: Duration) -> Debounce {
        Debounce { window }
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Wait out the window, then drain the notifications that piled up.
    /// Returns how many were coalesced.
    pub async fn settle<T>(&self, pending: &mut mpsc::Receiver<T>) -> usize {
        if !self.window.is_zero() {
            tokio::time::sleep(self.window).await;
        }
        let mut coalesced = 0;
        while pending.try_recv().is_ok() {
            coalesced += 1;
        }
        trace!("Coalesced {coalesced} notifications");
        coalesced
    }
}

/// Exponential backoff with proportional jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Backoff {
        Backoff {
            initial,
            max: max.max(initial),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// Growth factor between attempts; values below 1 are raised to 1.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Backoff {
        self.multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            1.0
        };
        self
    }

    /// Fraction of the delay by which it is randomly stretched or shrunk, clamped to `[0, 1]`.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Backoff {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    #[must_use]
    pub fn initial(&self) -> Duration {
        self.initial
    }

    #[must_use]
    pub fn max(&self) -> Duration {
        self.max
    }

    /// The delay before retry number `attempt` (starting at 0), without jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.min(64)).unwrap_or(64);
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }

    /// The delay before retry number `attempt`, jittered, never above the maximum.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let spread = rand::random::<f64>().mul_add(2.0, -1.0);
        let secs = base * self.jitter.mul_add(spread, 1.0);
        Duration::from_secs_f64(secs.clamp(0.0, self.max.as_secs_f64()))
    }
}

#[cfg(test)]
mod test {
    use crate::policy::{Backoff, Debounce};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn debounce_swallows_a_burst() {
        let (tx, mut rx) = mpsc::channel(16);
        for _ in 0..5 {
            tx.send(()).await.unwrap();
        }
        // the notification that woke us up
        rx.recv().await.unwrap();

        let debounce = Debounce::new(Duration::from_secs(2));
        let start = tokio::time::Instant::now();
        assert_eq!(debounce.settle(&mut rx).await, 4);
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn zero_window_only_drains() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(1).await.unwrap();
        assert_eq!(Debounce::new(Duration::ZERO).settle(&mut rx).await, 1);
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<u64> = (0..7).map(|a| backoff.base_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(backoff.base_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let backoff = Backoff::new(Duration::from_secs(4), Duration::from_secs(30)).with_jitter(0.25);
        for _ in 0..1000 {
            let delay = backoff.delay(0);
            assert!(delay >= Duration::from_secs(3), "{delay:?}");
            assert!(delay <= Duration::from_secs(5), "{delay:?}");
        }
        for _ in 0..100 {
            assert!(backoff.delay(10) <= Duration::from_secs(30));
        }
    }

    #[test]
    fn no_jitter_is_exact() {
        let backoff = Backoff::default().with_jitter(0.0).with_multiplier(3.0);
        assert_eq!(backoff.delay(2), Duration::from_secs(9));
        assert_eq!(Backoff::default().with_multiplier(0.5).base_delay(3), Duration::from_secs(1));
    }
}
