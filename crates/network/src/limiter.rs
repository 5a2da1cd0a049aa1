//! Outbound pacing for the chat protocol.
//!
//! The chat service enforces a throughput ceiling server-side; clients that
//! exceed it are disconnected. [`RateLimiter`] keeps a connection under that
//! ceiling by tracking the earliest time the next send may proceed and
//! sleeping until then. It only ever delays a send, never rejects one.

use std::time::Duration;
use tokio::time::{self, Instant};

/// Base interval the per-send delay scales from.
const PACING_UNIT: Duration = Duration::from_millis(1300);

/// Delay imposed after a successful send of `bytes` bytes.
///
/// Computed as `1300ms × log₄(bytes)^1.5`:
///
/// | bytes | delay  |
/// |-------|--------|
/// | 4     | ~1.3s  |
/// | 10    | ~2.8s  |
/// | 25    | ~4.6s  |
/// | 50    | ~6.2s  |
/// | 200   | ~9.7s  |
pub fn pacing_delay(bytes: usize) -> Duration {
    if bytes == 0 {
        return Duration::ZERO;
    }
    let exponent = ((bytes as f64).ln() / 4f64.ln()).powf(1.5);
    PACING_UNIT.mul_f64(exponent)
}

/// Per-connection pacing state: the earliest instant the next send may start.
///
/// The instant is monotonically non-decreasing for a given connection. The
/// chat connection keeps the limiter behind its own lock and holds that lock
/// across the send, so rate-limited senders are serialized among themselves.
#[derive(Debug)]
pub struct RateLimiter {
    next_send: Instant,
}

impl RateLimiter {
    /// Creates a limiter that permits an immediate first send.
    pub fn new() -> Self {
        Self {
            next_send: Instant::now(),
        }
    }

    /// Sleeps until the pacing window from the previous send has elapsed.
    pub async fn wait_ready(&mut self) {
        if Instant::now() < self.next_send {
            time::sleep_until(self.next_send).await;
        }
    }

    /// Records a completed send of `bytes` bytes, pushing the next permitted
    /// send time out by [`pacing_delay`]. A send of zero bytes leaves the
    /// state unchanged.
    ///
    /// The permitted time never moves backwards: a small send recorded inside
    /// a larger send's pacing window keeps the larger window.
    pub fn record_send(&mut self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        self.next_send = self.next_send.max(Instant::now() + pacing_delay(bytes));
    }

    /// The earliest instant the next send may proceed.
    pub fn next_send(&self) -> Instant {
        self.next_send
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: Duration, expected_ms: u64) {
        let expected = Duration::from_millis(expected_ms);
        let diff = if actual > expected {
            actual - expected
        } else {
            expected - actual
        };
        assert!(
            diff <= Duration::from_millis(100),
            "pacing delay {actual:?}, expected ~{expected:?}"
        );
    }

    #[test]
    fn delay_matches_pacing_table() {
        assert_close(pacing_delay(4), 1300);
        assert_close(pacing_delay(10), 2800);
        assert_close(pacing_delay(25), 4600);
        assert_close(pacing_delay(50), 6200);
        assert_close(pacing_delay(200), 9700);
    }

    #[test]
    fn zero_bytes_leaves_state_unchanged() {
        let mut limiter = RateLimiter::new();
        let before = limiter.next_send();
        limiter.record_send(0);
        assert_eq!(limiter.next_send(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn four_byte_send_delays_exactly_one_unit() {
        let mut limiter = RateLimiter::new();
        limiter.wait_ready().await;
        let sent_at = Instant::now();
        limiter.record_send(4);
        assert_eq!(limiter.next_send() - sent_at, Duration::from_millis(1300));
    }

    #[tokio::test(start_paused = true)]
    async fn second_send_waits_out_the_remainder() {
        let mut limiter = RateLimiter::new();
        limiter.wait_ready().await;
        limiter.record_send(4);

        time::advance(Duration::from_millis(500)).await;
        let resumed = Instant::now();
        limiter.wait_ready().await;
        assert!(resumed.elapsed() >= Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn next_send_never_decreases() {
        let mut limiter = RateLimiter::new();
        limiter.wait_ready().await;
        limiter.record_send(200);
        let far = limiter.next_send();

        limiter.wait_ready().await;
        limiter.record_send(4);
        assert!(limiter.next_send() >= far);
    }

    #[tokio::test(start_paused = true)]
    async fn small_send_inside_a_larger_window_keeps_the_larger_window() {
        let mut limiter = RateLimiter::new();
        limiter.wait_ready().await;
        limiter.record_send(200);
        let far = limiter.next_send();

        // Recorded without waiting out the window: must not pull it back.
        limiter.record_send(4);
        assert_eq!(limiter.next_send(), far);
    }
}
