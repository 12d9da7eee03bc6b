// ============================================================================
// Rate Limiter
// ============================================================================
//
// Truncated-window permit gate for outbound transport calls: at most
// `messages_per_second` grants per one-second window, counted from the first
// grant of the window. Once the budget is spent, `wait()` sleeps out the rest
// of the window plus a small safety margin before opening a fresh one.
//
// One instance is owned by a single drain invocation and called sequentially,
// so no internal locking is needed.

use tokio::time::{sleep, Duration, Instant};

const WINDOW: Duration = Duration::from_millis(1000);
const SAFETY_MARGIN: Duration = Duration::from_millis(50);

pub struct RateLimiter {
    messages_per_second: u32,
    window_start: Option<Instant>,
    granted_in_window: u32,
}

impl RateLimiter {
    pub fn new(messages_per_second: u32) -> Self {
        Self {
            messages_per_second: messages_per_second.max(1),
            window_start: None,
            granted_in_window: 0,
        }
    }

    /// Block until a permit is available, then consume it.
    ///
    /// The very first call always grants immediately; the window starts there.
    pub async fn wait(&mut self) {
        let now = Instant::now();

        let start = match self.window_start {
            None => {
                self.window_start = Some(now);
                self.granted_in_window = 1;
                return;
            }
            Some(start) => start,
        };

        let elapsed = now.duration_since(start);
        if elapsed >= WINDOW {
            // Window expired while we were idle; open a new one
            self.window_start = Some(now);
            self.granted_in_window = 1;
            return;
        }

        if self.granted_in_window < self.messages_per_second {
            self.granted_in_window += 1;
            return;
        }

        // Budget exhausted: sleep out the remainder plus a margin that guards
        // against clock skew between us and the transport's own limiter
        sleep(WINDOW - elapsed + SAFETY_MARGIN).await;
        self.window_start = Some(Instant::now());
        self.granted_in_window = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_call_grants_immediately() {
        let mut limiter = RateLimiter::new(5);
        let before = Instant::now();
        limiter.wait().await;
        assert_eq!(Instant::now(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn stays_within_budget_inside_one_window() {
        let mut limiter = RateLimiter::new(10);
        let before = Instant::now();
        for _ in 0..10 {
            limiter.wait().await;
        }
        // All ten fit in the first window without sleeping
        assert_eq!(Instant::now(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn sequence_of_calls_respects_lower_bound() {
        let per_second = 4u32;
        let calls = 12u32;
        let mut limiter = RateLimiter::new(per_second);

        let start = Instant::now();
        for _ in 0..calls {
            limiter.wait().await;
        }
        let elapsed = start.elapsed();

        // ceil(12 / 4) = 3 windows; two forced sleeps separate them
        let full_windows = (calls / per_second - 1) as u64;
        assert!(
            elapsed >= Duration::from_millis(full_windows * 1000),
            "elapsed {:?} below the rate-limit floor",
            elapsed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_after_idle_gap() {
        let mut limiter = RateLimiter::new(2);
        limiter.wait().await;
        limiter.wait().await;

        // Idle past the window end; the next call must not sleep
        sleep(Duration::from_millis(1100)).await;
        let before = Instant::now();
        limiter.wait().await;
        assert_eq!(Instant::now(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_window_sleeps_with_margin() {
        let mut limiter = RateLimiter::new(1);
        limiter.wait().await;

        let before = Instant::now();
        limiter.wait().await;
        let slept = before.elapsed();

        // remaining window (~1000ms) + 50ms margin
        assert!(slept >= Duration::from_millis(1000));
        assert!(slept <= Duration::from_millis(1100));
    }
}
