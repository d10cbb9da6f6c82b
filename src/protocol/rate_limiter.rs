use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tracing::trace;

use crate::error::ProbeError;

/// Paces sends to a fixed number of packets per second.
///
/// Deadlines are computed from the previous deadline rather than from the time a send
///  completed, so send latency does not accumulate into drift. If a caller falls behind (e.g.
///  the runtime was busy), the schedule restarts from 'now' instead of bursting to catch up.
pub struct RateLimiter {
    period: Duration,
    next_deadline: Option<Instant>,
}

impl RateLimiter {
    pub fn new(packets_per_second: u32) -> Result<RateLimiter, ProbeError> {
        if packets_per_second == 0 {
            return Err(ProbeError::InvalidRate);
        }

        Ok(RateLimiter {
            period: Duration::from_nanos(1_000_000_000 / packets_per_second as u64),
            next_deadline: None,
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Computes the next deadline and sleeps until it is reached. Call this immediately before
    ///  each send.
    pub async fn pace(&mut self) {
        let now = Instant::now();
        let deadline = match self.next_deadline {
            Some(prev) if prev + self.period >= now => prev + self.period,
            Some(_) => {
                trace!("sender fell behind schedule - restarting from now");
                now + self.period
            }
            None => now + self.period,
        };
        self.next_deadline = Some(deadline);

        sleep_until(deadline).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_zero_rate_is_rejected() {
        assert_eq!(RateLimiter::new(0).err(), Some(ProbeError::InvalidRate));
    }

    #[rstest]
    #[case::one(1, Duration::from_secs(1))]
    #[case::ten(10, Duration::from_millis(100))]
    #[case::thousand(1000, Duration::from_millis(1))]
    fn test_period(#[case] rate: u32, #[case] expected: Duration) {
        assert_eq!(RateLimiter::new(rate).unwrap().period(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pace_keeps_schedule() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(10).unwrap();

        for _ in 0..5 {
            limiter.pace().await;
        }
        assert_eq!(Instant::now() - start, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pace_does_not_accumulate_send_latency() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(10).unwrap();

        for _ in 0..4 {
            limiter.pace().await;
            // simulated send latency, shorter than the period
            tokio::time::advance(Duration::from_millis(30)).await;
        }
        // the fourth deadline is at 400ms, the trailing 30ms is the last 'send'
        assert_eq!(Instant::now() - start, Duration::from_millis(430));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pace_restarts_after_falling_behind() {
        let mut limiter = RateLimiter::new(10).unwrap();
        limiter.pace().await;

        tokio::time::advance(Duration::from_millis(500)).await;

        let before = Instant::now();
        limiter.pace().await;
        assert_eq!(Instant::now() - before, Duration::from_millis(100));
    }
}
