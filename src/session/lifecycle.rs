use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// control phase: the sender's burst of sentinel frames, or a requester's download
    ///  request frames
    StartTx,
    /// data frames are on the wire
    SendData,
    Complete,
    /// soft outcome: the adaptive receive timeout fired before all data arrived. Counts are
    ///  kept and reported.
    TimedOut,
    Failed,
}
impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Complete | SessionState::TimedOut | SessionState::Failed)
    }
}

/// Observable snapshot of a session's lifecycle, published to waiters whenever it changes
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LifecycleStatus {
    pub state: SessionState,
    pub timeout_deadline: Option<Instant>,
}

/// The per-session state machine `START_TX -> SEND_DATA -> COMPLETE | TIMED_OUT | FAILED`.
///
/// Terminal states are final. In particular, a session that timed out stays `TIMED_OUT` even if
///  stragglers arrive afterwards - they are still counted, but the outcome was already decided.
pub struct Lifecycle {
    state: SessionState,
    timeout_multiplier: f64,
    timeout_deadline: Option<Instant>,
}

impl Lifecycle {
    pub fn new(timeout_multiplier: f64) -> Lifecycle {
        Lifecycle {
            state: SessionState::StartTx,
            timeout_multiplier,
            timeout_deadline: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn status(&self) -> LifecycleStatus {
        LifecycleStatus {
            state: self.state,
            timeout_deadline: self.timeout_deadline,
        }
    }

    #[cfg(test)]
    pub fn timeout_deadline(&self) -> Option<Instant> {
        self.timeout_deadline
    }

    /// returns `true` if the state changed
    pub fn enter_data_phase(&mut self) -> bool {
        self.transition(SessionState::StartTx, SessionState::SendData)
    }

    /// Receiver side: called after each data frame (fresh or duplicate). Completion is decided
    ///  right here, without waiting for any timer. Returns `true` if the status changed.
    pub fn on_data_frame(&mut self, accepted: u64, total_packets: u32, rate: u32, now: Instant) -> bool {
        let mut changed = self.enter_data_phase();

        if self.state.is_terminal() {
            return changed;
        }

        if accepted >= total_packets as u64 {
            debug!("all {} packets accepted", total_packets);
            self.state = SessionState::Complete;
            return true;
        }

        if self.timeout_deadline.is_none() {
            changed |= self.arm_timeout(total_packets, rate, now);
        }
        changed
    }

    /// The timeout is armed exactly once per session. Re-arming on every frame would let a
    ///  stalled trickle of packets postpone the timeout forever.
    fn arm_timeout(&mut self, total_packets: u32, rate: u32, now: Instant) -> bool {
        if rate == 0 {
            warn!("peer announced a rate of 0 - not arming a receive timeout");
            return false;
        }

        let expected_duration = Duration::from_secs_f64(total_packets as f64 / rate as f64);
        let timeout = expected_duration.mul_f64(self.timeout_multiplier);
        debug!("arming receive timeout of {:?} (expected duration {:?})", timeout, expected_duration);

        self.timeout_deadline = Some(now + timeout);
        true
    }

    /// returns `true` if the session just timed out
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        match self.timeout_deadline {
            Some(deadline) if !self.state.is_terminal() && now >= deadline => {
                debug!("receive timeout expired in state {:?}", self.state);
                self.state = SessionState::TimedOut;
                true
            }
            _ => false,
        }
    }

    pub fn complete(&mut self) -> bool {
        self.finish(SessionState::Complete)
    }

    pub fn fail(&mut self) -> bool {
        self.finish(SessionState::Failed)
    }

    fn finish(&mut self, terminal: SessionState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = terminal;
        true
    }

    fn transition(&mut self, from: SessionState, to: SessionState) -> bool {
        if self.state == from {
            self.state = to;
            true
        }
        else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_sender_path() {
        let mut lifecycle = Lifecycle::new(2.0);
        assert_eq!(lifecycle.state(), SessionState::StartTx);

        assert!(lifecycle.enter_data_phase());
        assert!(!lifecycle.enter_data_phase());
        assert_eq!(lifecycle.state(), SessionState::SendData);

        assert!(lifecycle.complete());
        assert!(!lifecycle.fail());
        assert_eq!(lifecycle.state(), SessionState::Complete);
    }

    #[test]
    fn test_complete_without_timer() {
        let now = Instant::now();
        let mut lifecycle = Lifecycle::new(2.0);

        for accepted in 1..5 {
            lifecycle.on_data_frame(accepted, 5, 1, now);
            assert_eq!(lifecycle.state(), SessionState::SendData);
        }
        assert!(lifecycle.on_data_frame(5, 5, 1, now));
        assert_eq!(lifecycle.state(), SessionState::Complete);
        assert!(!lifecycle.check_timeout(now + Duration::from_secs(3600)));
    }

    #[rstest]
    #[case::double(2.0, 10, 10, Duration::from_secs(2))]
    #[case::triple(3.0, 10, 10, Duration::from_secs(3))]
    #[case::slow(2.0, 60, 1, Duration::from_secs(120))]
    #[case::fast(2.0, 100, 1000, Duration::from_millis(200))]
    fn test_timeout_armed_once(#[case] multiplier: f64, #[case] total: u32, #[case] rate: u32, #[case] expected_timeout: Duration) {
        let start = Instant::now();
        let mut lifecycle = Lifecycle::new(multiplier);

        assert!(lifecycle.on_data_frame(1, total, rate, start));
        assert_eq!(lifecycle.timeout_deadline(), Some(start + expected_timeout));

        // later frames do not push the deadline
        lifecycle.on_data_frame(2, total, rate, start + Duration::from_millis(500));
        assert_eq!(lifecycle.timeout_deadline(), Some(start + expected_timeout));
    }

    #[test]
    fn test_stalled_transfer_times_out() {
        let start = Instant::now();
        let mut lifecycle = Lifecycle::new(2.0);

        lifecycle.on_data_frame(1, 10, 10, start);
        // a trickle of frames keeps arriving, but not enough to complete
        for i in 1..19 {
            lifecycle.on_data_frame(1, 10, 10, start + Duration::from_millis(100 * i));
            assert!(!lifecycle.check_timeout(start + Duration::from_millis(100 * i)));
        }

        assert!(lifecycle.check_timeout(start + Duration::from_secs(2)));
        assert_eq!(lifecycle.state(), SessionState::TimedOut);
        assert!(!lifecycle.check_timeout(start + Duration::from_secs(3)));
    }

    #[test]
    fn test_timed_out_is_final() {
        let start = Instant::now();
        let mut lifecycle = Lifecycle::new(2.0);

        lifecycle.on_data_frame(1, 2, 1, start);
        lifecycle.check_timeout(start + Duration::from_secs(10));

        assert!(!lifecycle.on_data_frame(2, 2, 1, start + Duration::from_secs(11)));
        assert_eq!(lifecycle.state(), SessionState::TimedOut);
    }

    #[test]
    fn test_zero_rate_does_not_arm() {
        let mut lifecycle = Lifecycle::new(2.0);
        lifecycle.on_data_frame(1, 10, 0, Instant::now());

        assert_eq!(lifecycle.state(), SessionState::SendData);
        assert_eq!(lifecycle.timeout_deadline(), None);
    }

    #[test]
    fn test_no_timeout_before_data() {
        let mut lifecycle = Lifecycle::new(2.0);
        assert!(!lifecycle.check_timeout(Instant::now() + Duration::from_secs(3600)));
        assert_eq!(lifecycle.state(), SessionState::StartTx);
    }
}
