use anyhow::bail;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::ProbeError;
use crate::protocol::frame::{Direction, FRAME_LEN};

pub const DEFAULT_PORT: u16 = 12345;

#[derive(Clone, Debug)]
pub struct ProbeConfig {
    /// The address that the UDP socket is bound to
    pub bind_addr: SocketAddr,

    /// Sessions without any activity for this long are evicted by the sweep. Their id stays
    ///  blocked ('dying') for the lifetime of the process.
    pub session_timeout: Duration,

    /// How often the sweep runs. This is also the granularity at which soft receive timeouts
    ///  are detected for sessions that nobody waits on.
    pub sweep_interval: Duration,

    pub snapshot_interval: Duration,

    /// The receive timeout is this multiple of the expected session duration
    ///  (`total_packets / rate`). Values below 2 make timeouts on perfectly healthy, slightly
    ///  jittery transfers likely.
    pub timeout_multiplier: f64,

    /// number of sentinel frames sent before an upload's data
    pub control_burst_len: u32,

    pub max_datagram_len: usize,
}

impl ProbeConfig {
    pub fn default_for(bind_addr: SocketAddr) -> ProbeConfig {
        ProbeConfig {
            bind_addr,
            session_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            snapshot_interval: Duration::from_secs(5),
            timeout_multiplier: 2.0,
            control_burst_len: 100,
            max_datagram_len: 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.session_timeout.is_zero() {
            bail!("session timeout must not be zero");
        }
        if self.sweep_interval.is_zero() {
            bail!("sweep interval must not be zero");
        }
        if self.snapshot_interval.is_zero() {
            bail!("snapshot interval must not be zero");
        }
        if !(self.timeout_multiplier >= 2.0) {
            bail!("timeout multiplier must be at least 2, was {}", self.timeout_multiplier);
        }
        if self.max_datagram_len < FRAME_LEN {
            bail!("receive buffer of {} bytes cannot hold a {} byte frame", self.max_datagram_len, FRAME_LEN);
        }
        Ok(())
    }
}

/// The parameters of a single test run, as chosen by the requester
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TestParams {
    pub rate: u32,
    pub total_packets: u32,
    pub direction: Direction,
}

impl TestParams {
    pub fn new(rate: u32, total_packets: u32, direction: Direction) -> Result<TestParams, ProbeError> {
        if rate == 0 {
            return Err(ProbeError::InvalidRate);
        }
        Ok(TestParams { rate, total_packets, direction })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config() -> ProbeConfig {
        ProbeConfig::default_for(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    #[test]
    fn test_default_is_valid() {
        assert!(config().validate().is_ok());
    }

    #[rstest]
    #[case::zero_timeout(|c: &mut ProbeConfig| c.session_timeout = Duration::ZERO)]
    #[case::zero_sweep(|c: &mut ProbeConfig| c.sweep_interval = Duration::ZERO)]
    #[case::zero_snapshot(|c: &mut ProbeConfig| c.snapshot_interval = Duration::ZERO)]
    #[case::small_multiplier(|c: &mut ProbeConfig| c.timeout_multiplier = 1.5)]
    #[case::nan_multiplier(|c: &mut ProbeConfig| c.timeout_multiplier = f64::NAN)]
    #[case::small_buffer(|c: &mut ProbeConfig| c.max_datagram_len = 63)]
    fn test_invalid(#[case] modify: fn(&mut ProbeConfig)) {
        let mut config = config();
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_params_reject_zero_rate() {
        assert_eq!(TestParams::new(0, 10, Direction::Upload), Err(ProbeError::InvalidRate));
        assert!(TestParams::new(1, 0, Direction::Download).is_ok());
    }
}
