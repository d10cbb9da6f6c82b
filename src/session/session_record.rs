use serde::{Serialize, Serializer};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::protocol::frame::{Direction, Frame};
use crate::session::lifecycle::SessionState;

/// The per-session metrics that are reported to the outside world. This is the unit of the
///  periodic JSON snapshot.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionRecord {
    /// accepted data frames, i.e. fresh (non-duplicate) sequence numbers
    pub count: u64,
    pub duplicates: u64,
    /// data frames sent by this side
    pub sent: u64,
    #[serde(serialize_with = "ser_unix_seconds")]
    pub first_seen: Option<SystemTime>,
    #[serde(serialize_with = "ser_unix_seconds")]
    pub last_seen: Option<SystemTime>,
    pub packet_rate: u32,
    pub total_packets: u32,
    #[serde(serialize_with = "ser_direction")]
    pub direction: Direction,
    pub remote: Option<SocketAddr>,
    pub dying: bool,
    pub state: SessionState,
}

impl Default for SessionRecord {
    fn default() -> Self {
        SessionRecord {
            count: 0,
            duplicates: 0,
            sent: 0,
            first_seen: None,
            last_seen: None,
            packet_rate: 0,
            total_packets: 0,
            direction: Direction::Upload,
            remote: None,
            dying: false,
            state: SessionState::StartTx,
        }
    }
}

impl SessionRecord {
    /// takes over the session parameters from a received frame
    pub fn on_frame(&mut self, frame: &Frame, from: SocketAddr, now: SystemTime) {
        self.remote = Some(from);
        self.total_packets = frame.total_packets;
        self.packet_rate = frame.rate;
        self.direction = frame.direction;
        self.touch(now);
    }

    pub fn touch(&mut self, now: SystemTime) {
        if self.first_seen.is_none() {
            self.first_seen = Some(now);
        }
        self.last_seen = Some(now);
    }
}

fn ser_unix_seconds<S: Serializer>(value: &Option<SystemTime>, serializer: S) -> Result<S::Ok, S::Error> {
    match value.and_then(|t| t.duration_since(UNIX_EPOCH).ok()) {
        Some(d) => serializer.serialize_f64(d.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

fn ser_direction<S: Serializer>(value: &Direction, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u32(value.to_raw())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_on_frame_keeps_first_seen() {
        let mut record = SessionRecord::default();
        let from = SocketAddr::from(([1, 2, 3, 4], 5));
        let t0 = UNIX_EPOCH + Duration::from_secs(100);
        let t1 = t0 + Duration::from_secs(1);

        record.on_frame(&Frame::control(9, 10, 20, Direction::Download), from, t0);
        record.on_frame(&Frame::data(9, 0, 11, 21, Direction::Download), from, t1);

        assert_eq!(record.first_seen, Some(t0));
        assert_eq!(record.last_seen, Some(t1));
        assert_eq!(record.packet_rate, 11);
        assert_eq!(record.total_packets, 21);
        assert_eq!(record.direction, Direction::Download);
        assert_eq!(record.remote, Some(from));
    }

    #[test]
    fn test_json() {
        let record = SessionRecord {
            count: 5,
            duplicates: 2,
            sent: 0,
            first_seen: Some(UNIX_EPOCH + Duration::from_millis(1500)),
            last_seen: None,
            packet_rate: 10,
            total_packets: 5,
            direction: Direction::Download,
            remote: Some(SocketAddr::from(([127, 0, 0, 1], 12345))),
            dying: false,
            state: SessionState::TimedOut,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json, serde_json::json!({
            "count": 5,
            "duplicates": 2,
            "sent": 0,
            "first_seen": 1.5,
            "last_seen": null,
            "packet_rate": 10,
            "total_packets": 5,
            "direction": 1,
            "remote": "127.0.0.1:12345",
            "dying": false,
            "state": "TIMED_OUT",
        }));
    }
}
