use bytes::{Buf, BufMut};
use std::fmt::{Debug, Formatter};

use crate::error::ProbeError;

/// Every datagram is exactly this long, the header being zero-padded.
pub const FRAME_LEN: usize = 64;

const HEADER_LEN: usize = 20;

/// Reserved sequence number for control / start frames. It is never a data index.
pub const SENTINEL_SEQUENCE_NUMBER: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    /// the requester sends data, the responder counts it
    Upload,
    /// the requester asks, the responder sends data back
    Download,
}
impl Direction {
    pub fn to_raw(self) -> u32 {
        match self {
            Direction::Upload => 0,
            Direction::Download => 1,
        }
    }

    /// Any nonzero value on the wire means 'download'
    pub fn from_raw(raw: u32) -> Direction {
        if raw == 0 {
            Direction::Upload
        }
        else {
            Direction::Download
        }
    }
}

/// The fixed 64-byte wire frame, all fields u32 in network byte order (BE):
///
/// ```ascii
///  0: session id
///  4: sequence number - FFFFFFFF marks a control frame
///  8: rate (packets per second requested by the sender)
/// 12: total number of data frames in the session
/// 16: direction: 0 = upload, anything else = download
/// 20: reserved, 44 zero bytes
/// ```
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Frame {
    pub session_id: u32,
    pub sequence_number: u32,
    pub rate: u32,
    pub total_packets: u32,
    pub direction: Direction,
}
impl Debug for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_control() {
            write!(f, "Frame{{#{} CTRL {:?} {}/{}pps}}", self.session_id, self.direction, self.total_packets, self.rate)
        }
        else {
            write!(f, "Frame{{#{} seq {} {:?} {}/{}pps}}", self.session_id, self.sequence_number, self.direction, self.total_packets, self.rate)
        }
    }
}

impl Frame {
    pub fn control(session_id: u32, rate: u32, total_packets: u32, direction: Direction) -> Frame {
        Frame {
            session_id,
            sequence_number: SENTINEL_SEQUENCE_NUMBER,
            rate,
            total_packets,
            direction,
        }
    }

    pub fn data(session_id: u32, sequence_number: u32, rate: u32, total_packets: u32, direction: Direction) -> Frame {
        Frame {
            session_id,
            sequence_number,
            rate,
            total_packets,
            direction,
        }
    }

    pub fn is_control(&self) -> bool {
        self.sequence_number == SENTINEL_SEQUENCE_NUMBER
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.session_id);
        buf.put_u32(self.sequence_number);
        buf.put_u32(self.rate);
        buf.put_u32(self.total_packets);
        buf.put_u32(self.direction.to_raw());
        buf.put_bytes(0, FRAME_LEN - HEADER_LEN);
    }

    pub fn to_bytes(&self) -> [u8; FRAME_LEN] {
        let mut result = [0u8; FRAME_LEN];
        self.ser(&mut &mut result[..]);
        result
    }

    /// Anything after the first [FRAME_LEN] bytes is ignored, the padding is not checked.
    pub fn deser(mut buf: &[u8]) -> Result<Frame, ProbeError> {
        if buf.len() < FRAME_LEN {
            return Err(ProbeError::FrameTooShort { len: buf.len() });
        }

        Ok(Frame {
            session_id: buf.get_u32(),
            sequence_number: buf.get_u32(),
            rate: buf.get_u32(),
            total_packets: buf.get_u32(),
            direction: Direction::from_raw(buf.get_u32()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::upload_data(Frame::data(1, 2, 3, 4, Direction::Upload), vec![0,0,0,1, 0,0,0,2, 0,0,0,3, 0,0,0,4, 0,0,0,0])]
    #[case::download_data(Frame::data(0x01020304, 9, 100, 600, Direction::Download), vec![1,2,3,4, 0,0,0,9, 0,0,0,100, 0,0,2,88, 0,0,0,1])]
    #[case::control(Frame::control(7, 10, 10, Direction::Upload), vec![0,0,0,7, 255,255,255,255, 0,0,0,10, 0,0,0,10, 0,0,0,0])]
    fn test_ser(#[case] frame: Frame, #[case] expected_header: Vec<u8>) {
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);

        assert_eq!(buf.len(), FRAME_LEN);
        assert_eq!(&buf[..HEADER_LEN], expected_header.as_slice());
        assert!(buf[HEADER_LEN..].iter().all(|&b| b == 0));

        assert_eq!(frame.to_bytes().as_slice(), buf.as_ref());
    }

    #[rstest]
    #[case::empty(0)]
    #[case::header_only(20)]
    #[case::one_short(63)]
    fn test_deser_too_short(#[case] len: usize) {
        let buf = vec![0u8; len];
        assert_eq!(Frame::deser(&buf), Err(ProbeError::FrameTooShort { len }));
    }

    #[rstest]
    #[case::zero_is_upload(0, Direction::Upload)]
    #[case::one_is_download(1, Direction::Download)]
    #[case::any_nonzero_is_download(0xdead, Direction::Download)]
    fn test_deser_direction(#[case] raw: u32, #[case] expected: Direction) {
        let mut buf = vec![0u8; FRAME_LEN];
        buf[16..20].copy_from_slice(&raw.to_be_bytes());
        assert_eq!(Frame::deser(&buf).unwrap().direction, expected);
    }

    #[test]
    fn test_deser_ignores_trailing_bytes() {
        let mut buf = Frame::data(5, 6, 7, 8, Direction::Download).to_bytes().to_vec();
        buf.extend_from_slice(&[1, 2, 3]);

        let frame = Frame::deser(&buf).unwrap();
        assert_eq!(frame, Frame::data(5, 6, 7, 8, Direction::Download));
        assert!(!frame.is_control());
    }

    #[test]
    fn test_deser_control() {
        let frame = Frame::deser(&Frame::control(5, 1, 2, Direction::Upload).to_bytes()).unwrap();
        assert!(frame.is_control());
        assert_eq!(frame.sequence_number, SENTINEL_SEQUENCE_NUMBER);
    }
}
