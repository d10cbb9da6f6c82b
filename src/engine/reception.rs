use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::select;
use tracing::{debug, info, trace};

use crate::engine::supervisor::StopSignal;
use crate::engine::transmission::TransmissionEngine;
use crate::protocol::frame::{Direction, Frame};
use crate::session::session_table::{PacketCount, SessionTable};

/// Which side of a test this endpoint is on
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    /// serves any number of sessions
    Responder,
    /// only interested in frames of its own outstanding session
    Requester { session_id: u32 },
}

/// What happened to a received datagram
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Reception {
    Dropped,
    Counted(PacketCount),
    DownloadRequested { serve_started: bool },
}

pub struct ReceptionEngine {
    role: Role,
    table: Arc<SessionTable>,
    transmission: Arc<TransmissionEngine>,
    max_datagram_len: usize,
}

impl ReceptionEngine {
    pub fn new(role: Role, table: Arc<SessionTable>, transmission: Arc<TransmissionEngine>, max_datagram_len: usize) -> ReceptionEngine {
        ReceptionEngine {
            role,
            table,
            transmission,
            max_datagram_len,
        }
    }

    /// Receives datagrams until the stop signal is raised. Errors that concern a single
    ///  datagram are logged and skipped, anything else is returned.
    pub async fn recv_loop(&self, socket: Arc<UdpSocket>, mut stop: StopSignal) -> anyhow::Result<()> {
        info!("starting receive loop as {:?}", self.role);

        let mut buf = vec![0u8; self.max_datagram_len];
        loop {
            let (num_read, from) = select! {
                _ = stop.stopped() => {
                    info!("receive loop stopped");
                    return Ok(());
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok(x) => x,
                    Err(e) if is_transient(e.kind()) => {
                        debug!("socket error: {} - ignoring", e);
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            };

            trace!("received {} bytes from {:?}", num_read, from);
            self.on_datagram(&buf[..num_read], from).await;
        }
    }

    pub async fn on_datagram(&self, buf: &[u8], from: SocketAddr) -> Reception {
        let frame = match Frame::deser(buf) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("{} from {:?} - dropping", e, from);
                return Reception::Dropped;
            }
        };
        trace!("received {:?}", frame);

        if let Role::Requester { session_id } = self.role {
            if frame.session_id != session_id {
                debug!("frame for foreign session {} from {:?} - dropping", frame.session_id, from);
                return Reception::Dropped;
            }
        }

        if self.table.is_dying(frame.session_id).await {
            trace!("frame for dying session {} - dropping", frame.session_id);
            return Reception::Dropped;
        }
        if let Err(e) = self.table.observe_frame(&frame, from).await {
            debug!("{} - dropping", e);
            return Reception::Dropped;
        }

        match (self.role, frame.direction) {
            (Role::Responder, Direction::Download) => Reception::DownloadRequested {
                serve_started: self.transmission.start_download_serve(frame.session_id).await,
            },
            _ => match self.table.count_packet(frame.session_id, frame.sequence_number).await {
                Ok(PacketCount::OutOfRange) => Reception::Dropped,
                Ok(count) => {
                    if let PacketCount::Duplicate { occurrences } = count {
                        debug!("session {}: sequence number {} received {} times", frame.session_id, frame.sequence_number, occurrences);
                    }
                    Reception::Counted(count)
                }
                Err(e) => {
                    debug!("{} - dropping", e);
                    Reception::Dropped
                }
            },
        }
    }
}

/// ICMP errors from earlier sends may surface on receive; they concern a single peer
fn is_transient(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused | ErrorKind::Interrupted)
}
