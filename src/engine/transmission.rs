use std::net::SocketAddr;
use std::sync::Arc;
use tokio::select;
use tracing::{debug, info, trace, warn};

use crate::config::{ProbeConfig, TestParams};
use crate::engine::send_socket::SendSocket;
use crate::engine::supervisor::{StopSignal, Supervisor};
use crate::error::ProbeError;
use crate::protocol::frame::{Direction, Frame};
use crate::protocol::rate_limiter::RateLimiter;
use crate::session::session_table::{ServeParams, SessionTable};

/// The three send roles: a requester's upload, a requester's download request, and a
///  responder serving a download. Each role paces its frames with its own [RateLimiter].
pub struct TransmissionEngine {
    config: Arc<ProbeConfig>,
    socket: Arc<dyn SendSocket>,
    table: Arc<SessionTable>,
    supervisor: Arc<Supervisor>,
}

impl TransmissionEngine {
    pub fn new(config: Arc<ProbeConfig>, socket: Arc<dyn SendSocket>, table: Arc<SessionTable>, supervisor: Arc<Supervisor>) -> TransmissionEngine {
        TransmissionEngine {
            config,
            socket,
            table,
            supervisor,
        }
    }

    /// Sends the control burst and then all data frames, moving the session through
    ///  `START_TX` and `SEND_DATA` to `COMPLETE`. A send error fails the session and is returned.
    pub async fn run_upload(&self, session_id: u32, server: SocketAddr, params: TestParams) -> anyhow::Result<()> {
        let result = self.do_run_upload(session_id, server, params).await;
        self.table.finish(session_id, result.is_ok()).await;
        result
    }

    async fn do_run_upload(&self, session_id: u32, server: SocketAddr, params: TestParams) -> anyhow::Result<()> {
        let mut limiter = RateLimiter::new(params.rate)?;

        info!("session {}: sending {} control frames to {:?}", session_id, self.config.control_burst_len, server);
        let control = Frame::control(session_id, params.rate, params.total_packets, Direction::Upload);
        for _ in 0..self.config.control_burst_len {
            limiter.pace().await;
            self.socket.send_frame(server, control).await?;
            self.table.on_frame_sent(session_id, &control).await;
        }

        self.table.enter_data_phase(session_id).await;
        info!("session {}: sending {} data frames at {} packets/s", session_id, params.total_packets, params.rate);
        for sequence_number in 0..params.total_packets {
            let frame = Frame::data(session_id, sequence_number, params.rate, params.total_packets, Direction::Upload);
            limiter.pace().await;
            self.socket.send_frame(server, frame).await?;
            self.table.on_frame_sent(session_id, &frame).await;
        }

        info!("session {}: all frames sent", session_id);
        Ok(())
    }

    /// Sends download requests until the first data frame for the session was accepted, at
    ///  most `total_packets` of them. Running out of attempts fails the session with
    ///  [ProbeError::DownloadRequestFailed].
    pub async fn run_download_request(&self, session_id: u32, server: SocketAddr, params: TestParams) -> anyhow::Result<()> {
        let mut limiter = RateLimiter::new(params.rate)?;
        let request = Frame::control(session_id, params.rate, params.total_packets, Direction::Download);

        info!("session {}: requesting download of {} packets at {} packets/s from {:?}", session_id, params.total_packets, params.rate, server);
        for attempt in 0..params.total_packets {
            if self.table.accepted_count(session_id).await > 0 {
                debug!("session {}: server responded after {} requests", session_id, attempt);
                return Ok(());
            }
            limiter.pace().await;
            trace!("session {}: download request #{}", session_id, attempt);
            self.socket.send_frame(server, request).await?;
            self.table.on_frame_sent(session_id, &request).await;
        }

        // the reply to the last request gets one more period to arrive
        limiter.pace().await;
        if self.table.accepted_count(session_id).await > 0 {
            debug!("session {}: server responded to the last request", session_id);
            return Ok(());
        }

        warn!("session {}: no response to {} download requests - giving up", session_id, params.total_packets);
        self.table.finish(session_id, false).await;
        Err(ProbeError::DownloadRequestFailed { session_id }.into())
    }

    /// Starts serving a requested download, unless that happened before. Returns `true` if
    ///  this call spawned the send loop.
    pub async fn start_download_serve(&self, session_id: u32) -> bool {
        if self.supervisor.is_stopping() {
            debug!("session {}: shutting down - not serving", session_id);
            return false;
        }

        let Some(params) = self.table.try_begin_serving(session_id).await else {
            return false;
        };

        if params.rate == 0 {
            warn!("session {}: download requested with a rate of 0 - not serving", session_id);
            self.table.finish(session_id, false).await;
            return false;
        }

        info!("session {}: serving {} packets at {} packets/s to {:?}", session_id, params.total_packets, params.rate, params.remote);
        self.supervisor.spawn(
            format!("serve-{}", session_id),
            serve_download(self.socket.clone(), self.table.clone(), self.supervisor.stop_signal(), session_id, params),
        ).await;
        true
    }
}

/// Failures are local to the session: they are logged and fail the session, but they do not
///  concern the rest of the endpoint.
async fn serve_download(socket: Arc<dyn SendSocket>, table: Arc<SessionTable>, mut stop: StopSignal, session_id: u32, params: ServeParams) -> anyhow::Result<()> {
    let mut limiter = match RateLimiter::new(params.rate) {
        Ok(limiter) => limiter,
        Err(e) => {
            warn!("{}", e);
            table.finish(session_id, false).await;
            return Ok(());
        }
    };

    for sequence_number in 0..params.total_packets {
        select! {
            _ = stop.stopped() => {
                debug!("stopped after {} frames", sequence_number);
                return Ok(());
            }
            _ = limiter.pace() => {}
        }

        let frame = Frame::data(session_id, sequence_number, params.rate, params.total_packets, params.direction);
        if let Err(e) = socket.send_frame(params.remote, frame).await {
            warn!("sending to {:?} failed - giving up on session {}: {:#}", params.remote, session_id, e);
            table.finish(session_id, false).await;
            return Ok(());
        }
        if !table.on_frame_sent(session_id, &frame).await {
            debug!("session {} was evicted - stopping", session_id);
            return Ok(());
        }
    }

    table.finish(session_id, true).await;
    info!("session {}: all {} frames sent", session_id, params.total_packets);
    Ok(())
}
