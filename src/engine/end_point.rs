use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::collaborators::capture::{CaptureController, NoCapture};
use crate::collaborators::id_allocator::IdAllocator;
use crate::collaborators::metrics_sink::MetricsSink;
use crate::config::{ProbeConfig, TestParams};
use crate::engine::reception::{ReceptionEngine, Role};
use crate::engine::supervisor::{StopSignal, Supervisor};
use crate::engine::transmission::TransmissionEngine;
use crate::error::ProbeError;
use crate::protocol::frame::Direction;
use crate::session::lifecycle::SessionState;
use crate::session::session_record::SessionRecord;
use crate::session::session_table::SessionTable;

/// The parts shared by both roles: one socket, the session table, the engines, and the
///  background loops (receive, sweep, snapshot) running under a supervisor.
struct EndPoint {
    local_addr: SocketAddr,
    table: Arc<SessionTable>,
    transmission: Arc<TransmissionEngine>,
    supervisor: Arc<Supervisor>,
    sink: Arc<dyn MetricsSink>,
}

impl EndPoint {
    async fn start(config: ProbeConfig, role: Role, sink: Arc<dyn MetricsSink>, capture: Arc<dyn CaptureController>) -> anyhow::Result<EndPoint> {
        config.validate()?;
        let config = Arc::new(config);

        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        let local_addr = socket.local_addr()?;
        info!("bound UDP socket to {:?}", local_addr);

        let supervisor = Arc::new(Supervisor::new());
        let table = Arc::new(SessionTable::new(config.clone(), capture, local_addr.port()));
        let transmission = Arc::new(TransmissionEngine::new(config.clone(), Arc::new(socket.clone()), table.clone(), supervisor.clone()));
        let reception = ReceptionEngine::new(role, table.clone(), transmission.clone(), config.max_datagram_len);

        let stop = supervisor.stop_signal();
        supervisor.spawn("receive", async move {
            reception.recv_loop(socket, stop).await
        }).await;
        supervisor.spawn("sweep", sweep_loop(config.clone(), table.clone(), supervisor.stop_signal())).await;
        supervisor.spawn("snapshot", snapshot_loop(config.clone(), table.clone(), sink.clone(), supervisor.stop_signal())).await;

        Ok(EndPoint {
            local_addr,
            table,
            transmission,
            supervisor,
            sink,
        })
    }

    /// Joins all tasks, then hands the final state of all sessions to the metrics sink
    async fn stop(&self) -> anyhow::Result<()> {
        self.supervisor.stop_and_join().await;
        self.sink.persist(&self.table.snapshot().await).await
    }
}

async fn sweep_loop(config: Arc<ProbeConfig>, table: Arc<SessionTable>, mut stop: StopSignal) -> anyhow::Result<()> {
    let mut ticks = interval(config.sweep_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = stop.stopped() => return Ok(()),
            _ = ticks.tick() => {
                let evicted = table.sweep().await;
                if !evicted.is_empty() {
                    info!("evicted idle sessions {:?}", evicted);
                }
            }
        }
    }
}

/// A failing sink does not corrupt any measurement, so it is not a fault: we keep measuring
///  and try again with the next snapshot.
async fn snapshot_loop(config: Arc<ProbeConfig>, table: Arc<SessionTable>, sink: Arc<dyn MetricsSink>, mut stop: StopSignal) -> anyhow::Result<()> {
    let mut ticks = interval(config.snapshot_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately, and there is nothing to save yet
    ticks.tick().await;

    loop {
        select! {
            _ = stop.stopped() => return Ok(()),
            _ = ticks.tick() => {
                let snapshot = table.snapshot().await;
                debug!("saving snapshot of {} sessions", snapshot.len());
                if let Err(e) = sink.persist(&snapshot).await {
                    warn!("error saving snapshot: {:#}", e);
                }
            }
        }
    }
}

/// The server side: serves any number of concurrent upload and download sessions until it is
///  stopped.
pub struct Responder {
    end_point: EndPoint,
    capture: Arc<dyn CaptureController>,
}

impl Responder {
    pub async fn start(config: ProbeConfig, sink: Arc<dyn MetricsSink>, capture: Arc<dyn CaptureController>) -> anyhow::Result<Responder> {
        let end_point = EndPoint::start(config, Role::Responder, sink, capture.clone()).await?;
        info!("responder listening on {:?}", end_point.local_addr);
        Ok(Responder {
            end_point,
            capture,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.end_point.local_addr
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.end_point.table
    }

    pub async fn stop(self) -> anyhow::Result<()> {
        let result = self.end_point.stop().await;
        self.capture.shut_down().await;
        result
    }
}

/// The outcome of a single test run, from the requester's point of view
#[derive(Clone, Debug)]
pub struct RunReport {
    pub session_id: u32,
    pub direction: Direction,
    pub state: SessionState,
    pub record: SessionRecord,
    /// data frames that never arrived - only meaningful for downloads, and `None` if the
    ///  session was evicted before it ended
    pub missing_ranges: Option<Vec<(u32, u32)>>,
}

/// The client side: runs exactly one session against a responder
pub struct Requester;

impl Requester {
    pub async fn run(config: ProbeConfig, server: SocketAddr, params: TestParams, allocator: &mut dyn IdAllocator, sink: Arc<dyn MetricsSink>) -> anyhow::Result<RunReport> {
        Self::run_until(config, server, params, allocator, sink, std::future::pending()).await
    }

    /// Like [Requester::run], but gives up on the session when `interrupt` completes. The
    ///  endpoint is still stopped and its final snapshot saved, and the result is
    ///  [ProbeError::Interrupted].
    pub async fn run_until<F>(config: ProbeConfig, server: SocketAddr, params: TestParams, allocator: &mut dyn IdAllocator, sink: Arc<dyn MetricsSink>, interrupt: F) -> anyhow::Result<RunReport>
    where F: Future<Output = ()> + Send
    {
        let session_id = allocator.allocate()?;
        let end_point = EndPoint::start(config, Role::Requester { session_id }, sink, Arc::new(NoCapture)).await?;

        end_point.table.register_local(session_id, server, params.rate, params.total_packets, params.direction).await;
        let outcome = select! {
            outcome = Self::run_session(&end_point, session_id, server, params) => outcome,
            _ = interrupt => {
                warn!("session {} interrupted", session_id);
                Err(ProbeError::Interrupted { session_id }.into())
            }
        };

        // the endpoint is stopped whatever the outcome, and its final snapshot saved
        let stopped = end_point.stop().await;
        let state = outcome?;
        stopped?;

        let record = end_point.table.record(session_id).await
            .ok_or(ProbeError::UnknownOrDyingSession { session_id })?;
        let missing_ranges = end_point.table.missing_ranges(session_id).await;
        info!("session {} ended in state {:?}: {} received, {} duplicates, {} sent", session_id, state, record.count, record.duplicates, record.sent);

        Ok(RunReport {
            session_id,
            direction: params.direction,
            state,
            record,
            missing_ranges,
        })
    }

    async fn run_session(end_point: &EndPoint, session_id: u32, server: SocketAddr, params: TestParams) -> anyhow::Result<SessionState> {
        match params.direction {
            Direction::Upload => {
                end_point.transmission.run_upload(session_id, server, params).await?;
                Ok(SessionState::Complete)
            }
            Direction::Download => {
                end_point.transmission.run_download_request(session_id, server, params).await?;
                Ok(end_point.table.wait_for_outcome(session_id).await?)
            }
        }
    }
}
