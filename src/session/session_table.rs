use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::select;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace};

use crate::collaborators::capture::CaptureController;
use crate::config::ProbeConfig;
use crate::error::ProbeError;
use crate::protocol::frame::{Direction, Frame, SENTINEL_SEQUENCE_NUMBER};
use crate::session::lifecycle::{Lifecycle, LifecycleStatus, SessionState};
use crate::session::sequence_tracker::SequenceTracker;
use crate::session::session_record::SessionRecord;

/// The result of counting a packet against its session
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketCount {
    /// sentinel sequence number - not data, nothing was counted
    Control,
    Fresh { completed: bool },
    Duplicate { occurrences: u32 },
    /// data sequence number at or beyond the session's `total_packets` - dropped, nothing was
    ///  counted
    OutOfRange,
}

/// What a responder needs to serve a download
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ServeParams {
    pub remote: SocketAddr,
    pub rate: u32,
    pub total_packets: u32,
    pub direction: Direction,
}

struct SessionEntry {
    record: SessionRecord,
    /// `None` before the first data frame and after eviction
    tracker: Option<SequenceTracker>,
    lifecycle: Lifecycle,
    last_activity: Instant,
    serving: bool,
    status_sender: watch::Sender<LifecycleStatus>,
}
impl SessionEntry {
    fn new(timeout_multiplier: f64, now: Instant) -> SessionEntry {
        let lifecycle = Lifecycle::new(timeout_multiplier);
        let (status_sender, _) = watch::channel(lifecycle.status());
        SessionEntry {
            record: SessionRecord::default(),
            tracker: None,
            lifecycle,
            last_activity: now,
            serving: false,
            status_sender,
        }
    }

    fn is_dying(&self) -> bool {
        self.record.dying
    }

    fn last_activity(&self) -> Instant {
        match &self.tracker {
            Some(tracker) => self.last_activity.max(tracker.last_activity()),
            None => self.last_activity,
        }
    }

    /// to be called after every lifecycle transition, keeping the record and waiters in sync
    fn publish(&mut self, changed: bool) {
        if changed {
            self.record.state = self.lifecycle.state();
            self.status_sender.send_replace(self.lifecycle.status());
        }
    }
}

/// The registry of all sessions known to an endpoint, shared by the receive loop, the send
///  loops and the sweep.
///
/// Locking is two-level: the map is behind a `RwLock` that is write-locked only to insert a
///  new session, and each session has its own `Mutex`. All reads and writes of a session's
///  tracker and record happen under that session's lock, so eviction and counting for the same
///  id are serialized while unrelated sessions do not contend.
///
/// Evicted sessions stay in the map with `dying == true`: their id can never be re-used for a
///  fresh session, and they keep showing up in snapshots.
pub struct SessionTable {
    config: Arc<ProbeConfig>,
    sessions: RwLock<FxHashMap<u32, Arc<Mutex<SessionEntry>>>>,
    capture: Arc<dyn CaptureController>,
    local_port: u16,
}

impl SessionTable {
    pub fn new(config: Arc<ProbeConfig>, capture: Arc<dyn CaptureController>, local_port: u16) -> SessionTable {
        SessionTable {
            config,
            sessions: Default::default(),
            capture,
            local_port,
        }
    }

    async fn get(&self, session_id: u32) -> Option<Arc<Mutex<SessionEntry>>> {
        self.sessions.read().await
            .get(&session_id)
            .cloned()
    }

    /// Returns the entry and whether it was created by this call. Exactly one entry is created
    ///  per id, even with concurrent callers.
    async fn get_or_create(&self, session_id: u32) -> (Arc<Mutex<SessionEntry>>, bool) {
        // trying with a read lock first is an optimization for the common case
        if let Some(entry) = self.get(session_id).await {
            return (entry, false);
        }

        let mut sessions = self.sessions.write().await;
        // check again now that we have the exclusive lock to avoid racy initialization
        if let Some(entry) = sessions.get(&session_id) {
            return (entry.clone(), false);
        }

        debug!("new session {}", session_id);
        let entry = Arc::new(Mutex::new(SessionEntry::new(self.config.timeout_multiplier, Instant::now())));
        sessions.insert(session_id, entry.clone());
        (entry, true)
    }

    pub async fn is_dying(&self, session_id: u32) -> bool {
        match self.get(session_id).await {
            Some(entry) => entry.lock().await.is_dying(),
            None => false,
        }
    }

    /// Registers a received frame's session parameters, creating the session if necessary.
    ///  Fails for dying sessions.
    pub async fn observe_frame(&self, frame: &Frame, from: SocketAddr) -> Result<(), ProbeError> {
        let session_id = frame.session_id;
        let (entry, created) = self.get_or_create(session_id).await;
        {
            let mut entry = entry.lock().await;
            if entry.is_dying() {
                return Err(ProbeError::UnknownOrDyingSession { session_id });
            }
            entry.record.on_frame(frame, from, SystemTime::now());
            entry.last_activity = Instant::now();
        }

        if created {
            self.capture.on_session_first_seen(session_id, from, self.local_port).await;
        }
        Ok(())
    }

    /// Makes sure the session has a sequence tracker, creating session and tracker as needed.
    ///  Fails for dying sessions: an evicted session's tracker is never replaced.
    pub async fn get_or_create_tracker(&self, session_id: u32) -> Result<(), ProbeError> {
        let (entry, _) = self.get_or_create(session_id).await;
        let mut entry = entry.lock().await;
        if entry.is_dying() {
            return Err(ProbeError::UnknownOrDyingSession { session_id });
        }
        if entry.tracker.is_none() {
            entry.tracker = Some(SequenceTracker::new(Instant::now()));
        }
        Ok(())
    }

    /// Counts a data frame against its session's tracker and updates the session's tallies and
    ///  lifecycle - all under the session's lock, so a concurrent eviction sees either all or
    ///  nothing of it.
    pub async fn count_packet(&self, session_id: u32, sequence_number: u32) -> Result<PacketCount, ProbeError> {
        let (entry, _) = self.get_or_create(session_id).await;
        let mut entry = entry.lock().await;
        if entry.is_dying() {
            return Err(ProbeError::UnknownOrDyingSession { session_id });
        }

        if sequence_number != SENTINEL_SEQUENCE_NUMBER && sequence_number >= entry.record.total_packets {
            debug!("session {}: sequence number {} is outside of [0, {}) - dropping", session_id, sequence_number, entry.record.total_packets);
            return Ok(PacketCount::OutOfRange);
        }

        let now = Instant::now();
        let occurrences = entry.tracker
            .get_or_insert_with(|| SequenceTracker::new(now))
            .count_packet(sequence_number, now);

        let result = match occurrences {
            SENTINEL_SEQUENCE_NUMBER => return Ok(PacketCount::Control),
            1 => {
                entry.record.count += 1;
                PacketCount::Fresh { completed: false }
            }
            n => {
                entry.record.duplicates += 1;
                PacketCount::Duplicate { occurrences: n }
            }
        };

        let (accepted, total_packets, rate) = (entry.record.count, entry.record.total_packets, entry.record.packet_rate);
        let changed = entry.lifecycle.on_data_frame(accepted, total_packets, rate, now);
        entry.publish(changed);

        if let PacketCount::Fresh { .. } = result {
            if changed && entry.lifecycle.state() == SessionState::Complete {
                info!("session {} complete: {} packets, {} duplicates", session_id, accepted, entry.record.duplicates);
                return Ok(PacketCount::Fresh { completed: true });
            }
        }
        Ok(result)
    }

    /// Evicts all sessions that were idle for longer than the session timeout, returning their
    ///  ids. Also drives the soft receive timeout of sessions that nobody waits on.
    pub async fn sweep(&self) -> Vec<u32> {
        let now = Instant::now();
        let entries = self.sessions.read().await
            .iter()
            .map(|(&id, entry)| (id, entry.clone()))
            .collect::<Vec<_>>();

        let mut evicted = Vec::new();
        for (session_id, entry) in entries {
            let mut entry = entry.lock().await;
            if entry.is_dying() {
                continue;
            }

            let timed_out = entry.lifecycle.check_timeout(now);
            if timed_out {
                info!("session {} timed out: {} of {} packets", session_id, entry.record.count, entry.record.total_packets);
            }
            entry.publish(timed_out);

            if now.saturating_duration_since(entry.last_activity()) > self.config.session_timeout {
                debug!("evicting idle session {}", session_id);
                entry.tracker = None;
                entry.record.dying = true;
                evicted.push(session_id);
            }
        }

        for &session_id in &evicted {
            self.capture.on_session_evicted(session_id).await;
        }
        evicted
    }

    /// Atomically claims the right to serve a download session. Returns `Some` exactly once per
    ///  session, and never for a dying one.
    pub async fn try_begin_serving(&self, session_id: u32) -> Option<ServeParams> {
        let entry = self.get(session_id).await?;
        let mut entry = entry.lock().await;
        if entry.is_dying() || entry.serving {
            trace!("session {} is already being served", session_id);
            return None;
        }
        let remote = entry.record.remote?;

        entry.serving = true;
        let changed = entry.lifecycle.enter_data_phase();
        entry.publish(changed);

        Some(ServeParams {
            remote,
            rate: entry.record.packet_rate,
            total_packets: entry.record.total_packets,
            direction: entry.record.direction,
        })
    }

    /// Bookkeeping for a frame sent for a session. Returns `false` if the session was evicted
    ///  in the meantime, and sending should stop.
    pub async fn on_frame_sent(&self, session_id: u32, frame: &Frame) -> bool {
        let Some(entry) = self.get(session_id).await else {
            return false;
        };
        let mut entry = entry.lock().await;
        if entry.is_dying() {
            return false;
        }
        if !frame.is_control() {
            entry.record.sent += 1;
        }
        entry.last_activity = Instant::now();
        true
    }

    /// Sender side: the control phase is done, data frames follow
    pub async fn enter_data_phase(&self, session_id: u32) {
        if let Some(entry) = self.get(session_id).await {
            let mut entry = entry.lock().await;
            let changed = entry.lifecycle.enter_data_phase();
            entry.publish(changed);
        }
    }

    /// Sender side: moves the session to `COMPLETE` or `FAILED` unless it is terminal already
    pub async fn finish(&self, session_id: u32, success: bool) {
        if let Some(entry) = self.get(session_id).await {
            let mut entry = entry.lock().await;
            let changed = if success {
                entry.lifecycle.complete()
            }
            else {
                entry.lifecycle.fail()
            };
            entry.publish(changed);
        }
    }

    /// Registers a session that this side initiates, before any frame was exchanged
    pub async fn register_local(&self, session_id: u32, remote: SocketAddr, rate: u32, total_packets: u32, direction: Direction) {
        let (entry, _) = self.get_or_create(session_id).await;
        let mut entry = entry.lock().await;
        entry.record.remote = Some(remote);
        entry.record.packet_rate = rate;
        entry.record.total_packets = total_packets;
        entry.record.direction = direction;
        entry.last_activity = Instant::now();
    }

    pub async fn accepted_count(&self, session_id: u32) -> u64 {
        match self.get(session_id).await {
            Some(entry) => entry.lock().await.record.count,
            None => 0,
        }
    }

    pub async fn record(&self, session_id: u32) -> Option<SessionRecord> {
        let entry = self.get(session_id).await?;
        let record = entry.lock().await.record.clone();
        Some(record)
    }

    pub async fn snapshot(&self) -> BTreeMap<u32, SessionRecord> {
        let entries = self.sessions.read().await
            .iter()
            .map(|(&id, entry)| (id, entry.clone()))
            .collect::<Vec<_>>();

        let mut result = BTreeMap::new();
        for (id, entry) in entries {
            result.insert(id, entry.lock().await.record.clone());
        }
        result
    }

    /// The data sequence numbers not (yet) received for a session, as inclusive ranges. `None`
    ///  for unknown or evicted sessions.
    pub async fn missing_ranges(&self, session_id: u32) -> Option<Vec<(u32, u32)>> {
        let entry = self.get(session_id).await?;
        let entry = entry.lock().await;
        if entry.is_dying() {
            return None;
        }

        let total_packets = entry.record.total_packets;
        match &entry.tracker {
            Some(tracker) => Some(tracker.missing_ranges(total_packets)),
            None => Some(SequenceTracker::new(Instant::now()).missing_ranges(total_packets)),
        }
    }

    /// Waits until the session reaches a terminal state, firing its receive timeout if it was
    ///  armed and expires first.
    pub async fn wait_for_outcome(&self, session_id: u32) -> Result<SessionState, ProbeError> {
        let entry = self.get(session_id).await
            .ok_or(ProbeError::UnknownOrDyingSession { session_id })?;
        let mut status = entry.lock().await.status_sender.subscribe();

        loop {
            let current = *status.borrow_and_update();
            if current.state.is_terminal() {
                return Ok(current.state);
            }

            let timeout = async {
                match current.timeout_deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        return Err(ProbeError::UnknownOrDyingSession { session_id });
                    }
                }
                _ = timeout => {
                    let mut entry = entry.lock().await;
                    let timed_out = entry.lifecycle.check_timeout(Instant::now());
                    if timed_out {
                        info!("session {} timed out: {} of {} packets", session_id, entry.record.count, entry.record.total_packets);
                    }
                    entry.publish(timed_out);
                }
            }
        }
    }
}
