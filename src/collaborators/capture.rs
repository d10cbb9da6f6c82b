use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Receives notifications about the lifecycle of sessions on the responder side, e.g. to run a
///  packet capture per session. Implementations must not block the caller for long: these
///  callbacks are invoked from the receive loop and the sweep.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CaptureController: Send + Sync + 'static {
    async fn on_session_first_seen(&self, session_id: u32, remote: SocketAddr, local_port: u16);

    async fn on_session_evicted(&self, session_id: u32);

    /// called once when the endpoint stops
    async fn shut_down(&self) {}
}

pub struct NoCapture;

#[async_trait]
impl CaptureController for NoCapture {
    async fn on_session_first_seen(&self, _session_id: u32, _remote: SocketAddr, _local_port: u16) {}

    async fn on_session_evicted(&self, _session_id: u32) {}
}

/// Runs one `tcpdump` process per session, writing `<dir>/<session id>.pcap`
pub struct TcpdumpCapture {
    output_dir: PathBuf,
    running: Mutex<FxHashMap<u32, Child>>,
}

impl TcpdumpCapture {
    pub fn new(output_dir: PathBuf) -> anyhow::Result<TcpdumpCapture> {
        std::fs::create_dir_all(&output_dir)?;
        Ok(TcpdumpCapture {
            output_dir,
            running: Default::default(),
        })
    }

    fn command_for(&self, session_id: u32, remote: SocketAddr, local_port: u16) -> Command {
        let mut command = Command::new("tcpdump");
        command
            .arg("-i").arg("any")
            .arg("-w").arg(self.output_dir.join(format!("{}.pcap", session_id)))
            .arg(format!("udp and host {} and port {}", remote.ip(), local_port))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        command
    }

    async fn stop_capture(session_id: u32, mut child: Child) {
        debug!("stopping capture for session {}", session_id);
        if let Err(e) = child.kill().await {
            warn!("error stopping capture for session {}: {}", session_id, e);
        }
    }
}

#[async_trait]
impl CaptureController for TcpdumpCapture {
    async fn on_session_first_seen(&self, session_id: u32, remote: SocketAddr, local_port: u16) {
        let mut running = self.running.lock().await;
        if running.contains_key(&session_id) {
            return;
        }

        match self.command_for(session_id, remote, local_port).spawn() {
            Ok(child) => {
                info!("started capture for session {} from {:?}", session_id, remote);
                running.insert(session_id, child);
            }
            Err(e) => {
                warn!("could not start capture for session {}: {}", session_id, e);
            }
        }
    }

    async fn on_session_evicted(&self, session_id: u32) {
        let child = self.running.lock().await
            .remove(&session_id);
        if let Some(child) = child {
            Self::stop_capture(session_id, child).await;
        }
    }

    async fn shut_down(&self) {
        let all = std::mem::take(&mut *self.running.lock().await);
        for (session_id, child) in all {
            Self::stop_capture(session_id, child).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcpdump_command() {
        let dir = tempfile::tempdir().unwrap();
        let capture = TcpdumpCapture::new(dir.path().join("pcap")).unwrap();
        assert!(dir.path().join("pcap").is_dir());

        let command = capture.command_for(17, SocketAddr::from(([10, 0, 0, 2], 4000)), 12345);
        let command = command.as_std();
        assert_eq!(command.get_program(), "tcpdump");

        let args = command.get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect::<Vec<_>>();
        assert_eq!(args, vec![
            "-i".to_string(),
            "any".to_string(),
            "-w".to_string(),
            dir.path().join("pcap").join("17.pcap").to_string_lossy().to_string(),
            "udp and host 10.0.0.2 and port 12345".to_string(),
        ]);
    }

    #[tokio::test]
    async fn test_evicting_unknown_session_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let capture = TcpdumpCapture::new(dir.path().to_path_buf()).unwrap();
        capture.on_session_evicted(5).await;
        capture.shut_down().await;
    }
}
