use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::session::session_record::SessionRecord;

pub type Snapshot = BTreeMap<u32, SessionRecord>;

/// Receives read-only snapshots of all session records, periodically and once at shutdown
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetricsSink: Send + Sync + 'static {
    async fn persist(&self, snapshot: &Snapshot) -> anyhow::Result<()>;
}

/// Writes each snapshot as pretty-printed JSON, replacing the previous one. The file name
///  carries the time the sink was created, so consecutive runs do not overwrite each other.
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl AsRef<Path>, role: &str) -> anyhow::Result<JsonFileSink> {
        std::fs::create_dir_all(dir.as_ref())?;
        let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S");
        Ok(JsonFileSink {
            path: dir.as_ref().join(format!("{}_{}.json", timestamp, role)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MetricsSink for JsonFileSink {
    async fn persist(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(snapshot)?;
        tokio::fs::write(&self.path, json).await?;
        info!("saved session records to {:?}", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::Direction;

    #[tokio::test]
    async fn test_json_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonFileSink::new(dir.path().join("data"), "server").unwrap();

        let file_name = sink.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.ends_with("_server.json"));
        assert_eq!(file_name.len(), "YYYYmmddHHMMSS_server.json".len());

        let mut snapshot = Snapshot::new();
        snapshot.insert(42, SessionRecord {
            count: 3,
            total_packets: 4,
            direction: Direction::Upload,
            ..SessionRecord::default()
        });
        sink.persist(&snapshot).await.unwrap();
        snapshot.get_mut(&42).unwrap().count = 4;
        sink.persist(&snapshot).await.unwrap();

        let written: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(sink.path()).unwrap()).unwrap();
        assert_eq!(written["42"]["count"], 4);
        assert_eq!(written["42"]["total_packets"], 4);
        assert_eq!(written["42"]["direction"], 0);
        assert_eq!(written["42"]["state"], "START_TX");
    }
}
