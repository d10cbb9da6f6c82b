use thiserror::Error;

/// The error kinds that callers need to tell apart. Everything else travels as a plain
///  `anyhow::Error`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("frame of {len} bytes is shorter than the fixed frame length")]
    FrameTooShort { len: usize },

    #[error("packet rate must be at least 1 packet per second")]
    InvalidRate,

    #[error("sender download failed: no server response for session {session_id}")]
    DownloadRequestFailed { session_id: u32 },

    #[error("session {session_id} was interrupted")]
    Interrupted { session_id: u32 },

    #[error("session {session_id} is unknown or was evicted")]
    UnknownOrDyingSession { session_id: u32 },
}
