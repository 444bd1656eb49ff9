use thiserror::Error;

#[derive(Error, Debug)]
pub enum MgpuError {
    #[error("invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("request can never be satisfied: {0}")]
    Unsatisfiable(String),

    #[error("node unavailable: {0}")]
    NodeUnavailable(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("remote error [{code}]: {reason}")]
    Remote { code: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, MgpuError>;
