//! Wire protocol shared by master, agents, and clients.
//!
//! Every message is one UTF-8 JSON object terminated by `\n`, tagged with a
//! `type` field. Output chunks carry their payload base64-encoded so binary
//! child output survives the JSON framing. Each logical exchange runs on its
//! own TCP connection, except the agent's register/heartbeat session and the
//! per-job output streams, which stay open.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MgpuError, Result};
use crate::job::{DistributedKind, JobSpec, JobStatus, Placement};

/// Upper bound on the child-output payload of a single `out` message.
pub const MAX_CHUNK: usize = 64 * 1024;

/// Hard cap on a single wire line; longer lines are a protocol violation.
pub const MAX_LINE: usize = 4 * 1024 * 1024;

/// Where the master dials an agent for commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuDesc {
    pub index: u32,
    pub model: String,
    pub memory_mb: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Degraded,
    Offline,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Online => write!(f, "online"),
            NodeStatus::Degraded => write!(f, "degraded"),
            NodeStatus::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Environment the agent injects for multi-process launchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedEnv {
    pub kind: DistributedKind,
    pub rank: u32,
    pub world_size: u32,
    pub master_host: String,
    pub master_port: u16,
}

/// Client-facing view of one job in a `snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub id: String,
    pub owner: String,
    pub command: String,
    pub status: JobStatus,
    pub gpus: usize,
    pub priority: i32,
    pub submitted_at: DateTime<Utc>,
    pub assignment: Vec<Placement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Client-facing view of one node in a `snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeView {
    pub node_id: String,
    pub status: NodeStatus,
    pub total_gpus: usize,
    pub free_gpus: Vec<u32>,
    pub failure_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    // agent -> master
    Register {
        node_id: String,
        address: Address,
        gpus: Vec<GpuDesc>,
    },
    Heartbeat {
        node_id: String,
        free_gpus: Vec<u32>,
        running: Vec<String>,
        ts: i64,
    },
    Resources {
        gpus: Vec<GpuDesc>,
        free_gpus: Vec<u32>,
    },
    Out {
        job_id: String,
        stream: StreamKind,
        data: String,
    },
    Exit {
        job_id: String,
        code: Option<i32>,
        signal: Option<i32>,
    },

    // master -> agent
    QueryResources,
    Start {
        job_id: String,
        command: String,
        assigned_gpus: Vec<u32>,
        #[serde(default)]
        env_extras: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        distributed: Option<DistributedEnv>,
    },
    Cancel {
        job_id: String,
    },

    // client -> master
    Submit {
        spec: JobSpec,
    },
    Queue,
    Attach {
        job_id: String,
    },

    // responses
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prior_status: Option<JobStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    Error {
        code: String,
        reason: String,
    },
    Snapshot {
        jobs: Vec<JobView>,
        nodes: Vec<NodeView>,
    },
}

impl Message {
    pub fn ack() -> Self {
        Message::Ack {
            job_id: None,
            prior_status: None,
            pid: None,
        }
    }

    pub fn error(code: &str, reason: impl Into<String>) -> Self {
        Message::Error {
            code: code.to_string(),
            reason: reason.into(),
        }
    }
}

/// Wire error codes surfaced to clients.
pub mod codes {
    pub const INVALID_SPEC: &str = "invalid-spec";
    pub const UNKNOWN_JOB: &str = "unknown-job";
    pub const UNSATISFIABLE: &str = "resource-unsatisfiable-forever";
    pub const NO_HISTORY: &str = "not-running-and-no-history";
    pub const BAD_MESSAGE: &str = "bad-message";
    pub const INTERNAL: &str = "internal";
}

/// Write one message as a `\n`-terminated JSON line.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message. Returns `None` on a clean EOF at a line boundary.
pub async fn read_message<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if n > MAX_LINE {
        return Err(MgpuError::Protocol(format!("wire line of {n} bytes")));
    }
    let msg = serde_json::from_str(line.trim_end())
        .map_err(|e| MgpuError::Protocol(format!("malformed message: {e}")))?;
    Ok(Some(msg))
}

pub fn encode_chunk(data: &[u8]) -> String {
    BASE64.encode(data)
}

pub fn decode_chunk(data: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(data)
        .map_err(|e| MgpuError::Protocol(format!("bad chunk encoding: {e}")))
}

/// Map an error to the `{code, reason}` pair of a wire `error` message.
pub fn error_reply(err: &MgpuError) -> Message {
    let code = match err {
        MgpuError::InvalidSpec(_) => codes::INVALID_SPEC,
        MgpuError::UnknownJob(_) => codes::UNKNOWN_JOB,
        MgpuError::Unsatisfiable(_) => codes::UNSATISFIABLE,
        MgpuError::Protocol(_) => codes::BAD_MESSAGE,
        _ => codes::INTERNAL,
    };
    Message::error(code, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_kebab_case_tags() {
        let json = serde_json::to_string(&Message::QueryResources).unwrap();
        assert_eq!(json, r#"{"type":"query-resources"}"#);

        let json = serde_json::to_string(&Message::Cancel {
            job_id: "ab12cd34".to_string(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"cancel""#));
    }

    #[test]
    fn out_chunks_round_trip_binary_data() {
        let payload = vec![0u8, 159, 146, 150, b'\n'];
        let msg = Message::Out {
            job_id: "ab12cd34".to_string(),
            stream: StreamKind::Stdout,
            data: encode_chunk(&payload),
        };
        let json = serde_json::to_string(&msg).unwrap();
        match serde_json::from_str(&json).unwrap() {
            Message::Out { data, stream, .. } => {
                assert_eq!(stream, StreamKind::Stdout);
                assert_eq!(decode_chunk(&data).unwrap(), payload);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = serde_json::from_str::<Message>(r#"{"type":"warp-speed"}"#);
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn framing_round_trip() {
        let (mut w, server) = tokio::io::duplex(1024);
        let mut r = tokio::io::BufReader::new(server);
        write_message(
            &mut w,
            &Message::Attach {
                job_id: "deadbeef".to_string(),
            },
        )
        .await
        .unwrap();
        drop(w);

        match read_message(&mut r).await.unwrap() {
            Some(Message::Attach { job_id }) => assert_eq!(job_id, "deadbeef"),
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(read_message(&mut r).await.unwrap().is_none());
    }
}
