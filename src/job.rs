use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MgpuError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Queued,
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses are never left again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Cancelling => write!(f, "cancelling"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DistributedKind {
    #[default]
    None,
    TorchDistributed,
    Mpi,
}

/// Explicit `node:gpu` placement supplied by the user. When present it
/// overrides the GPU count and fixes where the job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePin {
    pub node_id: String,
    pub gpu_ids: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub owner: String,
    pub command: String,
    #[serde(default)]
    pub gpus: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pins: Option<Vec<NodePin>>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub distributed: DistributedKind,
    /// Interactive jobs die with their client unless this is explicitly
    /// cleared. Ignored for non-interactive submissions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_on_detach: Option<bool>,
    /// Advisory per-GPU memory floor in MiB. Filtered against the GPU's
    /// total memory at placement time, never reserved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_mb: Option<u64>,
}

impl JobSpec {
    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(MgpuError::InvalidSpec("command is empty".to_string()));
        }
        match &self.pins {
            Some(pins) => {
                if pins.is_empty() {
                    return Err(MgpuError::InvalidSpec("pin list is empty".to_string()));
                }
                let mut seen = std::collections::HashSet::new();
                for pin in pins {
                    if pin.gpu_ids.is_empty() {
                        return Err(MgpuError::InvalidSpec(format!(
                            "pin for node {} names no GPUs",
                            pin.node_id
                        )));
                    }
                    if !seen.insert(&pin.node_id) {
                        return Err(MgpuError::InvalidSpec(format!(
                            "node {} pinned twice",
                            pin.node_id
                        )));
                    }
                    let mut gpus = std::collections::HashSet::new();
                    for gpu in &pin.gpu_ids {
                        if !gpus.insert(gpu) {
                            return Err(MgpuError::InvalidSpec(format!(
                                "GPU {} pinned twice on node {}",
                                gpu, pin.node_id
                            )));
                        }
                    }
                }
            }
            None => {
                if self.gpus == 0 {
                    return Err(MgpuError::InvalidSpec(
                        "a job must request at least one GPU or carry pins".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Total GPUs this spec asks for, whichever way it asks.
    pub fn gpu_count(&self) -> usize {
        match &self.pins {
            Some(pins) => pins.iter().map(|p| p.gpu_ids.len()).sum(),
            None => self.gpus as usize,
        }
    }
}

/// One node's share of a running job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub node_id: String,
    pub gpu_ids: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub spec: JobSpec,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    /// Monotonic submission counter, the FIFO tie-break within a priority.
    pub seq: u64,
    pub assignment: Vec<Placement>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub retry_count: u32,
    pub failure: Option<String>,
    /// Set when the job entered `running`; used to reconcile against agent
    /// heartbeats that no longer report the job.
    pub started_at: Option<std::time::Instant>,
}

impl Job {
    pub fn new(id: String, spec: JobSpec) -> Self {
        Self {
            id,
            spec,
            status: JobStatus::Queued,
            submitted_at: Utc::now(),
            seq: 0,
            assignment: Vec::new(),
            exit_code: None,
            signal: None,
            retry_count: 0,
            failure: None,
            started_at: None,
        }
    }
}

/// Allocate a fresh 8-hex-char job id that is not already in use.
pub fn new_job_id<F: Fn(&str) -> bool>(in_use: F) -> String {
    loop {
        let full = Uuid::new_v4().simple().to_string();
        let id = full[..8].to_string();
        if !in_use(&id) {
            return id;
        }
    }
}
