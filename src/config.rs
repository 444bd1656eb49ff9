use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::GpuDesc;

/// How the master treats running jobs announced by agent heartbeats that it
/// has no record of (typically after a master restart).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrphanPolicy {
    /// Leave the job running on the agent; it is simply not tracked.
    #[default]
    Adopt,
    /// Tell the agent to kill it.
    Kill,
}

impl std::str::FromStr for OrphanPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "adopt" => Ok(OrphanPolicy::Adopt),
            "kill" => Ok(OrphanPolicy::Kill),
            other => Err(format!("unknown orphan policy: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub listen_addr: SocketAddr,
    /// Heartbeat silence after which a node is degraded.
    pub heartbeat_timeout: Duration,
    /// Further silence after which a degraded node is offline.
    pub offline_timeout: Duration,
    /// Liveness sweep tick, also the scheduler's fallback wake-up.
    pub sweep_interval: Duration,
    /// How long a cancel waits for the agent's exit report before the job is
    /// force-retired.
    pub cancel_grace: Duration,
    pub start_rpc_timeout: Duration,
    /// Placement attempts per job before it fails for good.
    pub retry_budget: u32,
    /// Byte cap of the per-job output ring kept for late attaches.
    pub ring_capacity: usize,
    /// Terminal jobs kept around for `queue`/`cancel`/`attach` history.
    pub terminal_jobs_kept: usize,
    /// MASTER_PORT handed to torch-distributed jobs.
    pub torch_master_port: u16,
    pub orphan_policy: OrphanPolicy,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".parse().unwrap(),
            heartbeat_timeout: Duration::from_secs(30),
            offline_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(1),
            cancel_grace: Duration::from_secs(10),
            start_rpc_timeout: Duration::from_secs(10),
            retry_budget: 5,
            ring_capacity: 1024 * 1024,
            terminal_jobs_kept: 1000,
            torch_master_port: 29500,
            orphan_policy: OrphanPolicy::Adopt,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub node_id: String,
    /// `host:port` of the master.
    pub master_addr: String,
    pub listen_addr: SocketAddr,
    /// Hostname the master should dial back; defaults to the local hostname.
    pub advertise_host: String,
    pub heartbeat_interval: Duration,
    /// SIGTERM-to-SIGKILL escalation window on cancel.
    pub cancel_grace: Duration,
    /// Backoff between redial attempts of a dropped output stream.
    pub stream_retry: Duration,
    /// Fake GPU inventory for CPU-only clusters and tests; `None` means
    /// detect via nvidia-smi.
    pub gpu_override: Option<Vec<GpuDesc>>,
}

impl AgentConfig {
    pub fn new(node_id: impl Into<String>, master_addr: impl Into<String>, listen_addr: SocketAddr) -> Self {
        Self {
            node_id: node_id.into(),
            master_addr: master_addr.into(),
            listen_addr,
            advertise_host: "127.0.0.1".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            cancel_grace: Duration::from_secs(10),
            stream_retry: Duration::from_secs(2),
            gpu_override: None,
        }
    }
}

/// Client-side timeouts. Every one of them is unbounded unless set; long
/// training jobs must not be aborted by the client.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientTimeouts {
    /// Whole attach lifetime.
    pub session: Option<Duration>,
    /// TCP connect.
    pub connect: Option<Duration>,
    /// Per-read wait.
    pub read: Option<Duration>,
    /// Read retries before giving up.
    pub max_consecutive_timeouts: Option<u32>,
}
