//! Job execution and process-group supervision.
//!
//! Every job runs as `/bin/sh -c <command>` in its own process group so that
//! cancellation can signal the whole tree in one call. A supervisor task per
//! job forwards combined stdout/stderr to the master on a dedicated stream
//! connection and reports the exit exactly once.

use std::collections::{HashMap, HashSet};
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, BufWriter};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

use crate::config::AgentConfig;
use crate::error::{MgpuError, Result};
use crate::job::DistributedKind;
use crate::protocol::{self, DistributedEnv, Message, StreamKind, MAX_CHUNK};

use super::gpu;

/// Bookkeeping for one supervised job process.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub job_id: String,
    pub pgid: i32,
    pub gpu_ids: Vec<u32>,
    pub started_at: Instant,
}

pub type ProcessTable = Arc<Mutex<HashMap<String, ProcessRecord>>>;

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub job_id: String,
    pub command: String,
    pub gpu_ids: Vec<u32>,
    pub env_extras: HashMap<String, String>,
    pub distributed: Option<DistributedEnv>,
}

/// Spawns jobs and supervises their process groups.
#[derive(Clone)]
pub struct JobExecutor {
    node_id: String,
    master_addr: String,
    cancel_grace: Duration,
    stream_retry: Duration,
    table: ProcessTable,
}

impl JobExecutor {
    pub fn new(config: &AgentConfig, table: ProcessTable) -> Self {
        Self {
            node_id: config.node_id.clone(),
            master_addr: config.master_addr.clone(),
            cancel_grace: config.cancel_grace,
            stream_retry: config.stream_retry,
            table,
        }
    }

    /// Spawn the job in a fresh process group and hand it to a supervisor
    /// task. Returns the record (whose pgid doubles as the child pid).
    pub async fn start(&self, req: StartRequest) -> Result<ProcessRecord> {
        {
            let table = self.table.lock().await;
            if table.contains_key(&req.job_id) {
                return Err(MgpuError::Internal(format!(
                    "job {} is already running here",
                    req.job_id
                )));
            }
            let busy: HashSet<u32> = table
                .values()
                .flat_map(|r| r.gpu_ids.iter().copied())
                .collect();
            if let Some(gpu) = req.gpu_ids.iter().find(|g| busy.contains(g)) {
                return Err(MgpuError::NodeUnavailable(format!(
                    "GPU {gpu} is already allocated on this node"
                )));
            }
        }

        let script = format!("{}{}", banner(&req.job_id, &self.node_id), req.command);

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(&script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("CUDA_VISIBLE_DEVICES", gpu::visible_devices(&req.gpu_ids))
            .process_group(0);

        if let Some(dist) = &req.distributed {
            if dist.kind == DistributedKind::TorchDistributed {
                cmd.env("MASTER_ADDR", &dist.master_host)
                    .env("MASTER_PORT", dist.master_port.to_string())
                    .env("WORLD_SIZE", dist.world_size.to_string())
                    .env("RANK", dist.rank.to_string())
                    .env("LOCAL_RANK", "0");
            }
        }
        for (key, value) in &req.env_extras {
            cmd.env(key, value);
        }

        let child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| MgpuError::Internal("spawned child has no pid".to_string()))?
            as i32;

        // process_group(0) makes the child its own group leader, so pid == pgid
        let record = ProcessRecord {
            job_id: req.job_id.clone(),
            pgid: pid,
            gpu_ids: req.gpu_ids.clone(),
            started_at: Instant::now(),
        };
        self.table
            .lock()
            .await
            .insert(req.job_id.clone(), record.clone());

        tracing::info!(
            job_id = %req.job_id,
            pgid = pid,
            gpus = ?req.gpu_ids,
            "job started"
        );

        let this = self.clone();
        let job_id = req.job_id;
        tokio::spawn(async move {
            this.supervise(child, job_id).await;
        });

        Ok(record)
    }

    /// Signal the job's whole process group. Returns false for jobs this
    /// agent is not running (cancel is idempotent).
    pub async fn cancel(&self, job_id: &str) -> bool {
        let record = { self.table.lock().await.get(job_id).cloned() };
        let Some(record) = record else {
            return false;
        };

        tracing::info!(job_id, pgid = record.pgid, "cancel requested, sending SIGTERM to group");
        signal_group(record.pgid, Signal::SIGTERM);

        let table = self.table.clone();
        let grace = self.cancel_grace;
        let job = job_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if table.lock().await.contains_key(&job) {
                tracing::warn!(job_id = %job, pgid = record.pgid, "grace expired, escalating to SIGKILL");
                signal_group(record.pgid, Signal::SIGKILL);
            }
            sweep_process_group(record.pgid);
        });
        true
    }

    /// Forward child output to the master, then report the exit.
    async fn supervise(self, mut child: Child, job_id: String) {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (tx, mut rx) = mpsc::channel::<(StreamKind, Vec<u8>)>(64);
        if let Some(out) = stdout {
            tokio::spawn(pump(out, StreamKind::Stdout, tx.clone()));
        }
        if let Some(err) = stderr {
            tokio::spawn(pump(err, StreamKind::Stderr, tx.clone()));
        }
        drop(tx);

        let mut link = StreamLink::new(self.master_addr.clone(), self.stream_retry);
        while let Some((kind, data)) = rx.recv().await {
            link.send(&Message::Out {
                job_id: job_id.clone(),
                stream: kind,
                data: protocol::encode_chunk(&data),
            })
            .await;
        }

        let (code, sig) = match child.wait().await {
            Ok(status) => (status.code(), status.signal()),
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "wait on child failed");
                (None, None)
            }
        };

        // remove before reporting so a concurrent cancel's escalation task
        // sees the job as gone and does not SIGKILL a recycled pgid
        self.table.lock().await.remove(&job_id);

        tracing::info!(job_id = %job_id, code = ?code, signal = ?sig, "job exited");
        link.send_final(&Message::Exit {
            job_id: job_id.clone(),
            code,
            signal: sig,
        })
        .await;
    }
}

/// Read one pipe in ≤64 KiB chunks.
async fn pump<R: AsyncRead + Unpin>(
    mut src: R,
    kind: StreamKind,
    tx: mpsc::Sender<(StreamKind, Vec<u8>)>,
) {
    let mut buf = vec![0u8; MAX_CHUNK];
    loop {
        match src.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send((kind, buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn signal_group(pgid: i32, sig: Signal) {
    if let Err(e) = signal::killpg(Pid::from_raw(pgid), sig) {
        tracing::debug!(pgid, signal = %sig, error = %e, "killpg failed");
    }
}

/// Reap any process whose group still matches the job's pgid. The pgrp is
/// the fifth field of /proc/<pid>/stat; parsing resumes after the closing
/// paren so command names containing spaces do not shift the fields.
pub fn sweep_process_group(pgid: i32) {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        let Some((_, rest)) = stat.rsplit_once(')') else {
            continue;
        };
        let mut fields = rest.split_whitespace();
        let _state = fields.next();
        let _ppid = fields.next();
        let Some(Ok(group)) = fields.next().map(|f| f.parse::<i32>()) else {
            continue;
        };
        if group == pgid {
            tracing::warn!(pid, pgid, "reaping stray process left in job group");
            let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }
}

/// Contractual prologue: clients and logs rely on the job id, target node,
/// and actual host appearing before any job output.
fn banner(job_id: &str, node_id: &str) -> String {
    format!(
        "echo \"=== JOB EXECUTION DEBUG INFO ===\"\n\
         echo \"Job ID: {job_id}\"\n\
         echo \"Target Node ID: {node_id}\"\n\
         echo \"Actual Hostname: $(hostname)\"\n\
         echo \"Actual IP: $(hostname -I 2>/dev/null | cut -d' ' -f1 || echo 'N/A')\"\n\
         echo \"==============================\"\n"
    )
}

/// Agent-to-master link for one job's output stream. Chunks produced while
/// the link is down are dropped; the exit report retries harder.
struct StreamLink {
    addr: String,
    retry: Duration,
    conn: Option<BufWriter<TcpStream>>,
    last_attempt: Option<Instant>,
}

impl StreamLink {
    fn new(addr: String, retry: Duration) -> Self {
        Self {
            addr,
            retry,
            conn: None,
            last_attempt: None,
        }
    }

    async fn connect(&mut self) -> bool {
        if let Some(at) = self.last_attempt {
            if at.elapsed() < self.retry {
                return false;
            }
        }
        self.last_attempt = Some(Instant::now());
        match TcpStream::connect(&self.addr).await {
            Ok(stream) => {
                self.conn = Some(BufWriter::new(stream));
                true
            }
            Err(e) => {
                tracing::debug!(addr = %self.addr, error = %e, "output stream dial failed");
                false
            }
        }
    }

    async fn send(&mut self, msg: &Message) {
        if self.conn.is_none() && !self.connect().await {
            return;
        }
        if let Some(conn) = self.conn.as_mut() {
            if let Err(e) = protocol::write_message(conn, msg).await {
                tracing::debug!(error = %e, "output stream dropped, chunk lost");
                self.conn = None;
            }
        }
    }

    async fn send_final(&mut self, msg: &Message) {
        for _ in 0..5 {
            if self.conn.is_none() {
                self.last_attempt = None;
                if !self.connect().await {
                    tokio::time::sleep(self.retry).await;
                    continue;
                }
            }
            match protocol::write_message(self.conn.as_mut().expect("connected"), msg).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::debug!(error = %e, "retrying exit report");
                    self.conn = None;
                    tokio::time::sleep(self.retry).await;
                }
            }
        }
        tracing::error!("could not deliver exit report to master");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_names_job_and_node() {
        let text = banner("ab12cd34", "n1");
        assert!(text.contains("Job ID: ab12cd34"));
        assert!(text.contains("Target Node ID: n1"));
        assert!(text.contains("$(hostname)"));
        assert!(text.ends_with('\n'));
    }
}
