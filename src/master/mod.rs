//! Master: client API, node registry, scheduling, output routing.
//!
//! All shared state sits behind one coarse mutex so GPU-set mutations and
//! job-status transitions always share a critical section; the scheduler's
//! critical sections are short enough that finer locking buys nothing.

pub mod output;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod server;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::MasterConfig;
use crate::error::Result;
use crate::job::JobStatus;

pub use output::JobOutput;
pub use queue::JobQueue;
pub use registry::{NodeEntry, NodeRegistry};

/// Everything the master knows, guarded as one unit.
#[derive(Debug, Default)]
pub struct ClusterState {
    pub jobs: JobQueue,
    pub nodes: NodeRegistry,
    pub outputs: HashMap<String, JobOutput>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move a job to a terminal status, release its GPUs, and close its
    /// attachments, all in one critical section. Returns false if the job is
    /// unknown or already terminal.
    pub fn retire(
        &mut self,
        job_id: &str,
        status: JobStatus,
        code: Option<i32>,
        signal: Option<i32>,
        failure: Option<String>,
    ) -> bool {
        debug_assert!(status.is_terminal());
        let assignment = match self.jobs.get_mut(job_id) {
            Some(job) if !job.status.is_terminal() => {
                tracing::info!(
                    job_id,
                    from = %job.status,
                    to = %status,
                    code = ?code,
                    "job retired"
                );
                job.status = status;
                job.exit_code = code;
                job.signal = signal;
                if failure.is_some() {
                    job.failure = failure;
                }
                std::mem::take(&mut job.assignment)
            }
            _ => return false,
        };
        for placement in &assignment {
            self.nodes.release(&placement.node_id, &placement.gpu_ids);
        }
        if let Some(out) = self.outputs.get_mut(job_id) {
            out.finish(job_id, code, signal);
        }
        true
    }

    /// Undo a failed launch: free the allocation and requeue the job, or
    /// fail it once the retry budget is spent.
    pub fn rollback_launch(&mut self, job_id: &str, retry_budget: u32, reason: &str) {
        let exhausted = match self.jobs.get_mut(job_id) {
            Some(job) if !job.status.is_terminal() => {
                job.retry_count += 1;
                job.retry_count > retry_budget
            }
            _ => return,
        };
        if exhausted {
            self.retire(
                job_id,
                JobStatus::Failed,
                None,
                None,
                Some(format!("{reason} (placement retries exhausted)")),
            );
            return;
        }
        let assignment = match self.jobs.get_mut(job_id) {
            Some(job) => {
                tracing::info!(job_id, retries = job.retry_count, reason, "job requeued");
                job.status = JobStatus::Queued;
                job.started_at = None;
                std::mem::take(&mut job.assignment)
            }
            None => return,
        };
        for placement in &assignment {
            self.nodes.release(&placement.node_id, &placement.gpu_ids);
        }
    }

    /// Drop terminal jobs beyond the retention cap, rings included.
    pub fn prune_terminal(&mut self, keep: usize) {
        for id in self.jobs.prune_terminal(keep) {
            self.outputs.remove(&id);
        }
    }
}

pub struct Master {
    pub config: MasterConfig,
    pub state: Mutex<ClusterState>,
    schedule_wake: Notify,
}

impl Master {
    pub fn new(config: MasterConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(ClusterState::new()),
            schedule_wake: Notify::new(),
        })
    }

    pub fn wake_scheduler(&self) {
        self.schedule_wake.notify_one();
    }

    pub(crate) async fn scheduler_woken(&self) {
        self.schedule_wake.notified().await;
    }
}

/// Bind and serve until shutdown.
pub async fn run(config: MasterConfig, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr).await?;
    let master = Master::new(config);
    serve(master, listener, shutdown).await
}

/// Serve on an already-bound listener (the test harness binds port 0).
pub async fn serve(
    master: Arc<Master>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "master listening");

    tokio::spawn(scheduler::run(master.clone(), shutdown.clone()));
    tokio::spawn(scheduler::liveness_loop(master.clone(), shutdown.clone()));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let master = master.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server::handle_connection(master, stream).await {
                                tracing::debug!(peer = %peer, error = %e, "connection error");
                            }
                        });
                    }
                    Err(e) => tracing::error!(error = %e, "accept failed"),
                }
            }
        }
    }
    Ok(())
}
