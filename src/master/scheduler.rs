//! Placement decisions and the scheduling loop.
//!
//! A single scheduler task wakes on submission, completion, node changes,
//! and a 1 s tick. Each pass walks the queue in priority order and places
//! whatever fits; allocation happens under the state lock, the start RPCs
//! happen outside it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::error::{MgpuError, Result};
use crate::job::{DistributedKind, JobStatus, Placement};
use crate::protocol::{self, Address, DistributedEnv, Message, NodeStatus};

use super::{ClusterState, Master};

const CANCEL_RPC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct LaunchTarget {
    pub node_id: String,
    pub address: Address,
    pub gpu_ids: Vec<u32>,
    pub rank: u32,
}

#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub job_id: String,
    pub command: String,
    pub kind: DistributedKind,
    pub targets: Vec<LaunchTarget>,
}

enum PlaceOutcome {
    Placed(LaunchPlan),
    Skip,
    Fail(String),
}

/// One placement attempt over the whole queue. Returns the first job that
/// fits, with its GPUs already allocated and its status flipped to running.
pub fn next_launch(state: &mut ClusterState) -> Option<LaunchPlan> {
    for job_id in state.jobs.queued_in_order() {
        match try_place(state, &job_id) {
            PlaceOutcome::Placed(plan) => return Some(plan),
            PlaceOutcome::Skip => continue,
            PlaceOutcome::Fail(reason) => {
                tracing::warn!(job_id = %job_id, reason = %reason, "job can no longer be placed");
                state.retire(&job_id, JobStatus::Failed, None, None, Some(reason));
            }
        }
    }
    None
}

fn try_place(state: &mut ClusterState, job_id: &str) -> PlaceOutcome {
    let spec = match state.jobs.get(job_id) {
        Some(job) => job.spec.clone(),
        None => return PlaceOutcome::Skip,
    };

    let chosen: Vec<(String, Vec<u32>)> = if let Some(pins) = &spec.pins {
        // pinned placement: every referenced node and GPU must be usable
        for pin in pins {
            let Some(node) = state.nodes.get(&pin.node_id) else {
                return PlaceOutcome::Fail(format!("pinned node {} is not registered", pin.node_id));
            };
            if node.status == NodeStatus::Offline {
                return PlaceOutcome::Fail(format!("pinned node {} is offline", pin.node_id));
            }
            for gpu in &pin.gpu_ids {
                if !node.has_gpu(*gpu) {
                    return PlaceOutcome::Fail(format!(
                        "pinned GPU {gpu} does not exist on node {}",
                        pin.node_id
                    ));
                }
            }
            if !node.is_online() || !pin.gpu_ids.iter().all(|g| node.free_gpus.contains(g)) {
                return PlaceOutcome::Skip;
            }
        }
        pins.iter()
            .map(|p| (p.node_id.clone(), p.gpu_ids.clone()))
            .collect()
    } else {
        let needed = spec.gpus as usize;
        let mut candidates: Vec<(Vec<u32>, u32, String)> = state
            .nodes
            .iter()
            .filter(|n| n.is_online())
            .map(|n| (n.eligible_gpus(spec.mem_mb), n.failure_count, n.node_id.clone()))
            .filter(|(gpus, _, _)| !gpus.is_empty())
            .collect();

        let single = candidates
            .iter()
            .filter(|(gpus, _, _)| gpus.len() >= needed)
            .min_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)))
            .cloned();

        match single {
            Some((gpus, _, node_id)) => vec![(node_id, gpus[..needed].to_vec())],
            None => {
                // spread over the nodes with the most free GPUs
                candidates.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(a.2.cmp(&b.2)));
                let available: usize = candidates.iter().map(|c| c.0.len()).sum();
                if available < needed {
                    return PlaceOutcome::Skip;
                }
                let mut remaining = needed;
                let mut chosen = Vec::new();
                for (gpus, _, node_id) in candidates {
                    if remaining == 0 {
                        break;
                    }
                    let take = remaining.min(gpus.len());
                    chosen.push((node_id, gpus[..take].to_vec()));
                    remaining -= take;
                }
                chosen
            }
        }
    };

    // allocation and the status flip share this critical section
    for (node_id, gpu_ids) in &chosen {
        state.nodes.allocate(node_id, gpu_ids);
    }
    let targets: Vec<LaunchTarget> = chosen
        .iter()
        .enumerate()
        .map(|(rank, (node_id, gpu_ids))| LaunchTarget {
            node_id: node_id.clone(),
            address: state
                .nodes
                .get(node_id)
                .map(|n| n.address.clone())
                .unwrap_or_else(|| Address {
                    host: String::new(),
                    port: 0,
                }),
            gpu_ids: gpu_ids.clone(),
            rank: rank as u32,
        })
        .collect();

    let Some(job) = state.jobs.get_mut(job_id) else {
        return PlaceOutcome::Skip;
    };
    job.status = JobStatus::Running;
    job.started_at = Some(Instant::now());
    job.assignment = chosen
        .into_iter()
        .map(|(node_id, gpu_ids)| Placement {
            node_id,
            gpu_ids,
            pid: None,
        })
        .collect();

    tracing::info!(
        job_id,
        targets = ?job.assignment,
        "job placed"
    );

    PlaceOutcome::Placed(LaunchPlan {
        job_id: job_id.to_string(),
        command: spec.command,
        kind: spec.distributed,
        targets,
    })
}

/// The scheduler task.
pub async fn run(master: Arc<Master>, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(master.config.sweep_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = master.scheduler_woken() => {}
            _ = tick.tick() => {}
        }
        loop {
            let plan = {
                let mut state = master.state.lock().await;
                next_launch(&mut state)
            };
            match plan {
                Some(plan) => {
                    let master = master.clone();
                    tokio::spawn(async move { dispatch(master, plan).await });
                }
                None => break,
            }
        }
    }
}

/// Issue the start RPCs for an allocated plan; unwind on any failure.
pub async fn dispatch(master: Arc<Master>, plan: LaunchPlan) {
    let world_size = plan.targets.len() as u32;
    let master_host = plan.targets[0].address.host.clone();
    let mut started: Vec<LaunchTarget> = Vec::new();
    let mut failed_node: Option<String> = None;

    for target in &plan.targets {
        let distributed = match plan.kind {
            DistributedKind::None => None,
            kind => Some(DistributedEnv {
                kind,
                rank: target.rank,
                world_size,
                master_host: master_host.clone(),
                master_port: master.config.torch_master_port,
            }),
        };
        let msg = Message::Start {
            job_id: plan.job_id.clone(),
            command: plan.command.clone(),
            assigned_gpus: target.gpu_ids.clone(),
            env_extras: Default::default(),
            distributed,
        };
        match start_rpc(&target.address, &msg, master.config.start_rpc_timeout).await {
            Ok(pid) => {
                let mut state = master.state.lock().await;
                state.nodes.mark_success(&target.node_id);
                if let Some(job) = state.jobs.get_mut(&plan.job_id) {
                    if let Some(p) = job
                        .assignment
                        .iter_mut()
                        .find(|p| p.node_id == target.node_id)
                    {
                        p.pid = Some(pid);
                    }
                }
                started.push(target.clone());
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %plan.job_id,
                    node_id = %target.node_id,
                    error = %e,
                    "start RPC failed"
                );
                failed_node = Some(target.node_id.clone());
                break;
            }
        }
    }

    let Some(bad) = failed_node else {
        tracing::info!(job_id = %plan.job_id, nodes = world_size, "job dispatched");
        return;
    };

    // tear down the ranks that did start before rolling the job back
    for target in &started {
        if let Err(e) = cancel_rpc(&target.address, &plan.job_id).await {
            tracing::debug!(node_id = %target.node_id, error = %e, "unwind cancel failed");
        }
    }

    {
        let mut state = master.state.lock().await;
        state.nodes.mark_failure(&bad);
        state.rollback_launch(
            &plan.job_id,
            master.config.retry_budget,
            &format!("start on {bad} failed"),
        );
    }
    master.wake_scheduler();
}

/// The liveness sweeper: walks the heartbeat ladder and fails jobs whose
/// nodes went offline.
pub async fn liveness_loop(master: Arc<Master>, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(master.config.sweep_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }

        let mut cancels: Vec<(Address, String)> = Vec::new();
        let mut lost_any = false;
        {
            let mut state = master.state.lock().await;
            let lost = state
                .nodes
                .sweep(master.config.heartbeat_timeout, master.config.offline_timeout);
            for node_id in &lost {
                lost_any = true;
                for job_id in state.jobs.running_on_node(node_id) {
                    // surviving ranks of a multi-node job are torn down too
                    if let Some(job) = state.jobs.get(&job_id) {
                        for placement in &job.assignment {
                            if &placement.node_id != node_id {
                                if let Some(peer) = state.nodes.get(&placement.node_id) {
                                    cancels.push((peer.address.clone(), job_id.clone()));
                                }
                            }
                        }
                    }
                    state.retire(
                        &job_id,
                        JobStatus::Failed,
                        None,
                        None,
                        Some("node-lost".to_string()),
                    );
                }
            }
            state.prune_terminal(master.config.terminal_jobs_kept);
        }

        for (addr, job_id) in cancels {
            tokio::spawn(async move {
                let _ = cancel_rpc(&addr, &job_id).await;
            });
        }
        if lost_any {
            master.wake_scheduler();
        }
    }
}

async fn rpc(addr: &Address, msg: &Message, timeout: Duration) -> Result<Message> {
    let exchange = async {
        let stream = TcpStream::connect((addr.host.as_str(), addr.port)).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        protocol::write_message(&mut write_half, msg).await?;
        match protocol::read_message(&mut reader).await? {
            Some(reply) => Ok(reply),
            None => Err(MgpuError::ConnectionClosed),
        }
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| MgpuError::Timeout(format!("RPC to {addr}")))?
}

async fn start_rpc(addr: &Address, msg: &Message, timeout: Duration) -> Result<u32> {
    match rpc(addr, msg, timeout).await? {
        Message::Ack { pid, .. } => Ok(pid.unwrap_or_default()),
        Message::Error { code, reason } => Err(MgpuError::Remote { code, reason }),
        other => Err(MgpuError::Protocol(format!(
            "unexpected start reply: {other:?}"
        ))),
    }
}

pub(crate) async fn cancel_rpc(addr: &Address, job_id: &str) -> Result<()> {
    rpc(
        addr,
        &Message::Cancel {
            job_id: job_id.to_string(),
        },
        CANCEL_RPC_TIMEOUT,
    )
    .await
    .map(|_| ())
}
