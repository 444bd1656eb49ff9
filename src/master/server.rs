//! Per-connection message handling.
//!
//! The first message on a connection decides what the connection is: a
//! one-shot client exchange (`submit`/`queue`/`cancel`), a client
//! attachment, an agent's register-plus-heartbeat session, or a per-job
//! output stream.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::config::OrphanPolicy;
use crate::error::{MgpuError, Result};
use crate::job::{new_job_id, Job, JobSpec, JobStatus};
use crate::protocol::{self, codes, Address, GpuDesc, Message};

use super::output::JobOutput;
use super::{scheduler, Master};

type Reader = BufReader<OwnedReadHalf>;
type Writer = OwnedWriteHalf;

pub async fn handle_connection(master: Arc<Master>, stream: TcpStream) -> Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let Some(first) = protocol::read_message(&mut reader).await? else {
        return Ok(());
    };

    match first {
        Message::Submit { spec } => handle_submit(master, reader, writer, spec).await,
        Message::Queue => {
            let reply = snapshot(&master).await;
            protocol::write_message(&mut writer, &reply).await
        }
        Message::Cancel { job_id } => handle_cancel(master, writer, job_id).await,
        Message::Attach { job_id } => handle_attach(master, reader, writer, job_id).await,
        Message::Register {
            node_id,
            address,
            gpus,
        } => node_session(master, reader, writer, node_id, address, gpus).await,
        first @ (Message::Out { .. } | Message::Exit { .. }) => {
            stream_session(master, reader, first).await
        }
        Message::Heartbeat { node_id, .. } => {
            // heartbeats belong to a registered session; a bare one means the
            // agent and master disagree about the connection, so drop it and
            // let the agent re-register
            tracing::debug!(node_id = %node_id, "heartbeat outside a node session");
            Ok(())
        }
        other => {
            protocol::write_message(
                &mut writer,
                &Message::error(codes::BAD_MESSAGE, format!("unexpected message: {other:?}")),
            )
            .await
        }
    }
}

async fn snapshot(master: &Master) -> Message {
    let state = master.state.lock().await;
    Message::Snapshot {
        jobs: state.jobs.views(),
        nodes: state.nodes.views(),
    }
}

async fn handle_submit(
    master: Arc<Master>,
    reader: Reader,
    mut writer: Writer,
    spec: JobSpec,
) -> Result<()> {
    if let Err(e) = validate_submit(&master, &spec).await {
        return protocol::write_message(&mut writer, &protocol::error_reply(&e)).await;
    }

    let job_id = {
        let mut state = master.state.lock().await;
        let id = new_job_id(|candidate| state.jobs.contains(candidate));
        state.jobs.insert(Job::new(id.clone(), spec.clone()));
        state
            .outputs
            .insert(id.clone(), JobOutput::new(master.config.ring_capacity));
        id
    };
    tracing::info!(
        job_id = %job_id,
        owner = %spec.owner,
        gpus = spec.gpu_count(),
        priority = spec.priority,
        interactive = spec.interactive,
        "job submitted"
    );
    master.wake_scheduler();

    protocol::write_message(
        &mut writer,
        &Message::Ack {
            job_id: Some(job_id.clone()),
            prior_status: None,
            pid: None,
        },
    )
    .await?;

    if spec.interactive {
        // the submitting connection stays open as the attachment
        let tie = spec.cancel_on_detach.unwrap_or(true);
        attach_loop(master, reader, writer, job_id, tie).await
    } else {
        Ok(())
    }
}

async fn validate_submit(master: &Master, spec: &JobSpec) -> Result<()> {
    spec.validate()?;
    let state = master.state.lock().await;
    if let Some(pins) = &spec.pins {
        for pin in pins {
            let Some(node) = state.nodes.get(&pin.node_id) else {
                return Err(MgpuError::InvalidSpec(format!(
                    "pin references unknown node {}",
                    pin.node_id
                )));
            };
            for gpu in &pin.gpu_ids {
                if !node.has_gpu(*gpu) {
                    return Err(MgpuError::InvalidSpec(format!(
                        "pin references unknown GPU {gpu} on node {}",
                        pin.node_id
                    )));
                }
            }
        }
    } else {
        let total = state.nodes.total_gpus();
        // an empty registry means the cluster is still assembling: queue
        // rather than refuse
        if total > 0 && spec.gpus as usize > total {
            return Err(MgpuError::Unsatisfiable(format!(
                "{} GPUs requested, cluster has {total}",
                spec.gpus
            )));
        }
    }
    Ok(())
}

async fn handle_cancel(master: Arc<Master>, mut writer: Writer, job_id: String) -> Result<()> {
    match cancel_job(&master, &job_id).await {
        Ok(prior) => {
            protocol::write_message(
                &mut writer,
                &Message::Ack {
                    job_id: Some(job_id),
                    prior_status: Some(prior),
                    pid: None,
                },
            )
            .await
        }
        Err(e) => protocol::write_message(&mut writer, &protocol::error_reply(&e)).await,
    }
}

/// Cancel a job, waiting (bounded by the grace period) for the agents' exit
/// reports before force-retiring. Idempotent; returns the status the job had
/// when the cancel arrived.
pub(crate) async fn cancel_job(master: &Arc<Master>, job_id: &str) -> Result<JobStatus> {
    let (prior, cancels) = {
        let mut state = master.state.lock().await;
        let prior = state
            .jobs
            .get(job_id)
            .ok_or_else(|| MgpuError::UnknownJob(job_id.to_string()))?
            .status;
        match prior {
            JobStatus::Queued => {
                state.retire(job_id, JobStatus::Cancelled, None, None, None);
                master.wake_scheduler();
                return Ok(prior);
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                return Ok(prior);
            }
            JobStatus::Cancelling => (prior, Vec::new()),
            JobStatus::Running => {
                let assignment = {
                    let job = state.jobs.get_mut(job_id).expect("job vanished under lock");
                    job.status = JobStatus::Cancelling;
                    job.assignment.clone()
                };
                let mut cancels = Vec::new();
                for placement in &assignment {
                    if let Some(node) = state.nodes.get(&placement.node_id) {
                        cancels.push((node.address.clone(), job_id.to_string()));
                    }
                }
                (prior, cancels)
            }
        }
    };

    for (addr, job) in cancels {
        tokio::spawn(async move {
            if let Err(e) = scheduler::cancel_rpc(&addr, &job).await {
                tracing::warn!(job_id = %job, addr = %addr, error = %e, "cancel RPC failed");
            }
        });
    }

    let deadline = tokio::time::Instant::now() + master.config.cancel_grace;
    loop {
        {
            let state = master.state.lock().await;
            if state
                .jobs
                .get(job_id)
                .map_or(true, |j| j.status.is_terminal())
            {
                return Ok(prior);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    {
        let mut state = master.state.lock().await;
        if state
            .jobs
            .get(job_id)
            .map_or(false, |j| j.status == JobStatus::Cancelling)
        {
            tracing::warn!(job_id, "no exit report within grace, force-retiring");
            state.retire(
                job_id,
                JobStatus::Cancelled,
                None,
                None,
                Some("cancel grace expired".to_string()),
            );
        }
    }
    master.wake_scheduler();
    Ok(prior)
}

async fn handle_attach(
    master: Arc<Master>,
    reader: Reader,
    mut writer: Writer,
    job_id: String,
) -> Result<()> {
    let known = {
        let state = master.state.lock().await;
        state.jobs.contains(&job_id)
    };
    if !known {
        return protocol::write_message(
            &mut writer,
            &Message::error(codes::UNKNOWN_JOB, format!("unknown job {job_id}")),
        )
        .await;
    }
    protocol::write_message(
        &mut writer,
        &Message::Ack {
            job_id: Some(job_id.clone()),
            prior_status: None,
            pid: None,
        },
    )
    .await?;
    attach_loop(master, reader, writer, job_id, false).await
}

/// Replay the job's retained output, then forward live chunks until the exit
/// message or the client goes away.
async fn attach_loop(
    master: Arc<Master>,
    mut reader: Reader,
    mut writer: Writer,
    job_id: String,
    tie: bool,
) -> Result<()> {
    let (backlog, exit, tap) = {
        let mut state = master.state.lock().await;
        let Some(out) = state.outputs.get_mut(&job_id) else {
            let terminal = state
                .jobs
                .get(&job_id)
                .map_or(true, |j| j.status.is_terminal());
            drop(state);
            let reply = if terminal {
                Message::error(codes::NO_HISTORY, format!("no retained output for {job_id}"))
            } else {
                Message::error(codes::INTERNAL, format!("no output state for {job_id}"))
            };
            return protocol::write_message(&mut writer, &reply).await;
        };
        let backlog: Vec<Message> = out
            .ring
            .replay()
            .map(|(kind, data)| Message::Out {
                job_id: job_id.clone(),
                stream: *kind,
                data: protocol::encode_chunk(data),
            })
            .collect();
        let exit = out.exit;
        let tap = if exit.is_none() {
            Some(out.attach(tie))
        } else {
            None
        };
        (backlog, exit, tap)
    };

    for msg in &backlog {
        protocol::write_message(&mut writer, msg).await?;
    }
    if let Some((code, signal)) = exit {
        return protocol::write_message(
            &mut writer,
            &Message::Exit {
                job_id,
                code,
                signal,
            },
        )
        .await;
    }
    let Some((tap_id, mut rx)) = tap else {
        return Ok(());
    };

    let mut client_gone = false;
    loop {
        tokio::select! {
            forwarded = rx.recv() => {
                match forwarded {
                    Some(msg) => {
                        let is_exit = matches!(msg, Message::Exit { .. });
                        if protocol::write_message(&mut writer, &msg).await.is_err() {
                            client_gone = true;
                            break;
                        }
                        if is_exit {
                            break;
                        }
                    }
                    // dropped for backpressure, or the job was pruned
                    None => break,
                }
            }
            // the client writes nothing after attaching; EOF or anything
            // else means the attachment is over
            _ = protocol::read_message(&mut reader) => {
                client_gone = true;
                break;
            }
        }
    }

    if client_gone {
        let cancel = {
            let mut state = master.state.lock().await;
            let tied = state
                .outputs
                .get_mut(&job_id)
                .map_or(false, |out| out.detach(tap_id));
            tied && state
                .jobs
                .get(&job_id)
                .map_or(false, |j| !j.status.is_terminal())
        };
        if cancel {
            tracing::info!(job_id = %job_id, "interactive client went away, cancelling job");
            let _ = cancel_job(&master, &job_id).await;
        }
    }
    Ok(())
}

/// A registered agent's long-lived session: ack the registration, then
/// consume heartbeats until the connection drops. Liveness of the node is
/// driven by the sweeper, not by this task.
async fn node_session(
    master: Arc<Master>,
    mut reader: Reader,
    mut writer: Writer,
    node_id: String,
    address: Address,
    gpus: Vec<GpuDesc>,
) -> Result<()> {
    {
        let mut state = master.state.lock().await;
        state.nodes.register(node_id.clone(), address, gpus);
        // GPUs of jobs the master still tracks on this node stay allocated
        let held: Vec<Vec<u32>> = state
            .jobs
            .running_on_node(&node_id)
            .iter()
            .filter_map(|job_id| state.jobs.get(job_id))
            .flat_map(|job| {
                job.assignment
                    .iter()
                    .filter(|p| p.node_id == node_id)
                    .map(|p| p.gpu_ids.clone())
                    .collect::<Vec<_>>()
            })
            .collect();
        for gpu_ids in held {
            state.nodes.allocate(&node_id, &gpu_ids);
        }
    }
    master.wake_scheduler();
    protocol::write_message(&mut writer, &Message::ack()).await?;

    while let Some(msg) = protocol::read_message(&mut reader).await? {
        match msg {
            Message::Heartbeat {
                node_id: hb_node,
                free_gpus,
                running,
                ..
            } => {
                if hb_node != node_id {
                    tracing::warn!(
                        session = %node_id,
                        heartbeat = %hb_node,
                        "heartbeat names a different node, ignoring"
                    );
                    continue;
                }
                handle_heartbeat(&master, &node_id, free_gpus, running).await;
            }
            other => {
                tracing::warn!(node_id = %node_id, message = ?other, "unexpected message on node session");
            }
        }
    }
    tracing::debug!(node_id = %node_id, "node session closed");
    Ok(())
}

async fn handle_heartbeat(
    master: &Arc<Master>,
    node_id: &str,
    free_gpus: Vec<u32>,
    running: Vec<String>,
) {
    let mut cancels: Vec<(Address, String)> = Vec::new();
    let mut stale = false;
    {
        let mut state = master.state.lock().await;
        if !state.nodes.heartbeat(node_id) {
            return;
        }
        let addr = state.nodes.get(node_id).map(|n| n.address.clone());

        // drift between the two free-GPU views is diagnostic only; the
        // master's bookkeeping stays authoritative
        if let Some(node) = state.nodes.get(node_id) {
            let ours: Vec<u32> = node.free_gpus.iter().copied().collect();
            if ours != free_gpus {
                tracing::debug!(node_id, master = ?ours, agent = ?free_gpus, "free-GPU views differ");
            }
        }

        let reported: HashSet<String> = running.iter().cloned().collect();
        for job_id in running {
            match state.jobs.get(&job_id) {
                // a force-retired cancel the agent never confirmed
                Some(job) if job.status == JobStatus::Cancelled => {
                    if let Some(addr) = &addr {
                        cancels.push((addr.clone(), job_id));
                    }
                }
                Some(_) => {}
                None => {
                    if master.config.orphan_policy == OrphanPolicy::Kill {
                        tracing::warn!(job_id = %job_id, node_id, "killing orphan job");
                        if let Some(addr) = &addr {
                            cancels.push((addr.clone(), job_id));
                        }
                    }
                }
            }
        }

        // jobs the master placed here whose exit report never arrived
        for job_id in state.jobs.running_on_node(node_id) {
            if reported.contains(&job_id) {
                continue;
            }
            let Some(job) = state.jobs.get(&job_id) else {
                continue;
            };
            if job.status != JobStatus::Running {
                continue;
            }
            // tolerance matches the node-loss ladder so an exit report that
            // is merely in flight does not fail the job
            let tolerance = master.config.heartbeat_timeout + master.config.offline_timeout;
            let old_enough = job.started_at.map_or(false, |t| t.elapsed() > tolerance);
            if old_enough {
                tracing::warn!(job_id = %job_id, node_id, "agent no longer reports job, failing it");
                state.retire(
                    &job_id,
                    JobStatus::Failed,
                    None,
                    None,
                    Some("node-lost".to_string()),
                );
                stale = true;
            }
        }
    }

    for (addr, job_id) in cancels {
        tokio::spawn(async move {
            let _ = scheduler::cancel_rpc(&addr, &job_id).await;
        });
    }
    if stale {
        master.wake_scheduler();
    }
}

/// A per-job output stream from an agent: `out` chunks, then `exit`.
async fn stream_session(master: Arc<Master>, mut reader: Reader, first: Message) -> Result<()> {
    let mut current = Some(first);
    loop {
        let Some(msg) = current.take() else {
            break;
        };
        match msg {
            Message::Out {
                job_id,
                stream,
                data,
            } => {
                let bytes = protocol::decode_chunk(&data)?;
                let mut state = master.state.lock().await;
                match state.outputs.get_mut(&job_id) {
                    Some(out) => out.publish(&job_id, stream, bytes),
                    None => tracing::debug!(job_id = %job_id, "output for unknown job dropped"),
                }
            }
            Message::Exit {
                job_id,
                code,
                signal,
            } => handle_exit(&master, &job_id, code, signal).await,
            other => {
                tracing::warn!(message = ?other, "unexpected message on output stream");
            }
        }
        current = protocol::read_message(&mut reader).await?;
    }
    Ok(())
}

async fn handle_exit(master: &Arc<Master>, job_id: &str, code: Option<i32>, signal: Option<i32>) {
    let cancels: Vec<(Address, String)> = {
        let mut state = master.state.lock().await;
        let Some(job) = state.jobs.get(job_id) else {
            return;
        };
        let status = match job.status {
            JobStatus::Cancelling => JobStatus::Cancelled,
            JobStatus::Running if code == Some(0) => JobStatus::Completed,
            JobStatus::Running => JobStatus::Failed,
            // the other ranks of a multi-node job report after the first
            // one already retired it
            _ => return,
        };
        // a multi-node job is over when its first rank exits; tear down the
        // rest rather than leave them running against a retired job
        let mut cancels = Vec::new();
        if job.assignment.len() > 1 {
            for placement in &job.assignment {
                if let Some(node) = state.nodes.get(&placement.node_id) {
                    cancels.push((node.address.clone(), job_id.to_string()));
                }
            }
        }
        let failure = (status == JobStatus::Failed).then(|| match signal {
            Some(sig) => format!("terminated by signal {sig}"),
            None => format!("exit code {}", code.unwrap_or(-1)),
        });
        state.retire(job_id, status, code, signal, failure);
        cancels
    };

    for (addr, job) in cancels {
        tokio::spawn(async move {
            let _ = scheduler::cancel_rpc(&addr, &job).await;
        });
    }
    master.wake_scheduler();
}
