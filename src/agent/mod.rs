//! Node agent: detects local GPUs, registers with the master, answers
//! resource queries, executes assigned jobs in supervised process groups,
//! and streams their output back.
//!
//! Connection model: one long-lived outbound connection carries the
//! registration and subsequent heartbeats; every master command (`start`,
//! `cancel`, `query-resources`) arrives on its own inbound TCP connection
//! and is handled concurrently. Reusing a single control socket for
//! request/response multiplexing is exactly the bug this layout replaces.

pub mod executor;
pub mod gpu;

pub use executor::{JobExecutor, ProcessRecord, ProcessTable, StartRequest};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::error::{MgpuError, Result};
use crate::protocol::{self, codes, Address, GpuDesc, Message};

pub struct Agent {
    config: AgentConfig,
    gpus: Vec<GpuDesc>,
    table: ProcessTable,
    executor: JobExecutor,
}

impl Agent {
    pub async fn new(config: AgentConfig) -> Self {
        let gpus = match &config.gpu_override {
            Some(gpus) => gpus.clone(),
            None => gpu::detect_gpus().await,
        };
        let table: ProcessTable = Arc::new(Mutex::new(HashMap::new()));
        let executor = JobExecutor::new(&config, table.clone());
        tracing::info!(
            node_id = %config.node_id,
            gpus = gpus.len(),
            "agent initialized"
        );
        Self {
            config,
            gpus,
            table,
            executor,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let local = listener.local_addr()?;
        tracing::info!(node_id = %self.config.node_id, addr = %local, "agent listening");

        let agent = Arc::new(self);
        tokio::spawn(heartbeat_loop(agent.clone(), local.port(), shutdown.clone()));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let agent = agent.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_command(agent, stream).await {
                                    tracing::debug!(peer = %peer, error = %e, "command connection error");
                                }
                            });
                        }
                        Err(e) => tracing::error!(error = %e, "accept failed"),
                    }
                }
            }
        }

        // tear down whatever is still running before exiting
        let running: Vec<String> = agent.table.lock().await.keys().cloned().collect();
        for job_id in running {
            agent.executor.cancel(&job_id).await;
        }
        Ok(())
    }

    async fn free_gpus(&self) -> Vec<u32> {
        let busy: HashSet<u32> = self
            .table
            .lock()
            .await
            .values()
            .flat_map(|r| r.gpu_ids.iter().copied())
            .collect();
        self.gpus
            .iter()
            .map(|g| g.index)
            .filter(|index| !busy.contains(index))
            .collect()
    }
}

/// One inbound master command per connection.
async fn handle_command(agent: Arc<Agent>, stream: TcpStream) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let Some(msg) = protocol::read_message(&mut reader).await? else {
        return Ok(());
    };

    let reply = match msg {
        Message::Start {
            job_id,
            command,
            assigned_gpus,
            env_extras,
            distributed,
        } => {
            let req = StartRequest {
                job_id: job_id.clone(),
                command,
                gpu_ids: assigned_gpus,
                env_extras,
                distributed,
            };
            match agent.executor.start(req).await {
                Ok(record) => Message::Ack {
                    job_id: Some(job_id),
                    prior_status: None,
                    pid: Some(record.pgid as u32),
                },
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "start refused");
                    protocol::error_reply(&e)
                }
            }
        }
        Message::Cancel { job_id } => {
            let known = agent.executor.cancel(&job_id).await;
            if !known {
                tracing::debug!(job_id = %job_id, "cancel for job not running here");
            }
            Message::Ack {
                job_id: Some(job_id),
                prior_status: None,
                pid: None,
            }
        }
        Message::QueryResources => Message::Resources {
            gpus: agent.gpus.clone(),
            free_gpus: agent.free_gpus().await,
        },
        other => Message::error(codes::BAD_MESSAGE, format!("unexpected message: {other:?}")),
    };

    protocol::write_message(&mut write_half, &reply).await
}

/// Keep a registration session alive with the master, re-dialling and
/// re-registering whenever the connection drops.
async fn heartbeat_loop(agent: Arc<Agent>, listen_port: u16, shutdown: CancellationToken) {
    let redial = agent.config.heartbeat_interval.min(Duration::from_secs(5));
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        if let Err(e) = register_session(&agent, listen_port, &shutdown).await {
            tracing::debug!(master = %agent.config.master_addr, error = %e, "master session lost");
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(redial) => {}
        }
    }
}

async fn register_session(
    agent: &Agent,
    listen_port: u16,
    shutdown: &CancellationToken,
) -> Result<()> {
    let stream = TcpStream::connect(&agent.config.master_addr).await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    protocol::write_message(
        &mut write_half,
        &Message::Register {
            node_id: agent.config.node_id.clone(),
            address: Address {
                host: agent.config.advertise_host.clone(),
                port: listen_port,
            },
            gpus: agent.gpus.clone(),
        },
    )
    .await?;

    match protocol::read_message(&mut reader).await? {
        Some(Message::Ack { .. }) => {
            tracing::info!(master = %agent.config.master_addr, "registered with master");
        }
        Some(Message::Error { code, reason }) => {
            return Err(MgpuError::Remote { code, reason });
        }
        other => {
            return Err(MgpuError::Protocol(format!(
                "unexpected registration reply: {other:?}"
            )));
        }
    }

    let mut ticker = tokio::time::interval(agent.config.heartbeat_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        let free_gpus = agent.free_gpus().await;
        let running: Vec<String> = agent.table.lock().await.keys().cloned().collect();
        protocol::write_message(
            &mut write_half,
            &Message::Heartbeat {
                node_id: agent.config.node_id.clone(),
                free_gpus,
                running,
                ts: Utc::now().timestamp(),
            },
        )
        .await?;
    }
}
