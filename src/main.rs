use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mgpu_sched::agent::{gpu, Agent};
use mgpu_sched::client::{self, Client};
use mgpu_sched::config::{AgentConfig, ClientTimeouts, MasterConfig, OrphanPolicy};
use mgpu_sched::error::MgpuError;
use mgpu_sched::job::{DistributedKind, JobSpec};
use mgpu_sched::master;
use mgpu_sched::protocol::{codes, JobView, NodeView};

#[derive(Parser, Debug)]
#[command(name = "mgpu")]
#[command(about = "Multi-tenant GPU job scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the cluster master
    Master {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
        /// Seconds of heartbeat silence before a node is degraded
        #[arg(long, default_value_t = 30)]
        heartbeat_timeout: u64,
        /// Further seconds of silence before a degraded node goes offline
        #[arg(long, default_value_t = 60)]
        offline_timeout: u64,
        /// Running jobs agents report that the master has no record of:
        /// "adopt" leaves them alone, "kill" tears them down
        #[arg(long, default_value = "adopt")]
        orphan_policy: String,
    },
    /// Run a node agent
    Agent {
        #[arg(long)]
        node_id: String,
        #[arg(long, env = "MGPU_MASTER_HOST", default_value = "127.0.0.1")]
        master_host: String,
        #[arg(long, env = "MGPU_MASTER_PORT", default_value_t = 8080)]
        master_port: u16,
        #[arg(long, default_value_t = 8081)]
        port: u16,
        /// Hostname the master should dial back; defaults to this host's name
        #[arg(long)]
        advertise_host: Option<String>,
        /// Seconds between heartbeats
        #[arg(long, default_value_t = 10)]
        heartbeat_interval: u64,
        /// Fake GPU inventory "model:mem_mb,…" for CPU-only clusters
        #[arg(long)]
        gpus_override: Option<String>,
    },
    /// Submit a job
    Submit {
        #[command(flatten)]
        endpoint: Endpoint,
        #[command(flatten)]
        timeouts: TimeoutArgs,
        /// GPUs to allocate anywhere in the cluster
        #[arg(long, default_value_t = 1)]
        gpus: u32,
        /// Pin placement, e.g. "n1:0,1;n2:2"; overrides --gpus
        #[arg(long)]
        node_gpu_ids: Option<String>,
        /// Larger runs first
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// Stay attached to the job's output
        #[arg(long)]
        interactive: bool,
        /// Inject the torch-distributed environment
        #[arg(long, conflicts_with = "mpi")]
        distributed: bool,
        /// Mark as an MPI job (mpirun manages its own environment)
        #[arg(long)]
        mpi: bool,
        /// Advisory per-GPU memory floor in MiB
        #[arg(long)]
        mem: Option<u64>,
        /// Keep the job running when the interactive client disconnects
        #[arg(long)]
        no_cancel_on_detach: bool,
        /// The shell command to run
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Show queued and running jobs plus node state
    Queue {
        #[command(flatten)]
        endpoint: Endpoint,
    },
    /// Cancel a job
    Cancel {
        #[command(flatten)]
        endpoint: Endpoint,
        job_id: String,
    },
    /// Attach to a job's output stream
    Monitor {
        #[command(flatten)]
        endpoint: Endpoint,
        #[command(flatten)]
        timeouts: TimeoutArgs,
        job_id: String,
    },
}

#[derive(Args, Debug)]
struct Endpoint {
    #[arg(long, env = "MGPU_MASTER_HOST", default_value = "127.0.0.1")]
    master_host: String,
    #[arg(long, env = "MGPU_MASTER_PORT", default_value_t = 8080)]
    master_port: u16,
}

impl Endpoint {
    fn addr(&self) -> String {
        format!("{}:{}", self.master_host, self.master_port)
    }
}

#[derive(Args, Debug)]
struct TimeoutArgs {
    /// Whole-session timeout in seconds (unbounded when unset)
    #[arg(long)]
    session_timeout: Option<u64>,
    /// TCP connect timeout in seconds
    #[arg(long)]
    connection_timeout: Option<u64>,
    /// Per-read timeout in seconds
    #[arg(long)]
    max_wait_time: Option<u64>,
    /// Read retries before giving up
    #[arg(long)]
    max_consecutive_timeouts: Option<u32>,
}

impl TimeoutArgs {
    fn to_timeouts(&self) -> ClientTimeouts {
        ClientTimeouts {
            session: self.session_timeout.map(Duration::from_secs),
            connect: self.connection_timeout.map(Duration::from_secs),
            read: self.max_wait_time.map(Duration::from_secs),
            max_consecutive_timeouts: self.max_consecutive_timeouts,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let code = run(cli).await;
    if code != 0 {
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> i32 {
    match cli.command {
        Cmd::Master {
            host,
            port,
            heartbeat_timeout,
            offline_timeout,
            orphan_policy,
        } => {
            let orphan_policy = match orphan_policy.parse::<OrphanPolicy>() {
                Ok(policy) => policy,
                Err(e) => {
                    eprintln!("{e}");
                    return 2;
                }
            };
            let listen_addr: SocketAddr = match format!("{host}:{port}").parse() {
                Ok(addr) => addr,
                Err(e) => {
                    eprintln!("bad listen address: {e}");
                    return 2;
                }
            };
            let config = MasterConfig {
                listen_addr,
                heartbeat_timeout: Duration::from_secs(heartbeat_timeout),
                offline_timeout: Duration::from_secs(offline_timeout),
                orphan_policy,
                ..MasterConfig::default()
            };
            // SIGINT/SIGTERM stop the accept loop; in-flight connections
            // finish on their own
            let shutdown = CancellationToken::new();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                tracing::info!("shutdown signal received, master draining");
                trigger.cancel();
            });
            match master::run(config, shutdown).await {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("master failed: {e}");
                    1
                }
            }
        }
        Cmd::Agent {
            node_id,
            master_host,
            master_port,
            port,
            advertise_host,
            heartbeat_interval,
            gpus_override,
        } => {
            let gpu_override = match gpus_override {
                Some(value) => match gpu::parse_gpu_override(&value) {
                    Ok(gpus) => Some(gpus),
                    Err(e) => {
                        eprintln!("{e}");
                        return 2;
                    }
                },
                None => None,
            };
            let listen_addr: SocketAddr = match format!("0.0.0.0:{port}").parse() {
                Ok(addr) => addr,
                Err(e) => {
                    eprintln!("bad listen port: {e}");
                    return 2;
                }
            };
            let mut config = AgentConfig::new(
                node_id,
                format!("{master_host}:{master_port}"),
                listen_addr,
            );
            config.advertise_host = advertise_host.unwrap_or_else(local_hostname);
            config.heartbeat_interval = Duration::from_secs(heartbeat_interval);
            config.gpu_override = gpu_override;

            // SIGINT/SIGTERM stop the agent, which signals every process
            // group it still supervises before exiting
            let shutdown = CancellationToken::new();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                tracing::info!("shutdown signal received, agent tearing down its jobs");
                trigger.cancel();
            });
            let agent = Agent::new(config).await;
            match agent.run(shutdown).await {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("agent failed: {e}");
                    1
                }
            }
        }
        Cmd::Submit {
            endpoint,
            timeouts,
            gpus,
            node_gpu_ids,
            priority,
            interactive,
            distributed,
            mpi,
            mem,
            no_cancel_on_detach,
            command,
        } => {
            let pins = match node_gpu_ids {
                Some(value) => match client::parse_pins(&value) {
                    Ok(pins) => Some(pins),
                    Err(e) => {
                        eprintln!("{e}");
                        return 2;
                    }
                },
                None => None,
            };
            let spec = JobSpec {
                owner: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
                command: command.join(" "),
                gpus,
                pins,
                priority,
                interactive,
                distributed: if distributed {
                    DistributedKind::TorchDistributed
                } else if mpi {
                    DistributedKind::Mpi
                } else {
                    DistributedKind::None
                },
                cancel_on_detach: no_cancel_on_detach.then_some(false),
                mem_mb: mem,
            };
            let client = Client::new(endpoint.addr(), timeouts.to_timeouts());
            if interactive {
                match client.submit_interactive(spec).await {
                    Ok(attachment) => {
                        eprintln!("job {} submitted", attachment.job_id);
                        match client::run_interactive(&client, attachment).await {
                            Ok(code) => code,
                            Err(e) => report(e),
                        }
                    }
                    Err(e) => report(e),
                }
            } else {
                match client.submit(spec).await {
                    Ok(job_id) => {
                        println!("{job_id}");
                        0
                    }
                    Err(e) => report(e),
                }
            }
        }
        Cmd::Queue { endpoint } => {
            let client = Client::new(endpoint.addr(), ClientTimeouts::default());
            match client.queue().await {
                Ok((jobs, nodes)) => {
                    print_queue(&jobs, &nodes);
                    0
                }
                Err(e) => report(e),
            }
        }
        Cmd::Cancel { endpoint, job_id } => {
            let client = Client::new(endpoint.addr(), ClientTimeouts::default());
            match client.cancel(&job_id).await {
                Ok(prior) => {
                    println!("job {job_id} cancelled (was {prior})");
                    0
                }
                Err(e) => report(e),
            }
        }
        Cmd::Monitor {
            endpoint,
            timeouts,
            job_id,
        } => {
            let client = Client::new(endpoint.addr(), timeouts.to_timeouts());
            match client.attach(&job_id).await {
                Ok(attachment) => match client::run_interactive(&client, attachment).await {
                    Ok(code) => code,
                    Err(e) => report(e),
                },
                Err(e) => report(e),
            }
        }
    }
}

/// Exit-code contract: 2 bad arguments, 3 no such job, 4 cluster
/// unreachable, otherwise the failure is the program's own.
fn report(err: MgpuError) -> i32 {
    eprintln!("{err}");
    match &err {
        MgpuError::Remote { code, .. } if code == codes::UNKNOWN_JOB => 3,
        MgpuError::Remote { code, .. } if code == codes::INVALID_SPEC => 2,
        MgpuError::UnknownJob(_) => 3,
        MgpuError::InvalidSpec(_) => 2,
        MgpuError::Io(_) | MgpuError::Timeout(_) | MgpuError::ConnectionClosed => 4,
        _ => 1,
    }
}

fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

fn print_queue(jobs: &[JobView], nodes: &[NodeView]) {
    println!("JOBS");
    println!(
        "{:<10} {:<10} {:<11} {:>4} {:>5}  COMMAND",
        "ID", "OWNER", "STATUS", "GPUS", "PRIO"
    );
    for job in jobs {
        println!(
            "{:<10} {:<10} {:<11} {:>4} {:>5}  {}",
            job.id,
            job.owner,
            job.status.to_string(),
            job.gpus,
            job.priority,
            job.command
        );
    }
    println!();
    println!("NODES");
    println!(
        "{:<12} {:<9} {:>5} {:>6}  FREE",
        "NODE", "STATUS", "GPUS", "FAILS"
    );
    for node in nodes {
        let free: Vec<String> = node.free_gpus.iter().map(|g| g.to_string()).collect();
        println!(
            "{:<12} {:<9} {:>5} {:>6}  [{}]",
            node.node_id,
            node.status.to_string(),
            node.total_gpus,
            node.failure_count,
            free.join(",")
        );
    }
}
