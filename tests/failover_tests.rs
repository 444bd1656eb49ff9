//! Partial-failure behavior: node loss, node return, start-RPC retries, and
//! orphan handling.


use std::collections::HashMap;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::TcpStream;

use mgpu_sched::config::OrphanPolicy;
use mgpu_sched::job::JobStatus;
use mgpu_sched::protocol::{self, Address, Message, NodeStatus};

use test_harness::{assert_eventually, spec, test_gpus, test_master_config, TestCluster};

/// One request/response exchange against an agent, the way the master does.
async fn agent_rpc(addr: &Address, msg: &Message) -> Message {
    let stream = TcpStream::connect((addr.host.as_str(), addr.port))
        .await
        .expect("agent unreachable");
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    protocol::write_message(&mut write_half, msg).await.unwrap();
    protocol::read_message(&mut reader)
        .await
        .unwrap()
        .expect("agent closed without replying")
}

#[tokio::test]
async fn node_loss_fails_its_running_jobs() {
    let cluster = TestCluster::start(&[("n1", 1)]).await;
    let client = cluster.client();

    let job_id = client.submit(spec("sleep 30", 1)).await.unwrap();
    cluster
        .wait_for_status(&job_id, JobStatus::Running, Duration::from_secs(5))
        .await;

    cluster.agent("n1").kill();

    // heartbeat timeout, then offline timeout, then the job is failed
    cluster
        .wait_for_status(&job_id, JobStatus::Failed, Duration::from_secs(15))
        .await;
    {
        let state = cluster.master.state.lock().await;
        let job = state.jobs.get(&job_id).unwrap();
        assert_eq!(job.failure.as_deref(), Some("node-lost"));
        assert!(job.assignment.is_empty());
        assert_eq!(
            state.nodes.get("n1").unwrap().status,
            NodeStatus::Offline
        );
    }

    let (jobs, nodes) = client.queue().await.unwrap();
    assert!(jobs.is_empty());
    assert_eq!(nodes[0].status, NodeStatus::Offline);
}

#[tokio::test]
async fn a_returning_node_is_schedulable_again() {
    let mut cluster = TestCluster::start(&[("n1", 1)]).await;
    cluster.agent("n1").kill();

    let master = cluster.master.clone();
    assert_eventually(
        || {
            let master = master.clone();
            async move {
                let state = master.state.lock().await;
                state.nodes.get("n1").map(|n| n.status) == Some(NodeStatus::Offline)
            }
        },
        Duration::from_secs(15),
        "node never went offline",
    )
    .await;

    cluster.spawn_agent("n1", 1).await;
    assert_eventually(
        || {
            let master = master.clone();
            async move {
                let state = master.state.lock().await;
                state.nodes.get("n1").map(|n| n.status) == Some(NodeStatus::Online)
            }
        },
        Duration::from_secs(10),
        "node never came back online",
    )
    .await;

    let client = cluster.client();
    let job_id = client.submit(spec("echo back", 1)).await.unwrap();
    cluster
        .wait_for_status(&job_id, JobStatus::Completed, Duration::from_secs(10))
        .await;
}

#[tokio::test]
async fn failed_start_rpc_retries_on_another_node() {
    let cluster = TestCluster::start(&[("n1", 1)]).await;
    let client = cluster.client();

    // a ghost node that wins the lexicographic tie-break but refuses every
    // connection
    let dead_port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    {
        let mut state = cluster.master.state.lock().await;
        state.nodes.register(
            "a0".to_string(),
            Address {
                host: "127.0.0.1".to_string(),
                port: dead_port,
            },
            test_gpus(1),
        );
    }

    let job_id = client.submit(spec("echo ok", 1)).await.unwrap();
    cluster
        .wait_for_status(&job_id, JobStatus::Completed, Duration::from_secs(15))
        .await;

    let state = cluster.master.state.lock().await;
    let job = state.jobs.get(&job_id).unwrap();
    assert!(job.retry_count >= 1, "job never bounced off the ghost node");
    assert!(state.nodes.get("a0").unwrap().failure_count >= 1);
}

#[tokio::test]
async fn orphan_jobs_are_reaped_under_the_kill_policy() {
    let mut config = test_master_config();
    config.orphan_policy = OrphanPolicy::Kill;
    let cluster = TestCluster::start_with_config(&[("n1", 1)], config).await;

    let agent_addr = {
        let state = cluster.master.state.lock().await;
        state.nodes.get("n1").unwrap().address.clone()
    };

    // start a job straight on the agent, the way a master that has since
    // restarted once did
    let reply = agent_rpc(
        &agent_addr,
        &Message::Start {
            job_id: "0ddba11f".to_string(),
            command: "sleep 30".to_string(),
            assigned_gpus: vec![0],
            env_extras: HashMap::new(),
            distributed: None,
        },
    )
    .await;
    assert!(matches!(reply, Message::Ack { .. }));

    // the next heartbeat betrays the orphan and the master has it killed
    assert_eventually(
        || async {
            let reply = agent_rpc(&agent_addr, &Message::QueryResources).await;
            matches!(reply, Message::Resources { free_gpus, .. } if free_gpus == vec![0])
        },
        Duration::from_secs(10),
        "orphan job survived the kill policy",
    )
    .await;
}

#[tokio::test]
async fn orphan_jobs_survive_under_the_adopt_policy() {
    let cluster = TestCluster::start(&[("n1", 1)]).await;

    let agent_addr = {
        let state = cluster.master.state.lock().await;
        state.nodes.get("n1").unwrap().address.clone()
    };

    let reply = agent_rpc(
        &agent_addr,
        &Message::Start {
            job_id: "0ddba120".to_string(),
            command: "sleep 3".to_string(),
            assigned_gpus: vec![0],
            env_extras: HashMap::new(),
            distributed: None,
        },
    )
    .await;
    assert!(matches!(reply, Message::Ack { .. }));

    // several heartbeats pass and the job is left alone
    tokio::time::sleep(Duration::from_secs(1)).await;
    let reply = agent_rpc(&agent_addr, &Message::QueryResources).await;
    match reply {
        Message::Resources { free_gpus, .. } => assert!(free_gpus.is_empty()),
        other => panic!("unexpected reply: {other:?}"),
    }
}
