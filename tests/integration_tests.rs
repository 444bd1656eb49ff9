//! End-to-end scenarios over a real master, real agents, and real shells.


use std::time::Duration;

use mgpu_sched::client::{AttachEvent, Attachment};
use mgpu_sched::error::MgpuError;
use mgpu_sched::job::{JobStatus, NodePin};
use mgpu_sched::protocol::codes;

use test_harness::{spec, TestCluster};

/// Drain an attachment to completion; returns (stdout text, code, signal).
async fn drain(attachment: &mut Attachment) -> (String, Option<i32>, Option<i32>) {
    let mut stdout = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), attachment.next_event())
            .await
            .expect("attachment stalled")
            .expect("attachment failed");
        match event {
            AttachEvent::Chunk(mgpu_sched::protocol::StreamKind::Stdout, data) => {
                stdout.extend(data)
            }
            AttachEvent::Chunk(_, _) => {}
            AttachEvent::Exited { code, signal } => {
                return (String::from_utf8_lossy(&stdout).into_owned(), code, signal);
            }
        }
    }
}

#[tokio::test]
async fn single_gpu_hello_interactive() {
    let cluster = TestCluster::start(&[("n1", 1)]).await;
    let client = cluster.client();

    let mut hello = spec("echo hi", 1);
    hello.interactive = true;
    let mut attachment = client.submit_interactive(hello).await.unwrap();
    let job_id = attachment.job_id.clone();

    let (stdout, code, signal) = drain(&mut attachment).await;
    assert!(stdout.contains("=== JOB EXECUTION DEBUG INFO ==="));
    assert!(stdout.contains(&format!("Job ID: {job_id}")));
    assert!(stdout.contains("Target Node ID: n1"));
    assert!(stdout.ends_with("hi\n"));
    assert_eq!(code, Some(0));
    assert_eq!(signal, None);

    cluster
        .wait_for_status(&job_id, JobStatus::Completed, Duration::from_secs(5))
        .await;
    let (jobs, nodes) = client.queue().await.unwrap();
    assert!(jobs.is_empty());
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].free_gpus, vec![0]);
    cluster.assert_gpu_invariants().await;
}

#[tokio::test]
async fn pinned_job_waits_for_the_busy_gpu() {
    let cluster = TestCluster::start(&[("n1", 1), ("n2", 1)]).await;
    let client = cluster.client();
    let pin = NodePin {
        node_id: "n1".to_string(),
        gpu_ids: vec![0],
    };

    let mut first = spec("sleep 2", 0);
    first.pins = Some(vec![pin.clone()]);
    let first_id = client.submit(first).await.unwrap();
    cluster
        .wait_for_status(&first_id, JobStatus::Running, Duration::from_secs(5))
        .await;

    let mut second = spec("sleep 1", 0);
    second.pins = Some(vec![pin]);
    let second_id = client.submit(second).await.unwrap();

    // n2's GPU is free the whole time, but the pin holds the job back
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        cluster.job_status(&second_id).await,
        Some(JobStatus::Queued)
    );
    cluster.assert_gpu_invariants().await;

    cluster
        .wait_for_status(&second_id, JobStatus::Running, Duration::from_secs(10))
        .await;
    {
        let state = cluster.master.state.lock().await;
        let job = state.jobs.get(&second_id).unwrap();
        assert_eq!(job.assignment.len(), 1);
        assert_eq!(job.assignment[0].node_id, "n1");
        assert_eq!(job.assignment[0].gpu_ids, vec![0]);
    }
    cluster
        .wait_for_status(&second_id, JobStatus::Completed, Duration::from_secs(10))
        .await;
}

#[tokio::test]
async fn two_by_one_torch_distributed_spans_nodes() {
    let cluster = TestCluster::start(&[("n1", 1), ("n2", 1)]).await;
    let client = cluster.client();

    let mut job = spec(
        "echo T=$WORLD_SIZE:$RANK:$CUDA_VISIBLE_DEVICES; sleep 1",
        2,
    );
    job.interactive = true;
    job.distributed = mgpu_sched::job::DistributedKind::TorchDistributed;
    let mut attachment = client.submit_interactive(job).await.unwrap();
    let job_id = attachment.job_id.clone();

    cluster
        .wait_for_status(&job_id, JobStatus::Running, Duration::from_secs(5))
        .await;
    {
        let state = cluster.master.state.lock().await;
        let job = state.jobs.get(&job_id).unwrap();
        assert_eq!(job.assignment.len(), 2);
        let mut nodes: Vec<&str> = job
            .assignment
            .iter()
            .map(|p| p.node_id.as_str())
            .collect();
        nodes.sort();
        assert_eq!(nodes, vec!["n1", "n2"]);
        for placement in &job.assignment {
            assert_eq!(placement.gpu_ids, vec![0]);
        }
    }

    let (stdout, code, _) = drain(&mut attachment).await;
    // each rank sees two peers, its own rank, and its GPU remapped to 0
    assert!(stdout.contains("T=2:0:0"), "missing rank 0 in: {stdout}");
    assert!(stdout.contains("T=2:1:0"), "missing rank 1 in: {stdout}");
    assert_eq!(code, Some(0));
}

#[tokio::test]
async fn cancel_during_execution_is_idempotent() {
    let cluster = TestCluster::start(&[("n1", 1)]).await;
    let client = cluster.client();

    let job_id = client
        .submit(spec("sleep 100 & sleep 100 & wait", 1))
        .await
        .unwrap();
    cluster
        .wait_for_status(&job_id, JobStatus::Running, Duration::from_secs(5))
        .await;

    let prior = client.cancel(&job_id).await.unwrap();
    assert_eq!(prior, JobStatus::Running);
    assert_eq!(
        cluster.job_status(&job_id).await,
        Some(JobStatus::Cancelled)
    );

    // cancelling again changes nothing
    let again = client.cancel(&job_id).await.unwrap();
    assert_eq!(again, JobStatus::Cancelled);
    assert_eq!(
        cluster.job_status(&job_id).await,
        Some(JobStatus::Cancelled)
    );

    let (_, nodes) = client.queue().await.unwrap();
    assert_eq!(nodes[0].free_gpus, vec![0]);
    cluster.assert_gpu_invariants().await;
}

#[tokio::test]
async fn cancelling_a_queued_job_never_runs_it() {
    let cluster = TestCluster::start(&[("n1", 1)]).await;
    let client = cluster.client();

    let blocker = client.submit(spec("sleep 3", 1)).await.unwrap();
    cluster
        .wait_for_status(&blocker, JobStatus::Running, Duration::from_secs(5))
        .await;
    let queued = client.submit(spec("echo never", 1)).await.unwrap();

    let prior = client.cancel(&queued).await.unwrap();
    assert_eq!(prior, JobStatus::Queued);
    assert_eq!(
        cluster.job_status(&queued).await,
        Some(JobStatus::Cancelled)
    );

    let prior = client.cancel(&blocker).await.unwrap();
    assert_eq!(prior, JobStatus::Running);
}

#[tokio::test]
async fn priority_order_with_fifo_tie_break() {
    let cluster = TestCluster::start(&[("n1", 1)]).await;
    let client = cluster.client();

    let marker = std::env::temp_dir().join(format!("mgpu-prio-{}", std::process::id()));
    let _ = std::fs::remove_file(&marker);
    let path = marker.display();

    // occupy the only GPU so the next three stack up behind it
    let blocker = client.submit(spec("sleep 2", 1)).await.unwrap();
    cluster
        .wait_for_status(&blocker, JobStatus::Running, Duration::from_secs(5))
        .await;

    let j1 = client
        .submit(spec(&format!("echo j1 >> {path}"), 1))
        .await
        .unwrap();
    let mut high = spec(&format!("echo j2 >> {path}"), 1);
    high.priority = 5;
    let j2 = client.submit(high).await.unwrap();
    let mut late = spec(&format!("echo j3 >> {path}"), 1);
    late.priority = 5;
    let j3 = client.submit(late).await.unwrap();

    for id in [&j1, &j2, &j3] {
        cluster
            .wait_for_status(id, JobStatus::Completed, Duration::from_secs(20))
            .await;
    }
    let contents = std::fs::read_to_string(&marker).unwrap();
    assert_eq!(contents.lines().collect::<Vec<_>>(), vec!["j2", "j3", "j1"]);
    let _ = std::fs::remove_file(&marker);
}

#[tokio::test]
async fn attach_replays_retained_output() {
    let cluster = TestCluster::start(&[("n1", 1)]).await;
    let client = cluster.client();

    let job_id = client
        .submit(spec("echo early; sleep 2", 1))
        .await
        .unwrap();
    cluster
        .wait_for_status(&job_id, JobStatus::Running, Duration::from_secs(5))
        .await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut attachment = client.attach(&job_id).await.unwrap();
    let (stdout, code, _) = drain(&mut attachment).await;
    assert!(stdout.contains("early"), "replay missing: {stdout}");
    assert_eq!(code, Some(0));
}

#[tokio::test]
async fn interactive_disconnect_cancels_the_job() {
    let cluster = TestCluster::start(&[("n1", 1)]).await;
    let client = cluster.client();

    let mut job = spec("sleep 100", 1);
    job.interactive = true;
    let attachment = client.submit_interactive(job).await.unwrap();
    let job_id = attachment.job_id.clone();
    cluster
        .wait_for_status(&job_id, JobStatus::Running, Duration::from_secs(5))
        .await;

    drop(attachment);
    cluster
        .wait_for_status(&job_id, JobStatus::Cancelled, Duration::from_secs(10))
        .await;
    let (_, nodes) = client.queue().await.unwrap();
    assert_eq!(nodes[0].free_gpus, vec![0]);
}

#[tokio::test]
async fn unknown_job_is_reported_as_such() {
    let cluster = TestCluster::start(&[("n1", 1)]).await;
    let client = cluster.client();

    match client.cancel("00000000").await {
        Err(MgpuError::Remote { code, .. }) => assert_eq!(code, codes::UNKNOWN_JOB),
        other => panic!("unexpected result: {other:?}"),
    }
    match client.attach("00000000").await {
        Err(MgpuError::Remote { code, .. }) => assert_eq!(code, codes::UNKNOWN_JOB),
        other => panic!("unexpected result: {:?}", other.err()),
    }
}

#[tokio::test]
async fn oversized_requests_are_refused_up_front() {
    let cluster = TestCluster::start(&[("n1", 1)]).await;
    let client = cluster.client();

    match client.submit(spec("echo no", 2)).await {
        Err(MgpuError::Remote { code, .. }) => assert_eq!(code, codes::UNSATISFIABLE),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn pin_to_an_unknown_node_is_invalid() {
    let cluster = TestCluster::start(&[("n1", 1)]).await;
    let client = cluster.client();

    let mut job = spec("echo no", 0);
    job.pins = Some(vec![NodePin {
        node_id: "ghost".to_string(),
        gpu_ids: vec![0],
    }]);
    match client.submit(job).await {
        Err(MgpuError::Remote { code, .. }) => assert_eq!(code, codes::INVALID_SPEC),
        other => panic!("unexpected result: {other:?}"),
    }
}
