//! State-level tests of placement and queue ordering; no sockets involved.

use mgpu_sched::job::{DistributedKind, Job, JobSpec, JobStatus, NodePin};
use mgpu_sched::master::scheduler::next_launch;
use mgpu_sched::master::ClusterState;
use mgpu_sched::protocol::{Address, GpuDesc, NodeStatus};

fn gpus(count: u32) -> Vec<GpuDesc> {
    (0..count)
        .map(|index| GpuDesc {
            index,
            model: "FakeGPU".to_string(),
            memory_mb: 16384,
        })
        .collect()
}

fn addr(port: u16) -> Address {
    Address {
        host: "127.0.0.1".to_string(),
        port,
    }
}

fn spec(gpus: u32) -> JobSpec {
    JobSpec {
        owner: "test".to_string(),
        command: "true".to_string(),
        gpus,
        pins: None,
        priority: 0,
        interactive: false,
        distributed: DistributedKind::None,
        cancel_on_detach: None,
        mem_mb: None,
    }
}

fn submit(state: &mut ClusterState, id: &str, spec: JobSpec) {
    state.jobs.insert(Job::new(id.to_string(), spec));
}

#[test]
fn prefers_a_single_node_with_lexicographic_tie_break() {
    let mut state = ClusterState::new();
    state.nodes.register("n2".to_string(), addr(1), gpus(4));
    state.nodes.register("n1".to_string(), addr(2), gpus(4));
    submit(&mut state, "job1", spec(2));

    let plan = next_launch(&mut state).expect("placement");
    assert_eq!(plan.targets.len(), 1);
    assert_eq!(plan.targets[0].node_id, "n1");
    assert_eq!(plan.targets[0].gpu_ids, vec![0, 1]);
    assert_eq!(
        state.jobs.get("job1").unwrap().status,
        JobStatus::Running
    );
    assert_eq!(state.nodes.get("n1").unwrap().free_gpus.len(), 2);
}

#[test]
fn failure_count_breaks_single_node_ties() {
    let mut state = ClusterState::new();
    state.nodes.register("n1".to_string(), addr(1), gpus(1));
    state.nodes.register("n2".to_string(), addr(2), gpus(1));
    state.nodes.mark_failure("n1");
    submit(&mut state, "job1", spec(1));

    let plan = next_launch(&mut state).expect("placement");
    assert_eq!(plan.targets[0].node_id, "n2");
}

#[test]
fn spreads_over_nodes_when_no_single_node_fits() {
    let mut state = ClusterState::new();
    state.nodes.register("n1".to_string(), addr(1), gpus(2));
    state.nodes.register("n2".to_string(), addr(2), gpus(1));
    submit(&mut state, "job1", spec(3));

    let plan = next_launch(&mut state).expect("placement");
    assert_eq!(plan.targets.len(), 2);
    // the node with the most free GPUs comes first and is rank 0
    assert_eq!(plan.targets[0].node_id, "n1");
    assert_eq!(plan.targets[0].gpu_ids.len(), 2);
    assert_eq!(plan.targets[0].rank, 0);
    assert_eq!(plan.targets[1].node_id, "n2");
    assert_eq!(plan.targets[1].rank, 1);

    assert!(state.nodes.get("n1").unwrap().free_gpus.is_empty());
    assert!(state.nodes.get("n2").unwrap().free_gpus.is_empty());
}

#[test]
fn insufficient_capacity_leaves_the_job_queued() {
    let mut state = ClusterState::new();
    state.nodes.register("n1".to_string(), addr(1), gpus(1));
    submit(&mut state, "job1", spec(4));

    assert!(next_launch(&mut state).is_none());
    assert_eq!(state.jobs.get("job1").unwrap().status, JobStatus::Queued);
}

#[test]
fn lower_priority_job_runs_when_the_head_does_not_fit() {
    let mut state = ClusterState::new();
    state.nodes.register("n1".to_string(), addr(1), gpus(1));

    let mut big = spec(4);
    big.priority = 10;
    submit(&mut state, "big", big);
    submit(&mut state, "small", spec(1));

    let plan = next_launch(&mut state).expect("placement");
    assert_eq!(plan.job_id, "small");
    assert_eq!(state.jobs.get("big").unwrap().status, JobStatus::Queued);
}

#[test]
fn pinned_job_waits_for_its_exact_gpus() {
    let mut state = ClusterState::new();
    state.nodes.register("n1".to_string(), addr(1), gpus(2));

    let mut pinned = spec(0);
    pinned.pins = Some(vec![NodePin {
        node_id: "n1".to_string(),
        gpu_ids: vec![1],
    }]);
    submit(&mut state, "pinned", pinned);

    state.nodes.allocate("n1", &[1]);
    assert!(next_launch(&mut state).is_none());
    assert_eq!(state.jobs.get("pinned").unwrap().status, JobStatus::Queued);

    state.nodes.release("n1", &[1]);
    let plan = next_launch(&mut state).expect("placement");
    assert_eq!(plan.targets[0].node_id, "n1");
    assert_eq!(plan.targets[0].gpu_ids, vec![1]);
}

#[test]
fn pin_to_an_offline_node_fails_the_job() {
    let mut state = ClusterState::new();
    state.nodes.register("n1".to_string(), addr(1), gpus(1));
    state.nodes.get_mut("n1").unwrap().status = NodeStatus::Offline;

    let mut pinned = spec(0);
    pinned.pins = Some(vec![NodePin {
        node_id: "n1".to_string(),
        gpu_ids: vec![0],
    }]);
    submit(&mut state, "pinned", pinned);

    assert!(next_launch(&mut state).is_none());
    let job = state.jobs.get("pinned").unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.failure.as_deref().unwrap().contains("offline"));
}

#[test]
fn memory_floor_excludes_small_gpus() {
    let mut state = ClusterState::new();
    let mut inventory = gpus(2);
    inventory[0].memory_mb = 8192;
    state.nodes.register("n1".to_string(), addr(1), inventory);

    let mut job = spec(1);
    job.mem_mb = Some(10000);
    submit(&mut state, "job1", job);

    let plan = next_launch(&mut state).expect("placement");
    assert_eq!(plan.targets[0].gpu_ids, vec![1]);
}

#[test]
fn retire_releases_gpus_and_is_final() {
    let mut state = ClusterState::new();
    state.nodes.register("n1".to_string(), addr(1), gpus(2));
    submit(&mut state, "job1", spec(2));

    next_launch(&mut state).expect("placement");
    assert!(state.nodes.get("n1").unwrap().free_gpus.is_empty());

    assert!(state.retire("job1", JobStatus::Completed, Some(0), None, None));
    assert_eq!(state.nodes.get("n1").unwrap().free_gpus.len(), 2);

    // a second retirement attempt does nothing
    assert!(!state.retire("job1", JobStatus::Failed, Some(1), None, None));
    assert_eq!(
        state.jobs.get("job1").unwrap().status,
        JobStatus::Completed
    );
}

#[test]
fn rollback_requeues_until_the_retry_budget_is_spent() {
    let mut state = ClusterState::new();
    state.nodes.register("n1".to_string(), addr(1), gpus(1));
    submit(&mut state, "job1", spec(1));

    for attempt in 1..=5u32 {
        next_launch(&mut state).expect("placement");
        state.rollback_launch("job1", 5, "start on n1 failed");
        let job = state.jobs.get("job1").unwrap();
        assert_eq!(job.status, JobStatus::Queued, "attempt {attempt}");
        assert_eq!(job.retry_count, attempt);
        assert_eq!(state.nodes.get("n1").unwrap().free_gpus.len(), 1);
    }

    next_launch(&mut state).expect("placement");
    state.rollback_launch("job1", 5, "start on n1 failed");
    let job = state.jobs.get("job1").unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.failure.as_deref().unwrap().contains("retries exhausted"));
    assert_eq!(state.nodes.get("n1").unwrap().free_gpus.len(), 1);
}

#[test]
fn degraded_nodes_are_not_scheduled() {
    let mut state = ClusterState::new();
    state.nodes.register("n1".to_string(), addr(1), gpus(1));
    for _ in 0..3 {
        state.nodes.mark_failure("n1");
    }
    submit(&mut state, "job1", spec(1));

    assert!(next_launch(&mut state).is_none());
    assert_eq!(state.jobs.get("job1").unwrap().status, JobStatus::Queued);
}
