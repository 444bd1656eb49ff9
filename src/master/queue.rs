use std::collections::HashMap;

use crate::job::{Job, JobStatus};
use crate::protocol::JobView;

/// The master's job table, including scheduling order.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: HashMap<String, Job>,
    next_seq: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, mut job: Job) {
        job.seq = self.next_seq;
        self.next_seq += 1;
        self.jobs.insert(job.id.clone(), job);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    /// Queued job ids in scheduling order: priority descending, then
    /// submission order.
    pub fn queued_in_order(&self) -> Vec<String> {
        let mut queued: Vec<&Job> = self
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .collect();
        queued.sort_by(|a, b| {
            b.spec
                .priority
                .cmp(&a.spec.priority)
                .then(a.seq.cmp(&b.seq))
        });
        queued.into_iter().map(|j| j.id.clone()).collect()
    }

    /// Non-terminal jobs with an assignment touching the given node.
    pub fn running_on_node(&self, node_id: &str) -> Vec<String> {
        self.jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .filter(|j| j.assignment.iter().any(|p| p.node_id == node_id))
            .map(|j| j.id.clone())
            .collect()
    }

    /// Snapshot of the live cluster: queued, running, and cancelling jobs in
    /// submission order.
    pub fn views(&self) -> Vec<JobView> {
        let mut live: Vec<&Job> = self
            .jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .collect();
        live.sort_by_key(|j| j.seq);
        live.into_iter().map(view).collect()
    }

    /// Drop the oldest terminal jobs beyond the retention cap.
    pub fn prune_terminal(&mut self, keep: usize) -> Vec<String> {
        let mut terminal: Vec<(u64, String)> = self
            .jobs
            .values()
            .filter(|j| j.status.is_terminal())
            .map(|j| (j.seq, j.id.clone()))
            .collect();
        if terminal.len() <= keep {
            return Vec::new();
        }
        terminal.sort();
        let drop = terminal.len() - keep;
        let mut removed = Vec::with_capacity(drop);
        for (_, id) in terminal.into_iter().take(drop) {
            self.jobs.remove(&id);
            removed.push(id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

fn view(job: &Job) -> JobView {
    JobView {
        id: job.id.clone(),
        owner: job.spec.owner.clone(),
        command: job.spec.command.clone(),
        status: job.status,
        gpus: job.spec.gpu_count(),
        priority: job.spec.priority,
        submitted_at: job.submitted_at,
        assignment: job.assignment.clone(),
        exit_code: job.exit_code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{DistributedKind, JobSpec};

    fn job(id: &str, priority: i32) -> Job {
        Job::new(
            id.to_string(),
            JobSpec {
                owner: "t".to_string(),
                command: "true".to_string(),
                gpus: 1,
                pins: None,
                priority,
                interactive: false,
                distributed: DistributedKind::None,
                cancel_on_detach: None,
                mem_mb: None,
            },
        )
    }

    #[test]
    fn orders_by_priority_then_submission() {
        let mut queue = JobQueue::new();
        queue.insert(job("j1", 0));
        queue.insert(job("j2", 5));
        queue.insert(job("j3", 5));

        assert_eq!(queue.queued_in_order(), vec!["j2", "j3", "j1"]);
    }

    #[test]
    fn running_jobs_leave_the_order() {
        let mut queue = JobQueue::new();
        queue.insert(job("j1", 0));
        queue.insert(job("j2", 0));
        queue.get_mut("j1").unwrap().status = JobStatus::Running;

        assert_eq!(queue.queued_in_order(), vec!["j2"]);
    }

    #[test]
    fn prunes_oldest_terminal_jobs() {
        let mut queue = JobQueue::new();
        for i in 0..5 {
            let id = format!("j{i}");
            queue.insert(job(&id, 0));
            queue.get_mut(&id).unwrap().status = JobStatus::Completed;
        }
        queue.insert(job("live", 0));

        let removed = queue.prune_terminal(2);
        assert_eq!(removed, vec!["j0", "j1", "j2"]);
        assert!(queue.contains("j3"));
        assert!(queue.contains("live"));
    }
}
