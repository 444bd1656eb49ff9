use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::protocol::{Address, GpuDesc, NodeStatus, NodeView};

/// Start-RPC failures before an online node is demoted to degraded.
const FAILURE_DEGRADE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub node_id: String,
    pub address: Address,
    pub gpus: Vec<GpuDesc>,
    pub free_gpus: BTreeSet<u32>,
    pub last_heartbeat: Instant,
    pub failure_count: u32,
    pub status: NodeStatus,
}

impl NodeEntry {
    fn new(node_id: String, address: Address, gpus: Vec<GpuDesc>) -> Self {
        let free_gpus = gpus.iter().map(|g| g.index).collect();
        Self {
            node_id,
            address,
            gpus,
            free_gpus,
            last_heartbeat: Instant::now(),
            failure_count: 0,
            status: NodeStatus::Online,
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }

    pub fn has_gpu(&self, index: u32) -> bool {
        self.gpus.iter().any(|g| g.index == index)
    }

    /// Free GPUs on this node that also satisfy the advisory memory floor.
    pub fn eligible_gpus(&self, mem_mb: Option<u64>) -> Vec<u32> {
        self.gpus
            .iter()
            .filter(|g| self.free_gpus.contains(&g.index))
            .filter(|g| mem_mb.map_or(true, |floor| g.memory_mb >= floor))
            .map(|g| g.index)
            .collect()
    }
}

/// Registry of every node that ever introduced itself, with liveness state.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: HashMap<String, NodeEntry>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or refresh a node entry. Registration always brings the node
    /// online with every GPU free; GPUs held by jobs the master still tracks
    /// there are re-marked by the caller.
    pub fn register(&mut self, node_id: String, address: Address, gpus: Vec<GpuDesc>) {
        tracing::info!(node_id = %node_id, address = %address, gpus = gpus.len(), "node registered");
        let entry = NodeEntry::new(node_id.clone(), address, gpus);
        self.nodes.insert(node_id, entry);
    }

    /// Refresh liveness from a heartbeat. The failure count decays one per
    /// beat; the node returns online once it drops under the degraded
    /// threshold. Unknown nodes are ignored (the agent re-registers on its
    /// next session).
    pub fn heartbeat(&mut self, node_id: &str) -> bool {
        let Some(node) = self.nodes.get_mut(node_id) else {
            return false;
        };
        node.last_heartbeat = Instant::now();
        node.failure_count = node.failure_count.saturating_sub(1);
        if node.status != NodeStatus::Online && node.failure_count < FAILURE_DEGRADE_THRESHOLD {
            if node.status == NodeStatus::Offline {
                tracing::info!(node_id, "offline node is heartbeating again");
            }
            node.status = NodeStatus::Online;
        }
        true
    }

    /// A command RPC against this node failed.
    pub fn mark_failure(&mut self, node_id: &str) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.failure_count += 1;
            if node.failure_count >= FAILURE_DEGRADE_THRESHOLD
                && node.status == NodeStatus::Online
            {
                tracing::warn!(node_id, failures = node.failure_count, "node degraded");
                node.status = NodeStatus::Degraded;
            }
        }
    }

    /// A command RPC against this node succeeded.
    pub fn mark_success(&mut self, node_id: &str) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.failure_count = 0;
        }
    }

    /// Advance the liveness ladder: online nodes silent past the heartbeat
    /// timeout degrade, degraded nodes silent for a further offline timeout
    /// go offline. Returns the nodes that just went offline.
    pub fn sweep(&mut self, heartbeat_timeout: Duration, offline_timeout: Duration) -> Vec<String> {
        let mut lost = Vec::new();
        for node in self.nodes.values_mut() {
            let silent = node.last_heartbeat.elapsed();
            match node.status {
                NodeStatus::Online if silent > heartbeat_timeout => {
                    tracing::warn!(node_id = %node.node_id, silent = ?silent, "node degraded, heartbeats missing");
                    node.status = NodeStatus::Degraded;
                }
                NodeStatus::Degraded if silent > heartbeat_timeout + offline_timeout => {
                    tracing::error!(node_id = %node.node_id, silent = ?silent, "node offline");
                    node.status = NodeStatus::Offline;
                    lost.push(node.node_id.clone());
                }
                _ => {}
            }
        }
        lost
    }

    pub fn allocate(&mut self, node_id: &str, gpu_ids: &[u32]) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            for id in gpu_ids {
                node.free_gpus.remove(id);
            }
        }
    }

    pub fn release(&mut self, node_id: &str, gpu_ids: &[u32]) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            let known: HashSet<u32> = node.gpus.iter().map(|g| g.index).collect();
            for id in gpu_ids {
                if known.contains(id) {
                    node.free_gpus.insert(*id);
                }
            }
        }
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeEntry> {
        self.nodes.get(node_id)
    }

    pub fn get_mut(&mut self, node_id: &str) -> Option<&mut NodeEntry> {
        self.nodes.get_mut(node_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.values()
    }

    /// Every GPU the cluster has registered, whatever the node's state. The
    /// bound for "can this request ever be satisfied".
    pub fn total_gpus(&self) -> usize {
        self.nodes.values().map(|n| n.gpus.len()).sum()
    }

    pub fn views(&self) -> Vec<NodeView> {
        let mut views: Vec<NodeView> = self
            .nodes
            .values()
            .map(|n| NodeView {
                node_id: n.node_id.clone(),
                status: n.status,
                total_gpus: n.gpus.len(),
                free_gpus: n.free_gpus.iter().copied().collect(),
                failure_count: n.failure_count,
            })
            .collect();
        views.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        views
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
