//! The set of nodes jobs are placed on

use gpusim_core::{ClusterConfig, NodeId, Resources, SimError, SimResult};
use tracing::info;

use crate::node::Node;

/// Every node of the simulated cluster, indexed by [`NodeId`]
#[derive(Debug, Clone)]
pub struct Cluster {
    nodes: Vec<Node>,
}

impl Cluster {
    /// Build `racks * nodes_per_rack` identical nodes
    pub fn from_config(config: &ClusterConfig) -> Self {
        let capacity = Resources::new(config.cpus, config.gpus, config.memory);
        let mut nodes = Vec::with_capacity(config.node_count().unwrap_or(0));
        for rack_id in 0..config.racks {
            for _ in 0..config.nodes_per_rack {
                let node_id = nodes.len();
                nodes.push(Node::new(
                    rack_id,
                    node_id,
                    capacity,
                    config.gpu_memory_capacity,
                    config.enable_pack,
                ));
            }
        }

        info!(
            racks = config.racks,
            nodes = nodes.len(),
            capacity = %capacity,
            "Cluster initialized"
        );
        Self { nodes }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [Node] {
        &mut self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, node_id: NodeId) -> SimResult<&Node> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| SimError::InvariantViolation(format!("unknown node {}", node_id)))
    }

    pub fn node_mut(&mut self, node_id: NodeId) -> SimResult<&mut Node> {
        self.nodes
            .get_mut(node_id)
            .ok_or_else(|| SimError::InvariantViolation(format!("unknown node {}", node_id)))
    }

    /// Summed capacity of every node
    pub fn capacity(&self) -> Resources {
        self.nodes.iter().fold(Resources::zero(), |acc, n| {
            let c = n.capacity();
            Resources::new(acc.cpu + c.cpu, acc.gpu + c.gpu, acc.mem + c.mem)
        })
    }

    /// Summed reservations of every node
    pub fn usage(&self) -> Resources {
        self.nodes.iter().fold(Resources::zero(), |acc, n| {
            let u = n.used();
            Resources::new(acc.cpu + u.cpu, acc.gpu + u.gpu, acc.mem + u.mem)
        })
    }

    /// No task reserved or running anywhere
    pub fn is_idle(&self) -> bool {
        self.nodes.iter().all(Node::is_idle)
    }

    /// Fraction of cluster GPUs currently reserved
    pub fn gpu_utilization(&self) -> f64 {
        let total = self.capacity().gpu;
        if total == 0 {
            return 0.0;
        }
        self.usage().gpu as f64 / total as f64
    }
}
