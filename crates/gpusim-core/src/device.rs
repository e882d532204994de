//! Per-accelerator memory ledger

use std::collections::BTreeMap;

use crate::{NodeId, TaskKey};

/// Memory ledger for a single accelerator on a node
///
/// Capacity and usage are tracked in MiB.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    /// Device index on its node
    pub index: u32,
    /// Node hosting the device
    pub node_id: NodeId,
    /// Total memory in MiB
    memory: f64,
    /// Memory attributed to each task executing on the device
    allocations: BTreeMap<TaskKey, f64>,
}

impl Device {
    /// Create an idle device
    pub fn new(index: u32, node_id: NodeId, memory: f64) -> Self {
        Self {
            index,
            node_id,
            memory,
            allocations: BTreeMap::new(),
        }
    }

    /// Memory capacity in MiB
    pub fn memory(&self) -> f64 {
        self.memory
    }

    /// Memory currently attributed to tasks, in MiB
    pub fn get_current_memory(&self) -> f64 {
        self.allocations.values().sum()
    }

    /// Memory left before the device is full
    pub fn headroom(&self) -> f64 {
        self.memory - self.get_current_memory()
    }

    /// Number of tasks attributed to this device
    pub fn task_count(&self) -> usize {
        self.allocations.len()
    }

    pub fn hosts(&self, task: &TaskKey) -> bool {
        self.allocations.contains_key(task)
    }

    /// Attribute `mib` of memory to `task`
    pub fn allocate(&mut self, task: TaskKey, mib: f64) {
        *self.allocations.entry(task).or_insert(0.0) += mib;
    }

    /// Drop the entry of `task`, returning the memory it held
    pub fn release(&mut self, task: &TaskKey) -> Option<f64> {
        self.allocations.remove(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobKey;
    use slotmap::SlotMap;

    #[test]
    fn test_device_memory_accounting() {
        let mut arena: SlotMap<JobKey, ()> = SlotMap::with_key();
        let job = arena.insert(());
        let task = TaskKey::new(job, 0);

        let mut device = Device::new(0, 3, 16_000.0);
        assert_eq!(device.get_current_memory(), 0.0);
        assert_eq!(device.headroom(), 16_000.0);

        device.allocate(task, 4_000.0);
        assert!(device.hosts(&task));
        assert_eq!(device.task_count(), 1);
        assert_eq!(device.get_current_memory(), 4_000.0);
        assert_eq!(device.headroom(), 12_000.0);

        assert_eq!(device.release(&task), Some(4_000.0));
        assert_eq!(device.release(&task), None);
        assert_eq!(device.memory(), 16_000.0);
        assert_eq!(device.get_current_memory(), 0.0);
    }
}
