//! Node resource accounting and task placement transactions

use gpusim_core::{
    Device, Job, JobKey, JobStatus, NodeId, ResourceLedger, Resources, SimError, SimResult, Task,
    TaskId, TaskKey, TaskState,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Headroom in MiB an accelerator must keep beyond a task's peak footprint
pub const PACK_SAFETY_MARGIN_MIB: f64 = 500.0;

/// A host with fixed CPU/GPU/memory capacity and a table of accelerators
///
/// The node is the only owner of its usage counters and task tables. A task
/// key is in at most one of `placed_tasks` and `running_tasks`, and the
/// ledger always equals the summed demand of those two tables.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    node_id: NodeId,
    rack_id: u32,
    enable_pack: bool,
    ledger: ResourceLedger,
    devices: Vec<Device>,
    /// Reserved, not yet started
    placed_tasks: BTreeMap<TaskKey, Resources>,
    /// Executing
    running_tasks: BTreeMap<TaskKey, Resources>,
    /// Release history
    finished_tasks: Vec<TaskKey>,
    /// Jobs with at least one task reserved or running here
    placed_jobs: BTreeSet<JobKey>,
}

impl Node {
    /// Create an empty node with one device per GPU
    pub fn new(
        rack_id: u32,
        node_id: NodeId,
        capacity: Resources,
        gpu_memory_capacity: f64,
        enable_pack: bool,
    ) -> Self {
        let devices = (0..capacity.gpu)
            .map(|idx| Device::new(idx, node_id, gpu_memory_capacity))
            .collect();

        Self {
            node_id,
            rack_id,
            enable_pack,
            ledger: ResourceLedger::new(capacity),
            devices,
            placed_tasks: BTreeMap::new(),
            running_tasks: BTreeMap::new(),
            finished_tasks: Vec::new(),
            placed_jobs: BTreeSet::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn rack_id(&self) -> u32 {
        self.rack_id
    }

    pub fn enable_pack(&self) -> bool {
        self.enable_pack
    }

    pub fn capacity(&self) -> Resources {
        self.ledger.capacity()
    }

    pub fn used(&self) -> Resources {
        self.ledger.used()
    }

    pub fn cpu_free(&self) -> u32 {
        self.ledger.free().cpu
    }

    pub fn gpu_free(&self) -> u32 {
        self.ledger.free().gpu
    }

    pub fn mem_free(&self) -> u64 {
        self.ledger.free().mem
    }

    /// Whether any dimension still has free capacity
    pub fn is_free(&self) -> bool {
        self.gpu_free() > 0 || self.cpu_free() > 0 || self.mem_free() > 0
    }

    /// Utilization fractions (cpu, gpu, mem)
    pub fn check_util(&self) -> (f64, f64, f64) {
        fn ratio(used: f64, total: f64) -> f64 {
            if total > 0.0 {
                used / total
            } else {
                0.0
            }
        }
        let used = self.used();
        let cap = self.capacity();
        (
            ratio(used.cpu as f64, cap.cpu as f64),
            ratio(used.gpu as f64, cap.gpu as f64),
            ratio(used.mem as f64, cap.mem as f64),
        )
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn placed_tasks(&self) -> &BTreeMap<TaskKey, Resources> {
        &self.placed_tasks
    }

    pub fn running_tasks(&self) -> &BTreeMap<TaskKey, Resources> {
        &self.running_tasks
    }

    pub fn finished_tasks(&self) -> &[TaskKey] {
        &self.finished_tasks
    }

    pub fn placed_jobs(&self) -> &BTreeSet<JobKey> {
        &self.placed_jobs
    }

    /// No task reserved or running
    pub fn is_idle(&self) -> bool {
        self.placed_tasks.is_empty() && self.running_tasks.is_empty()
    }

    fn resides(&self, task: &TaskKey) -> bool {
        self.placed_tasks.contains_key(task) || self.running_tasks.contains_key(task)
    }

    fn hosts_any_task_of(&self, job: JobKey) -> bool {
        self.placed_tasks
            .keys()
            .chain(self.running_tasks.keys())
            .any(|k| k.job == job)
    }

    /// Strict single-task check: every free dimension covers the demand
    pub fn can_fit(&self, task: &Task) -> bool {
        self.ledger.fits(&task.demand)
    }

    /// Estimate how many tasks of a homogeneous batch fit
    ///
    /// Without `pack`, each dimension is evaluated as `free / demand` using the
    /// first task as representative, capped at the batch size, and the minimum
    /// is returned. With `pack`, the result counts accelerator opportunities
    /// instead (see [`Self::can_fit_num_with_pack`]).
    pub fn can_fit_num_task(&self, tasks: &[&Task], pack: bool) -> usize {
        if pack {
            return self.can_fit_num_with_pack(tasks);
        }

        let Some(first) = tasks.first() else {
            return 0;
        };
        let n = tasks.len();
        let free = self.ledger.free();

        let cpus = fit_dimension(free.cpu as u64, first.demand.cpu as u64, n);
        let gpus = fit_dimension(free.gpu as u64, first.demand.gpu as u64, n);
        let mems = fit_dimension(free.mem, first.demand.mem, n);
        cpus.min(gpus).min(mems)
    }

    /// Count, for each task with enough coarse capacity, the accelerators that
    /// keep more than the safety margin after hosting its peak footprint
    ///
    /// This is an admission heuristic, not a task-to-device assignment.
    pub fn can_fit_num_with_pack(&self, tasks: &[&Task]) -> usize {
        let mut count = 0;
        for task in tasks {
            if !self.can_fit(task) {
                continue;
            }
            count += self
                .devices
                .iter()
                .filter(|d| {
                    d.memory() - (d.get_current_memory() + task.gpu_memory_max)
                        > PACK_SAFETY_MARGIN_MIB
                })
                .count();
        }
        count
    }

    /// Reserve a task's demand and register it as placed
    ///
    /// Returns `Ok(false)` if the task does not fit.
    pub fn try_reserve_and_placed_task(&mut self, key: TaskKey, task: &Task) -> SimResult<bool> {
        if self.resides(&key) {
            return Err(SimError::InvariantViolation(format!(
                "task {} of job {:?} is already on node {}",
                key.task, key.job, self.node_id
            )));
        }
        if !self.can_fit(task) {
            return Ok(false);
        }
        self.ledger.reserve(&task.demand)?;
        self.placed_tasks.insert(key, task.demand);
        Ok(true)
    }

    /// Register the job as placed here
    ///
    /// With `count_task_in_current_node`, every task of the job must reside on
    /// this node; otherwise a single local task is enough.
    pub fn try_reserve_and_placed_job(
        &mut self,
        key: JobKey,
        job: &Job,
        count_task_in_current_node: bool,
    ) -> bool {
        let mut local = job.tasks.keys().map(|id| self.resides(&TaskKey::new(key, *id)));
        let found = if count_task_in_current_node {
            !job.tasks.is_empty() && local.all(|r| r)
        } else {
            local.any(|r| r)
        };

        if found {
            self.placed_jobs.insert(key);
        }
        found
    }

    /// Place every unplaced task of `job` on this node, all or nothing
    pub fn try_alloc_job(
        &mut self,
        key: JobKey,
        job: &mut Job,
        count_task_in_current_node: bool,
    ) -> SimResult<bool> {
        let task_ids: Vec<TaskId> = job.unplaced_tasks().map(|t| t.task_id).collect();
        self.try_alloc_tasks(key, job, &task_ids, count_task_in_current_node)
    }

    /// Place the given tasks of `job` on this node as one transaction
    ///
    /// On any failure after the first reservation, every task reserved by
    /// this call is released and unrecorded, and the job entry is dropped
    /// if this call created it: node and job are left as they were.
    pub fn try_alloc_tasks(
        &mut self,
        key: JobKey,
        job: &mut Job,
        task_ids: &[TaskId],
        count_task_in_current_node: bool,
    ) -> SimResult<bool> {
        let tasks = task_ids
            .iter()
            .map(|id| {
                job.tasks.get(id).ok_or_else(|| {
                    SimError::InvariantViolation(format!("job {} has no task {}", job.job_id, id))
                })
            })
            .collect::<SimResult<Vec<&Task>>>()?;

        let worker_tasks = self.can_fit_num_task(&tasks, false);
        if tasks.is_empty() || worker_tasks < tasks.len() {
            debug!(
                job_id = job.job_id,
                node_id = self.node_id,
                fits = worker_tasks,
                needed = tasks.len(),
                "Job does not fit on node"
            );
            return Ok(false);
        }

        let prior_status = job.status;
        let was_registered = self.placed_jobs.contains(&key);
        let mut placed = Vec::with_capacity(task_ids.len());

        for id in task_ids {
            let task_key = TaskKey::new(key, *id);
            match self.try_reserve_and_placed_task(task_key, &job.tasks[id]) {
                Ok(true) => {
                    job.tasks_running_on.insert(*id, self.node_id);
                    if let Some(task) = job.tasks.get_mut(id) {
                        task.state = TaskState::Placed;
                    }
                    placed.push(*id);
                }
                Ok(false) => {}
                Err(e) => {
                    self.rollback(key, job, &placed, was_registered)?;
                    job.status = prior_status;
                    return Err(e);
                }
            }
        }

        if placed.is_empty() {
            return Ok(false);
        }

        if !self.try_reserve_and_placed_job(key, job, count_task_in_current_node) {
            self.rollback(key, job, &placed, was_registered)?;
            job.status = prior_status;
            warn!(
                job_id = job.job_id,
                node_id = self.node_id,
                "Released: job does not fit on node"
            );
            return Ok(false);
        }

        job.status = JobStatus::Placed;
        info!(
            job_id = job.job_id,
            tasks = placed.len(),
            node_id = self.node_id,
            "Placed job tasks on node"
        );
        Ok(true)
    }

    fn rollback(
        &mut self,
        key: JobKey,
        job: &mut Job,
        placed: &[TaskId],
        was_registered: bool,
    ) -> SimResult<()> {
        for id in placed {
            if let Some(demand) = self.placed_tasks.remove(&TaskKey::new(key, *id)) {
                self.ledger.release(&demand)?;
            }
            job.tasks_running_on.remove(id);
            if let Some(task) = job.tasks.get_mut(id) {
                task.state = TaskState::Queued;
            }
        }
        if !was_registered {
            self.placed_jobs.remove(&key);
        }
        Ok(())
    }

    /// Start every task of `job` hosted here
    ///
    /// Returns the job key if the job is now running on all of its nodes,
    /// together with the number of tasks started by this call.
    pub fn execute_job(
        &mut self,
        key: JobKey,
        job: &mut Job,
        now: u64,
    ) -> SimResult<(Option<JobKey>, usize)> {
        if !self.placed_jobs.contains(&key) {
            return Err(SimError::InvariantViolation(format!(
                "job {} is not placed on node {}",
                job.job_id, self.node_id
            )));
        }
        if !job.tasks_running_on.values().any(|n| *n == self.node_id) {
            return Err(SimError::InvariantViolation(format!(
                "node {} is not among the hosts of job {}",
                self.node_id, job.job_id
            )));
        }

        let contended = self.running_tasks.keys().any(|k| k.job != key);
        let local: Vec<TaskId> = job
            .tasks_running_on
            .iter()
            .filter(|(_, node)| **node == self.node_id)
            .map(|(id, _)| *id)
            .collect();

        let mut started_task_count = 0;
        for id in local {
            let task_key = TaskKey::new(key, id);
            let Some(demand) = self.placed_tasks.remove(&task_key) else {
                continue;
            };
            self.running_tasks.insert(task_key, demand);

            let task = job.tasks.get_mut(&id).ok_or_else(|| {
                SimError::InvariantViolation(format!("job {} has no task {}", job.job_id, id))
            })?;
            task.execute(now);
            if task.demand.gpu > 0 {
                if let Some(device) = self.devices.iter_mut().reduce(|best, d| {
                    let roomier = d.headroom() > best.headroom()
                        || (d.headroom() == best.headroom() && d.task_count() < best.task_count());
                    if roomier {
                        d
                    } else {
                        best
                    }
                }) {
                    device.allocate(task_key, task.gpu_memory_avg);
                }
            }
            if contended && task.mark_interfered() {
                debug!(
                    job_id = job.job_id,
                    task_id = id,
                    node_id = self.node_id,
                    "Task co-located with another job, marked interfered"
                );
            }
            started_task_count += 1;
        }

        let ready = job.try_execute(now);
        Ok((ready.then_some(key), started_task_count))
    }

    /// Remove a task from the placed or running table
    ///
    /// Drops the job entry once none of its tasks remain here. Resources stay
    /// reserved until [`Self::release_allocated_resources`] is called.
    pub fn remove_task(&mut self, key: TaskKey) -> Option<Resources> {
        let demand = self
            .placed_tasks
            .remove(&key)
            .or_else(|| self.running_tasks.remove(&key))?;
        if !self.hosts_any_task_of(key.job) {
            self.placed_jobs.remove(&key.job);
        }
        Some(demand)
    }

    /// Cancel the reservation of a task that never started
    ///
    /// Unlike [`Self::release_allocated_resources`] this leaves the release
    /// history and every device untouched. Returns `Ok(None)` if the task is
    /// not reserved here.
    pub fn unreserve_task(&mut self, key: TaskKey) -> SimResult<Option<Resources>> {
        if self.running_tasks.contains_key(&key) {
            return Err(SimError::InvariantViolation(format!(
                "task {} of job {:?} is already running on node {}",
                key.task, key.job, self.node_id
            )));
        }
        let Some(demand) = self.placed_tasks.remove(&key) else {
            return Ok(None);
        };
        self.ledger.release(&demand)?;
        if !self.hosts_any_task_of(key.job) {
            self.placed_jobs.remove(&key.job);
        }
        Ok(Some(demand))
    }

    /// Give back the resources of a removed task
    ///
    /// Returns the reduced-interference set: when the task shared the node
    /// with running tasks of other jobs, those tasks and the released task
    /// itself; otherwise an empty set.
    pub fn release_allocated_resources(
        &mut self,
        key: TaskKey,
        demand: &Resources,
    ) -> SimResult<BTreeSet<TaskKey>> {
        if self.resides(&key) {
            return Err(SimError::InvariantViolation(format!(
                "task {} of job {:?} released while still resident on node {}",
                key.task, key.job, self.node_id
            )));
        }
        self.ledger.release(demand)?;
        for device in &mut self.devices {
            device.release(&key);
        }
        self.finished_tasks.push(key);

        let mut reduced: BTreeSet<TaskKey> = self
            .running_tasks
            .keys()
            .filter(|k| k.job != key.job)
            .copied()
            .collect();
        if !reduced.is_empty() {
            reduced.insert(key);
        }
        Ok(reduced)
    }
}

fn fit_dimension(free: u64, per_task: u64, batch: usize) -> usize {
    if per_task == 0 {
        return batch;
    }
    usize::try_from(free / per_task).map_or(batch, |n| n.min(batch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn node(cpu: u32, gpu: u32, mem: u64) -> Node {
        Node::new(0, 0, Resources::new(cpu, gpu, mem), 16_000.0, false)
    }

    fn job(task_count: usize, demand: Resources) -> Job {
        Job::new(1, 0.0, 10.0, task_count, demand)
    }

    fn reserved_sum(node: &Node) -> Resources {
        node.placed_tasks()
            .values()
            .chain(node.running_tasks().values())
            .fold(Resources::zero(), |acc, d| {
                Resources::new(acc.cpu + d.cpu, acc.gpu + d.gpu, acc.mem + d.mem)
            })
    }

    #[test]
    fn test_can_fit_until_gpus_run_out() {
        let mut n = node(8, 2, 16);
        let mut arena: SlotMap<JobKey, ()> = SlotMap::with_key();
        let key = arena.insert(());
        let task = Task::new(0, Resources::new(4, 1, 8), 5.0);

        assert!(n.can_fit(&task));
        assert!(n.try_reserve_and_placed_task(TaskKey::new(key, 0), &task).unwrap());

        let second = Task::new(1, Resources::new(4, 1, 8), 5.0);
        assert!(n.can_fit(&second));
        assert!(n.try_reserve_and_placed_task(TaskKey::new(key, 1), &second).unwrap());

        let third = Task::new(2, Resources::new(0, 1, 0), 5.0);
        assert!(!n.can_fit(&third));
    }

    #[test]
    fn test_can_fit_second_task_rejected_on_gpu() {
        let mut n = node(8, 1, 16);
        let mut arena: SlotMap<JobKey, ()> = SlotMap::with_key();
        let key = arena.insert(());
        let task = Task::new(0, Resources::new(4, 1, 8), 5.0);

        assert!(n.try_reserve_and_placed_task(TaskKey::new(key, 0), &task).unwrap());
        let second = Task::new(1, Resources::new(4, 1, 8), 5.0);
        assert!(!n.can_fit(&second));
        assert!(!n.try_reserve_and_placed_task(TaskKey::new(key, 1), &second).unwrap());
        assert_eq!(n.used(), Resources::new(4, 1, 8));
    }

    #[test]
    fn test_can_fit_num_task_takes_minimum_dimension() {
        let n = node(8, 4, 12);
        let j = job(4, Resources::new(2, 1, 4));
        let tasks: Vec<&Task> = j.tasks.values().collect();

        // cpu 4, gpu 4, mem 3
        assert_eq!(n.can_fit_num_task(&tasks, false), 3);
        assert_eq!(n.can_fit_num_task(&tasks[..2], false), 2);
        assert_eq!(n.can_fit_num_task(&[], false), 0);
    }

    #[test]
    fn test_can_fit_num_task_ignores_zero_demand() {
        let n = node(8, 0, 16);
        let j = job(3, Resources::new(1, 0, 1));
        let tasks: Vec<&Task> = j.tasks.values().collect();
        assert_eq!(n.can_fit_num_task(&tasks, false), 3);
    }

    #[test]
    fn test_pack_counts_device_opportunities() {
        let n = Node::new(0, 0, Resources::new(16, 2, 32), 8_000.0, true);
        let mut j = job(2, Resources::new(1, 1, 1));
        for task in j.tasks.values_mut() {
            task.gpu_memory_max = 6_000.0;
        }
        let tasks: Vec<&Task> = j.tasks.values().collect();
        // each task sees both devices with 2000 MiB headroom
        assert_eq!(n.can_fit_num_task(&tasks, true), 4);

        let mut big = job(1, Resources::new(1, 1, 1));
        big.tasks.get_mut(&0).unwrap().gpu_memory_max = 7_600.0;
        let tasks: Vec<&Task> = big.tasks.values().collect();
        assert_eq!(n.can_fit_num_task(&tasks, true), 0);
    }

    #[test]
    fn test_pack_skips_tasks_without_coarse_capacity() {
        let n = Node::new(0, 0, Resources::new(1, 2, 32), 8_000.0, true);
        let j = job(1, Resources::new(2, 1, 1));
        let tasks: Vec<&Task> = j.tasks.values().collect();
        assert_eq!(n.can_fit_num_task(&tasks, true), 0);
    }

    #[test]
    fn test_try_alloc_job_places_every_task() {
        let mut n = node(8, 2, 16);
        let mut arena: SlotMap<JobKey, ()> = SlotMap::with_key();
        let key = arena.insert(());
        let mut j = job(2, Resources::new(2, 1, 4));

        assert!(n.try_alloc_job(key, &mut j, true).unwrap());
        assert_eq!(n.used(), Resources::new(4, 2, 8));
        assert_eq!(n.placed_tasks().len(), 2);
        assert!(n.placed_jobs().contains(&key));
        assert_eq!(j.status, JobStatus::Placed);
        assert_eq!(j.tasks_running_on.len(), 2);
        assert!(j.tasks_running_on.values().all(|id| *id == 0));
        assert_eq!(reserved_sum(&n), n.used());
    }

    #[test]
    fn test_try_alloc_job_rejects_when_estimate_short() {
        let mut n = node(8, 1, 16);
        let mut arena: SlotMap<JobKey, ()> = SlotMap::with_key();
        let key = arena.insert(());
        let mut j = job(2, Resources::new(2, 1, 4));
        let before = n.clone();

        assert!(!n.try_alloc_job(key, &mut j, false).unwrap());
        assert_eq!(n, before);
        assert!(j.tasks_running_on.is_empty());
        assert_eq!(j.status, JobStatus::Queued);
    }

    #[test]
    fn test_try_alloc_rolls_back_on_job_registration_failure() {
        let mut n = node(8, 2, 16);
        let mut arena: SlotMap<JobKey, ()> = SlotMap::with_key();
        let key = arena.insert(());
        let mut j = job(2, Resources::new(2, 1, 4));
        // task 0 already lives on another node
        j.tasks_running_on.insert(0, 9);
        let before = n.clone();
        let job_before = j.clone();

        assert!(!n.try_alloc_tasks(key, &mut j, &[1], true).unwrap());
        assert_eq!(n, before);
        assert_eq!(j.tasks_running_on, job_before.tasks_running_on);
        assert_eq!(j.tasks[&1].state, TaskState::Queued);
        assert_eq!(j.status, job_before.status);
    }

    #[test]
    fn test_multi_node_registration_accepts_partial_hosting() {
        let mut n = node(8, 2, 16);
        let mut arena: SlotMap<JobKey, ()> = SlotMap::with_key();
        let key = arena.insert(());
        let mut j = job(2, Resources::new(2, 1, 4));
        j.tasks_running_on.insert(0, 9);

        assert!(n.try_alloc_tasks(key, &mut j, &[1], false).unwrap());
        assert_eq!(n.placed_tasks().len(), 1);
        assert_eq!(j.tasks_running_on[&1], 0);
    }

    #[test]
    fn test_execute_job_starts_local_tasks() {
        let mut n = node(8, 2, 16);
        let mut arena: SlotMap<JobKey, ()> = SlotMap::with_key();
        let key = arena.insert(());
        let mut j = job(2, Resources::new(2, 1, 4));
        n.try_alloc_job(key, &mut j, true).unwrap();

        let (ready, started) = n.execute_job(key, &mut j, 5).unwrap();
        assert_eq!(ready, Some(key));
        assert_eq!(started, 2);
        assert!(n.placed_tasks().is_empty());
        assert_eq!(n.running_tasks().len(), 2);
        assert_eq!(j.status, JobStatus::Running);
        assert_eq!(j.tasks[&0].started_at, Some(5));
        // one task per device, picked by headroom
        assert!(n.devices().iter().all(|d| d.task_count() == 1));
        assert!(!j.tasks[&0].interfered);
    }

    #[test]
    fn test_execute_job_partial_when_tasks_elsewhere() {
        let mut n = node(8, 2, 16);
        let mut arena: SlotMap<JobKey, ()> = SlotMap::with_key();
        let key = arena.insert(());
        let mut j = job(2, Resources::new(2, 1, 4));
        j.tasks_running_on.insert(0, 9);
        n.try_alloc_tasks(key, &mut j, &[1], false).unwrap();

        let (ready, started) = n.execute_job(key, &mut j, 1).unwrap();
        assert_eq!(ready, None);
        assert_eq!(started, 1);
        assert_eq!(j.status, JobStatus::Placed);
    }

    #[test]
    fn test_execute_unknown_job_is_invariant_violation() {
        let mut n = node(8, 2, 16);
        let mut arena: SlotMap<JobKey, ()> = SlotMap::with_key();
        let key = arena.insert(());
        let mut j = job(1, Resources::new(1, 1, 1));

        let err = n.execute_job(key, &mut j, 0).unwrap_err();
        assert!(matches!(err, SimError::InvariantViolation(_)));
    }

    #[test]
    fn test_co_located_task_is_marked_interfered() {
        let mut n = node(8, 2, 16);
        let mut arena: SlotMap<JobKey, ()> = SlotMap::with_key();
        let a = arena.insert(());
        let b = arena.insert(());
        let mut ja = job(1, Resources::new(2, 1, 4));
        let mut jb = job(1, Resources::new(2, 1, 4));

        n.try_alloc_job(a, &mut ja, true).unwrap();
        n.execute_job(a, &mut ja, 0).unwrap();
        n.try_alloc_job(b, &mut jb, true).unwrap();
        n.execute_job(b, &mut jb, 0).unwrap();

        assert!(!ja.tasks[&0].interfered);
        assert!(jb.tasks[&0].interfered);
        assert_eq!(jb.tasks[&0].duration, 20.0);
    }

    #[test]
    fn test_remove_and_release_restores_usage() {
        let mut n = node(8, 2, 16);
        let mut arena: SlotMap<JobKey, ()> = SlotMap::with_key();
        let key = arena.insert(());
        let mut j = job(2, Resources::new(2, 1, 4));
        n.try_alloc_job(key, &mut j, true).unwrap();
        n.execute_job(key, &mut j, 0).unwrap();

        for id in [0, 1] {
            let task_key = TaskKey::new(key, id);
            let demand = n.remove_task(task_key).unwrap();
            let reduced = n.release_allocated_resources(task_key, &demand).unwrap();
            assert!(reduced.is_empty());
        }

        assert_eq!(n.used(), Resources::zero());
        assert!(n.is_idle());
        assert!(n.placed_jobs().is_empty());
        assert_eq!(n.finished_tasks().len(), 2);
        assert!(n.devices().iter().all(|d| d.get_current_memory() == 0.0));
    }

    #[test]
    fn test_release_reports_reduced_interference_set() {
        let mut n = node(8, 2, 16);
        let mut arena: SlotMap<JobKey, ()> = SlotMap::with_key();
        let a = arena.insert(());
        let b = arena.insert(());
        let mut ja = job(1, Resources::new(2, 1, 4));
        let mut jb = job(1, Resources::new(2, 1, 4));
        n.try_alloc_job(a, &mut ja, true).unwrap();
        n.execute_job(a, &mut ja, 0).unwrap();
        n.try_alloc_job(b, &mut jb, true).unwrap();
        n.execute_job(b, &mut jb, 0).unwrap();

        let task_b = TaskKey::new(b, 0);
        let demand = n.remove_task(task_b).unwrap();
        let reduced = n.release_allocated_resources(task_b, &demand).unwrap();

        assert!(reduced.contains(&task_b));
        assert!(reduced.contains(&TaskKey::new(a, 0)));
        assert_eq!(reduced.len(), 2);
    }

    #[test]
    fn test_release_twice_is_resource_violation() {
        let mut n = node(8, 2, 16);
        let mut arena: SlotMap<JobKey, ()> = SlotMap::with_key();
        let key = arena.insert(());
        let mut j = job(1, Resources::new(2, 1, 4));
        n.try_alloc_job(key, &mut j, true).unwrap();

        let task_key = TaskKey::new(key, 0);
        let demand = n.remove_task(task_key).unwrap();
        n.release_allocated_resources(task_key, &demand).unwrap();
        let err = n.release_allocated_resources(task_key, &demand).unwrap_err();
        assert!(matches!(err, SimError::ResourceViolation(_)));
        assert_eq!(n.used(), Resources::zero());
    }

    #[test]
    fn test_release_of_resident_task_is_rejected() {
        let mut n = node(8, 2, 16);
        let mut arena: SlotMap<JobKey, ()> = SlotMap::with_key();
        let key = arena.insert(());
        let mut j = job(1, Resources::new(2, 1, 4));
        n.try_alloc_job(key, &mut j, true).unwrap();

        let err = n
            .release_allocated_resources(TaskKey::new(key, 0), &Resources::new(2, 1, 4))
            .unwrap_err();
        assert!(matches!(err, SimError::InvariantViolation(_)));
        assert_eq!(n.used(), Resources::new(2, 1, 4));
    }

    #[test]
    fn test_unreserve_task_restores_node_without_history() {
        let mut n = node(8, 2, 16);
        let mut arena: SlotMap<JobKey, ()> = SlotMap::with_key();
        let key = arena.insert(());
        let before = n.clone();
        let mut j = job(2, Resources::new(2, 1, 4));
        n.try_alloc_job(key, &mut j, true).unwrap();

        for id in [0, 1] {
            let demand = n.unreserve_task(TaskKey::new(key, id)).unwrap();
            assert_eq!(demand, Some(Resources::new(2, 1, 4)));
        }
        assert_eq!(n, before);
        assert!(n.finished_tasks().is_empty());
        assert_eq!(n.unreserve_task(TaskKey::new(key, 0)).unwrap(), None);
    }

    #[test]
    fn test_unreserve_running_task_is_rejected() {
        let mut n = node(8, 2, 16);
        let mut arena: SlotMap<JobKey, ()> = SlotMap::with_key();
        let key = arena.insert(());
        let mut j = job(1, Resources::new(2, 1, 4));
        n.try_alloc_job(key, &mut j, true).unwrap();
        n.execute_job(key, &mut j, 0).unwrap();

        let err = n.unreserve_task(TaskKey::new(key, 0)).unwrap_err();
        assert!(matches!(err, SimError::InvariantViolation(_)));
        assert_eq!(n.used(), Resources::new(2, 1, 4));
    }

    #[test]
    fn test_check_util_and_free() {
        let mut n = node(8, 2, 16);
        let mut arena: SlotMap<JobKey, ()> = SlotMap::with_key();
        let key = arena.insert(());
        let mut j = job(1, Resources::new(4, 1, 8));
        n.try_alloc_job(key, &mut j, true).unwrap();

        assert_eq!(n.check_util(), (0.5, 0.5, 0.5));
        assert_eq!((n.cpu_free(), n.gpu_free(), n.mem_free()), (4, 1, 8));
        assert!(n.is_free());
        assert_eq!(node(0, 0, 0).check_util(), (0.0, 0.0, 0.0));
    }
}
