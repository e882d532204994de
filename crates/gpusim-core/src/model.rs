//! Task, Job and workload record type definitions

use serde::{Deserialize, Serialize};
use slotmap::new_key_type;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::Resources;

/// Identifier of a task, unique within its job
pub type TaskId = u32;

/// Identifier of a job as seen in logs and reports
pub type JobId = u64;

/// Index of a node within the cluster
pub type NodeId = usize;

/// Remaining duration is multiplied by this factor when interference ends
pub const INTERFERENCE_DECAY: f64 = 0.5;

/// Remaining duration is multiplied by this factor when interference starts
pub const INTERFERENCE_SLOWDOWN: f64 = 2.0;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

new_key_type! {
    /// Stable handle of a job in the job arena
    pub struct JobKey;
}

/// Handle of a single task: its job plus its id within that job
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskKey {
    pub job: JobKey,
    pub task: TaskId,
}

impl TaskKey {
    pub fn new(job: JobKey, task: TaskId) -> Self {
        Self { job, task }
    }
}

/// Where a task currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// In its job's task table, not reserved anywhere
    Queued,
    /// Reserved on a node, not started
    Placed,
    /// Executing on a node
    Running,
    /// Completed
    Finished,
}

/// Smallest schedulable unit, occupying one node for its lifetime
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub task_id: TaskId,
    /// CPU, GPU and host memory demand
    pub demand: Resources,
    /// Peak accelerator memory footprint in MiB
    pub gpu_memory_max: f64,
    /// Average accelerator memory footprint in MiB
    pub gpu_memory_avg: f64,
    /// Total simulated time required
    pub duration: f64,
    /// Simulated time spent executing so far
    pub processed: u64,
    /// Currently slowed down by a co-located task
    pub interfered: bool,
    pub state: TaskState,
    /// Tick at which the current execution started
    pub started_at: Option<u64>,
}

impl Task {
    /// Create a queued task
    pub fn new(task_id: TaskId, demand: Resources, duration: f64) -> Self {
        Self {
            task_id,
            demand,
            gpu_memory_max: 0.0,
            gpu_memory_avg: 0.0,
            duration,
            processed: 0,
            interfered: false,
            state: TaskState::Queued,
            started_at: None,
        }
    }

    /// Set the accelerator memory footprint (MiB)
    pub fn with_gpu_memory(mut self, max: f64, avg: f64) -> Self {
        self.gpu_memory_max = max;
        self.gpu_memory_avg = avg;
        self
    }

    /// Simulated time still required
    pub fn remaining(&self) -> f64 {
        (self.duration - self.processed as f64).max(0.0)
    }

    /// Begin execution accounting at `now`
    pub fn execute(&mut self, now: u64) {
        self.state = TaskState::Running;
        self.started_at = Some(now);
    }

    pub fn step(&mut self) {
        if self.state == TaskState::Running {
            self.processed += 1;
        }
    }

    /// Flag the task as suffering interference and stretch what is left of it
    pub fn mark_interfered(&mut self) -> bool {
        if self.interfered {
            return false;
        }
        self.interfered = true;
        self.duration = self.processed as f64 + self.remaining() * INTERFERENCE_SLOWDOWN;
        true
    }

    /// Apply the one-shot interference decay
    ///
    /// Returns false, leaving the duration untouched, if the task was not
    /// flagged as interfered.
    pub fn relieve_interference(&mut self) -> bool {
        if !self.interfered {
            return false;
        }
        self.interfered = false;
        self.duration = self.processed as f64 + self.remaining() * INTERFERENCE_DECAY;
        true
    }
}

/// Job lifecycle as seen by the jobs manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in a queue
    Queued,
    /// Some tasks reserved or started, not all running yet
    Placed,
    /// Every task executing
    Running,
    /// Done; immutable from here on
    Finished,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "Queued"),
            JobStatus::Placed => write!(f, "Placed"),
            JobStatus::Running => write!(f, "Running"),
            JobStatus::Finished => write!(f, "Finished"),
        }
    }
}

/// A logical unit of work made of one or more tasks
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: JobId,
    /// Simulated time at which the job becomes eligible
    pub submit_time: f64,
    pub task_count: usize,
    /// Ticks spent waiting in a queue
    pub pending_time: u64,
    pub gpu_per_container: f64,
    pub gpu_utilization_avg: f64,
    pub gpu_utilization_max: f64,
    pub tasks: BTreeMap<TaskId, Task>,
    /// Host node of every task currently reserved or running
    pub tasks_running_on: BTreeMap<TaskId, NodeId>,
    pub status: JobStatus,
    pub start_time: Option<u64>,
    pub finish_time: Option<u64>,
    pub preempt_count: u32,
    processed: u64,
}

impl Job {
    /// Create a queued job of `task_count` identical tasks
    pub fn new(
        job_id: JobId,
        submit_time: f64,
        duration: f64,
        task_count: usize,
        demand: Resources,
    ) -> Self {
        let tasks = (0..task_count as TaskId)
            .map(|id| (id, Task::new(id, demand, duration)))
            .collect();

        Self {
            job_id,
            submit_time,
            task_count,
            pending_time: 0,
            gpu_per_container: 0.0,
            gpu_utilization_avg: 0.0,
            gpu_utilization_max: 0.0,
            tasks,
            tasks_running_on: BTreeMap::new(),
            status: JobStatus::Queued,
            start_time: None,
            finish_time: None,
            preempt_count: 0,
            processed: 0,
        }
    }

    /// Build a job from a workload record, one task per requested GPU
    pub fn from_record(
        job_id: JobId,
        record: &JobRecord,
        scale_factor: f64,
        task_shape: Resources,
    ) -> Self {
        let task_count = record.used_gpus.max(1) as usize;
        let mut job = Job::new(
            job_id,
            record.normalized_time,
            record.minutes * scale_factor,
            task_count,
            task_shape,
        );
        job.gpu_per_container = record.gpu_per_container;
        job.gpu_utilization_avg = record.gpu_utilization_avg;
        job.gpu_utilization_max = record.gpu_utilization_max;

        let max_mib = record.memory_max / BYTES_PER_MIB;
        let avg_mib = record.memory_avg / BYTES_PER_MIB;
        for task in job.tasks.values_mut() {
            task.gpu_memory_max = max_mib;
            task.gpu_memory_avg = avg_mib;
        }
        job
    }

    /// Longest task duration; interference changes it over time
    pub fn duration(&self) -> f64 {
        self.tasks
            .values()
            .map(|t| t.duration)
            .fold(0.0, f64::max)
    }

    /// Ticks spent running
    pub fn time_processed(&self) -> u64 {
        self.processed
    }

    /// Whether the job has run for at least its duration
    pub fn is_complete(&self) -> bool {
        self.processed as f64 >= self.duration()
    }

    /// Queue priority key used by the priority queue ordering, lower first
    pub fn priority(&self) -> f64 {
        self.gpu_utilization_avg * self.task_count as f64
    }

    /// Tasks with no recorded host
    pub fn unplaced_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks
            .values()
            .filter(|t| !self.tasks_running_on.contains_key(&t.task_id))
    }

    /// Distinct nodes hosting at least one task of this job
    pub fn hosting_nodes(&self) -> BTreeSet<NodeId> {
        self.tasks_running_on.values().copied().collect()
    }

    /// Check whether every task is executing
    ///
    /// Promotes the job to `Running` when it is; otherwise the job stays
    /// `Placed` waiting on other nodes.
    pub fn try_execute(&mut self, now: u64) -> bool {
        let ready = !self.tasks.is_empty()
            && self.tasks.values().all(|t| t.state == TaskState::Running);
        if ready {
            self.status = JobStatus::Running;
            self.start_time.get_or_insert(now);
        } else {
            self.status = JobStatus::Placed;
        }
        ready
    }

    /// Advance one tick of execution
    pub fn step(&mut self) {
        if self.status != JobStatus::Running {
            return;
        }
        self.processed += 1;
        for task in self.tasks.values_mut() {
            task.step();
        }
    }

    /// Return to the queued state after preemption, keeping progress
    pub fn preempted(&mut self) {
        self.tasks_running_on.clear();
        for task in self.tasks.values_mut() {
            task.state = TaskState::Queued;
            task.started_at = None;
        }
        self.status = JobStatus::Queued;
        self.start_time = None;
        self.preempt_count += 1;
    }

    /// Mark the job finished at `now`
    pub fn finish(&mut self, now: u64) {
        self.tasks_running_on.clear();
        for task in self.tasks.values_mut() {
            task.state = TaskState::Finished;
        }
        self.status = JobStatus::Finished;
        self.finish_time = Some(now);
    }
}

/// One row of a workload trace or one synthetic sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job duration in minutes
    pub minutes: f64,
    /// Submit time on the simulation clock
    pub normalized_time: f64,
    /// GPU share per container
    pub gpu_per_container: f64,
    pub gpu_utilization_avg: f64,
    pub gpu_utilization_max: f64,
    /// Average accelerator memory footprint in bytes
    pub memory_avg: f64,
    /// Peak accelerator memory footprint in bytes
    pub memory_max: f64,
    /// Number of GPUs the job uses
    pub used_gpus: u32,
}
