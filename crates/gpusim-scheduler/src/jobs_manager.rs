//! Queue admission policy, simulated clock and job lifecycle

use gpusim_core::{
    Job, JobId, JobKey, JobRecord, JobStatus, NodeId, Resources, SchedulePolicy, SimError,
    SimResult, TaskKey, TaskState,
};
use slotmap::SlotMap;
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::cluster::Cluster;
use crate::node::Node;
use crate::queue::{JobQueueManager, QueueEntry};
use crate::source::JobSource;

/// Added to the pending-time denominator so an empty queue averages to zero
const PENDING_EPSILON: f64 = 1e-9;

/// Outcome of asking for the job at a queue position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    /// The job is submitted and may be scheduled
    Ready(JobKey),
    /// The job exists but its submit time is still ahead
    NotReady(JobKey),
    /// Nothing at that position
    Empty,
}

/// Orchestrates admission, placement bookkeeping, preemption and finishing
///
/// Every job lives in the manager's arena for its whole life. Queues, the
/// running set, the finished list and node tables refer to it by key.
pub struct JobsManager {
    schedule: SchedulePolicy,
    job_queue_manager: JobQueueManager,
    job_source: Box<dyn JobSource>,
    replay_trace: bool,
    jobs: SlotMap<JobKey, Job>,
    running_jobs: BTreeSet<JobKey>,
    finished_jobs: Vec<JobKey>,
    busy_nodes: BTreeSet<NodeId>,
    task_shape: Resources,
    next_job_id: JobId,
    preemptions: u64,
}

impl JobsManager {
    /// Create a manager; replay sources are prepared immediately
    pub fn new(
        schedule: SchedulePolicy,
        job_queue_manager: JobQueueManager,
        mut job_source: Box<dyn JobSource>,
        task_shape: Resources,
    ) -> SimResult<Self> {
        let replay_trace = job_source.is_replay();
        if replay_trace {
            job_source.prepare_jobs()?;
        }

        info!(
            schedule = %schedule,
            queues = job_queue_manager.num_queues(),
            replay = replay_trace,
            "Jobs manager initialized"
        );

        Ok(Self {
            schedule,
            job_queue_manager,
            job_source,
            replay_trace,
            jobs: SlotMap::with_key(),
            running_jobs: BTreeSet::new(),
            finished_jobs: Vec::new(),
            busy_nodes: BTreeSet::new(),
            task_shape,
            next_job_id: 0,
            preemptions: 0,
        })
    }

    pub fn schedule(&self) -> SchedulePolicy {
        self.schedule
    }

    /// Whether jobs come from a replayed trace
    pub fn is_replay(&self) -> bool {
        self.replay_trace
    }

    pub fn queue_manager(&self) -> &JobQueueManager {
        &self.job_queue_manager
    }

    pub fn job(&self, key: JobKey) -> Option<&Job> {
        self.jobs.get(key)
    }

    pub fn job_mut(&mut self, key: JobKey) -> Option<&mut Job> {
        self.jobs.get_mut(key)
    }

    pub fn running_jobs(&self) -> &BTreeSet<JobKey> {
        &self.running_jobs
    }

    pub fn finished_jobs(&self) -> &[JobKey] {
        &self.finished_jobs
    }

    pub fn busy_nodes(&self) -> &BTreeSet<NodeId> {
        &self.busy_nodes
    }

    pub fn preemptions(&self) -> u64 {
        self.preemptions
    }

    /// Jobs ever admitted into the arena
    pub fn jobs_seen(&self) -> usize {
        self.jobs.len()
    }

    fn lookup(&self, key: JobKey) -> SimResult<&Job> {
        self.jobs
            .get(key)
            .ok_or_else(|| SimError::InvariantViolation(format!("unknown job {:?}", key)))
    }

    fn lookup_mut(&mut self, key: JobKey) -> SimResult<&mut Job> {
        self.jobs
            .get_mut(key)
            .ok_or_else(|| SimError::InvariantViolation(format!("unknown job {:?}", key)))
    }

    /// Put a job into the arena without queueing it
    pub fn admit(&mut self, job: Job) -> JobKey {
        self.next_job_id = self.next_job_id.max(job.job_id + 1);
        self.jobs.insert(job)
    }

    /// Pull the next batch from the workload source, convert and queue it
    ///
    /// Returns the number of jobs generated.
    pub fn gen_jobs(&mut self, now: u64, scale_factor: f64) -> SimResult<usize> {
        let samples: Vec<JobRecord> = self.job_source.generate_jobs(now)?;
        if !samples.is_empty() {
            info!(now, generated = samples.len(), "Generated jobs");
        }

        let mut keys = Vec::with_capacity(samples.len());
        for record in &samples {
            let job = Job::from_record(self.next_job_id, record, scale_factor, self.task_shape);
            self.next_job_id += 1;
            keys.push(self.jobs.insert(job));
        }
        self.insert(&keys)?;
        Ok(samples.len())
    }

    /// Re-sort every queue by submit time
    pub fn sort_job_trace(&mut self) {
        self.job_queue_manager.sort_by_submit_time();
    }

    /// Peek at a queue position
    pub fn get_next_job(&self, now: u64, queue_idx: usize, pos: usize) -> Poll {
        let Some(entry) = self.job_queue_manager.get_next_job(queue_idx, pos) else {
            return Poll::Empty;
        };
        if entry.submit_time <= now as f64 {
            return Poll::Ready(entry.key);
        }
        info!(
            submit_time = entry.submit_time,
            now, "Job should not be scheduled yet"
        );
        Poll::NotReady(entry.key)
    }

    /// Remove the job at a queue position if it is already submitted
    ///
    /// A job whose submit time is still ahead is put back where it was.
    pub fn pop(&mut self, now: u64, queue_idx: usize, pos: usize) -> SimResult<Poll> {
        let Some(entry) = self.job_queue_manager.pop(queue_idx, pos) else {
            return Ok(Poll::Empty);
        };
        if entry.submit_time <= now as f64 {
            return Ok(Poll::Ready(entry.key));
        }
        info!(
            submit_time = entry.submit_time,
            now, "Job should not be scheduled yet"
        );
        let key = entry.key;
        self.job_queue_manager.insert(entry, queue_idx, pos)?;
        Ok(Poll::NotReady(key))
    }

    /// Put a popped job back at a queue position without re-running the policy
    pub fn requeue(&mut self, key: JobKey, queue_idx: usize, pos: usize) -> SimResult<()> {
        let entry = self.queue_entry(key)?;
        self.job_queue_manager.insert(entry, queue_idx, pos)
    }

    fn queue_entry(&self, key: JobKey) -> SimResult<QueueEntry> {
        let job = self.lookup(key)?;
        Ok(QueueEntry {
            key,
            submit_time: job.submit_time,
            priority: job.priority(),
        })
    }

    /// Queue index for each job of the batch
    ///
    /// `fifo` and `horus` use a single queue. `horus+` would re-cluster every
    /// queued job into one cluster per queue and is not implemented.
    pub fn get_queue_position(&self, jobs: &[JobKey]) -> SimResult<Vec<usize>> {
        match self.schedule {
            SchedulePolicy::Fifo | SchedulePolicy::Horus => Ok(vec![0; jobs.len()]),
            SchedulePolicy::HorusPlus => Err(SimError::UnsupportedPolicy(
                "horus+ queue clustering is not implemented".to_string(),
            )),
        }
    }

    /// Position inside the target queue for each job of the batch
    ///
    /// Jobs are appended in arrival order; priority queues reorder on their own.
    pub fn get_insert_position(&self, queue_positions: &[usize]) -> Vec<usize> {
        let mut tails: Vec<usize> = (0..self.job_queue_manager.num_queues())
            .map(|q| self.job_queue_manager.queue_len(q))
            .collect();
        queue_positions
            .iter()
            .map(|q| match tails.get_mut(*q) {
                Some(tail) => {
                    let pos = *tail;
                    *tail += 1;
                    pos
                }
                None => 0,
            })
            .collect()
    }

    /// Queue a batch of arena jobs according to the active policy
    ///
    /// Jobs are inserted one at a time; an error part-way leaves the earlier
    /// jobs of the batch queued.
    pub fn insert(&mut self, jobs: &[JobKey]) -> SimResult<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let queue_positions = self.get_queue_position(jobs)?;
        let insert_positions = self.get_insert_position(&queue_positions);

        for ((key, queue_idx), pos) in jobs.iter().zip(queue_positions).zip(insert_positions) {
            let entry = self.queue_entry(*key)?;
            self.job_queue_manager.insert(entry, queue_idx, pos)?;
            self.lookup_mut(*key)?.status = JobStatus::Queued;
        }
        Ok(())
    }

    /// Accrue one tick of waiting for every queued job
    pub fn add_pending_time(&mut self) {
        let queued: Vec<JobKey> = self.job_queue_manager.iter().map(|e| e.key).collect();
        for key in queued {
            if let Some(job) = self.jobs.get_mut(key) {
                job.pending_time += 1;
            }
        }
    }

    /// Advance the simulated clock by one tick
    pub fn step(&mut self) {
        self.add_pending_time();
        for key in &self.running_jobs {
            if let Some(job) = self.jobs.get_mut(*key) {
                job.step();
            }
        }
    }

    /// Running jobs that have processed at least their duration
    pub fn prepare_finish_tasks(&self, now: u64) -> Vec<JobKey> {
        self.running_jobs
            .iter()
            .filter_map(|key| {
                let job = self.jobs.get(*key)?;
                if job.is_complete() {
                    Some(*key)
                } else {
                    debug!(
                        job_id = job.job_id,
                        duration = job.duration(),
                        processed = job.time_processed(),
                        now,
                        "Job not finished yet"
                    );
                    None
                }
            })
            .collect()
    }

    /// Start the tasks of `key` placed on `node`
    ///
    /// Returns true once the job runs on all of its nodes, at which point it
    /// is registered as running.
    pub fn start_job(&mut self, node: &mut Node, key: JobKey, now: u64) -> SimResult<bool> {
        let job = self
            .jobs
            .get_mut(key)
            .ok_or_else(|| SimError::InvariantViolation(format!("unknown job {:?}", key)))?;
        let (executed, started_task_count) = node.execute_job(key, job, now)?;

        if started_task_count == 0 {
            return Err(SimError::InvariantViolation(format!(
                "job {} has no task to start on node {}",
                job.job_id,
                node.node_id()
            )));
        }
        self.busy_nodes.insert(node.node_id());

        let Some(executed) = executed else {
            return Ok(false);
        };
        if self.running_jobs.insert(executed) {
            info!(job_id = job.job_id, now, "Job running");
        }
        Ok(true)
    }

    /// Pull every task of `key` off its hosts and release the resources
    ///
    /// Interference relief applies to the job's own tasks that the nodes
    /// report in their reduced set. Returns the surviving tasks of other
    /// jobs whose interference was reduced.
    fn release_job(&mut self, key: JobKey, cluster: &mut Cluster) -> SimResult<BTreeSet<TaskKey>> {
        let job = self
            .jobs
            .get_mut(key)
            .ok_or_else(|| SimError::InvariantViolation(format!("unknown job {:?}", key)))?;
        let placements: Vec<_> = job
            .tasks_running_on
            .iter()
            .map(|(task, node)| (*task, *node))
            .collect();

        let mut survivors = BTreeSet::new();
        for (task_id, node_id) in placements {
            let node = cluster.node_mut(node_id)?;
            let task_key = TaskKey::new(key, task_id);
            let demand = node.remove_task(task_key).ok_or_else(|| {
                SimError::InvariantViolation(format!(
                    "node {} does not hold task {} of job {}",
                    node_id, task_id, job.job_id
                ))
            })?;
            let reduced = node.release_allocated_resources(task_key, &demand)?;

            if reduced.contains(&task_key) {
                if let Some(task) = job.tasks.get_mut(&task_id) {
                    if task.relieve_interference() {
                        debug!(job_id = job.job_id, task_id, "Interference relieved");
                    }
                }
            }
            survivors.extend(reduced.into_iter().filter(|k| k.job != key));
            if node.running_tasks().is_empty() {
                self.busy_nodes.remove(&node_id);
            }
        }
        Ok(survivors)
    }

    /// Forcibly stop a running job, release its resources and queue it again
    ///
    /// Returns tasks of other jobs whose interference was reduced by the
    /// departure, for [`Self::reset_interference`].
    pub fn preempt(&mut self, key: JobKey, cluster: &mut Cluster) -> SimResult<BTreeSet<TaskKey>> {
        if !self.running_jobs.remove(&key) {
            return Err(SimError::InvariantViolation(format!(
                "cannot preempt job {:?}: not running",
                key
            )));
        }
        let survivors = self.release_job(key, cluster)?;

        let job = self.lookup_mut(key)?;
        job.preempted();
        info!(
            job_id = job.job_id,
            preempt_count = job.preempt_count,
            "Job preempted"
        );
        self.preemptions += 1;
        self.insert(&[key])?;
        Ok(survivors)
    }

    /// Undo a partial placement of a job that never started running
    ///
    /// Reservations are cancelled without touching release history or
    /// interference state.
    pub fn unplace(&mut self, key: JobKey, cluster: &mut Cluster) -> SimResult<()> {
        if self.running_jobs.contains(&key) {
            return Err(SimError::InvariantViolation(format!(
                "cannot unplace running job {:?}",
                key
            )));
        }
        let job = self
            .jobs
            .get_mut(key)
            .ok_or_else(|| SimError::InvariantViolation(format!("unknown job {:?}", key)))?;
        for (task_id, node_id) in &job.tasks_running_on {
            let task_key = TaskKey::new(key, *task_id);
            if cluster.node_mut(*node_id)?.unreserve_task(task_key)?.is_none() {
                return Err(SimError::InvariantViolation(format!(
                    "node {} does not hold task {} of job {}",
                    node_id, task_id, job.job_id
                )));
            }
        }
        job.tasks_running_on.clear();
        for task in job.tasks.values_mut() {
            task.state = TaskState::Queued;
            task.started_at = None;
        }
        job.status = JobStatus::Queued;
        Ok(())
    }

    /// Release a completed job and record it as finished
    ///
    /// Returns tasks of other jobs whose interference was reduced.
    pub fn finish_job(
        &mut self,
        key: JobKey,
        cluster: &mut Cluster,
        now: u64,
    ) -> SimResult<BTreeSet<TaskKey>> {
        if !self.running_jobs.remove(&key) {
            return Err(SimError::InvariantViolation(format!(
                "cannot finish job {:?}: not running",
                key
            )));
        }
        let survivors = self.release_job(key, cluster)?;
        let job = self.lookup_mut(key)?;
        job.finish(now);
        info!(
            job_id = job.job_id,
            now,
            pending_time = job.pending_time,
            "Job finished"
        );
        self.finished_jobs.push(key);
        Ok(survivors)
    }

    /// Apply the interference decay to running tasks whose interference ended
    pub fn reset_interference(&mut self, tasks: &BTreeSet<TaskKey>) {
        for task_key in tasks {
            if !self.running_jobs.contains(&task_key.job) {
                continue;
            }
            let Some(job) = self.jobs.get_mut(task_key.job) else {
                continue;
            };
            if let Some(task) = job.tasks.get_mut(&task_key.task) {
                if task.relieve_interference() {
                    debug!(
                        job_id = job.job_id,
                        task_id = task_key.task,
                        "Interference reset"
                    );
                }
            }
        }
    }

    /// Jobs the replay trace has not released yet
    pub fn remaining_jobs(&self) -> SimResult<usize> {
        if !self.replay_trace {
            return Err(SimError::NotApplicableInMode {
                operation: "remaining_jobs",
                mode: "generation",
            });
        }
        self.job_source
            .remaining_jobs()
            .ok_or_else(|| SimError::InvariantViolation("replay source without a bound".into()))
    }

    /// Jobs waiting in the queues, restricted to submitted ones when `now` is given
    pub fn queuing_jobs(&self, now: Option<u64>) -> usize {
        self.job_queue_manager.total_jobs(now)
    }

    /// Queued jobs plus, when replaying, jobs the trace still holds
    pub fn total_jobs(&self, now: Option<u64>) -> SimResult<usize> {
        let queued = self.job_queue_manager.total_jobs(now);
        if self.replay_trace {
            return Ok(self.remaining_jobs()? + queued);
        }
        Ok(queued)
    }

    pub fn total_finished_jobs(&self) -> usize {
        self.finished_jobs.len()
    }

    /// Mean pending time across queued jobs
    pub fn avg_pending_time(&self) -> f64 {
        let (total, count) = self
            .job_queue_manager
            .iter()
            .filter_map(|e| self.jobs.get(e.key))
            .fold((0u64, 0usize), |(t, c), job| (t + job.pending_time, c + 1));
        total as f64 / (count as f64 + PENDING_EPSILON)
    }
}
