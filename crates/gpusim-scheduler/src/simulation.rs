//! Discrete-time driving loop

use chrono::{DateTime, Utc};
use gpusim_core::{
    JobKey, JobStatus, NodeId, SchedulePolicy, SimConfig, SimResult, SimulationConfig, Task, TaskId,
};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::cluster::Cluster;
use crate::jobs_manager::{JobsManager, Poll};
use crate::queue::{JobQueueManager, QueueOrdering};
use crate::source::{JobGenerator, JobSource, JobTraceReader};

/// Summary of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub generated_at: DateTime<Utc>,
    pub schedule: String,
    pub replay: bool,
    /// Ticks simulated
    pub ticks: u64,
    pub jobs_submitted: usize,
    pub jobs_finished: usize,
    pub jobs_running: usize,
    pub jobs_queued: usize,
    pub preemptions: u64,
    /// Mean ticks finished jobs spent queued
    pub avg_pending_time: f64,
    /// Mean ticks from submission to completion of finished jobs
    pub avg_completion_time: f64,
    pub mean_gpu_utilization: f64,
    pub peak_gpu_utilization: f64,
}

/// Owns the cluster and the jobs manager and advances them tick by tick
pub struct Simulation {
    config: SimulationConfig,
    schedule: SchedulePolicy,
    cluster: Cluster,
    manager: JobsManager,
    now: u64,
    replay: bool,
    utilization_sum: f64,
    peak_utilization: f64,
}

impl Simulation {
    /// Build the cluster, queues and workload source described by `config`
    pub fn from_config(config: &SimConfig) -> SimResult<Self> {
        config.validate()?;

        let ordering = match config.schedule {
            SchedulePolicy::Horus => QueueOrdering::Priority,
            SchedulePolicy::Fifo | SchedulePolicy::HorusPlus => QueueOrdering::Fifo,
        };
        let queues = JobQueueManager::new(config.queue.num_queues, ordering);

        let source: Box<dyn JobSource> = match &config.trace_file {
            Some(path) => Box::new(JobTraceReader::new(path)),
            None => Box::new(JobGenerator::new(config.generator.clone(), config.seed)),
        };

        let manager = JobsManager::new(
            config.schedule,
            queues,
            source,
            config.task_shape.into(),
        )?;
        Ok(Self::new(
            Cluster::from_config(&config.cluster),
            manager,
            config.simulation.clone(),
        ))
    }

    /// Assemble a simulation from parts
    pub fn new(cluster: Cluster, manager: JobsManager, config: SimulationConfig) -> Self {
        let replay = manager.is_replay();
        Self {
            schedule: manager.schedule(),
            config,
            cluster,
            manager,
            now: 0,
            replay,
            utilization_sum: 0.0,
            peak_utilization: 0.0,
        }
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn manager(&self) -> &JobsManager {
        &self.manager
    }

    /// Run until the tick limit, or until a replayed trace has fully drained
    pub fn run(&mut self) -> SimResult<SimulationReport> {
        info!(
            schedule = %self.schedule,
            max_ticks = self.config.max_ticks,
            nodes = self.cluster.len(),
            "Starting simulation"
        );

        while self.now < self.config.max_ticks {
            self.tick()?;
            if self.drained()? {
                info!(now = self.now, "Workload drained");
                break;
            }
        }

        let report = self.report();
        info!(
            ticks = report.ticks,
            finished = report.jobs_finished,
            preemptions = report.preemptions,
            "Simulation complete"
        );
        Ok(report)
    }

    /// Advance the simulation by one tick
    pub fn tick(&mut self) -> SimResult<()> {
        let now = self.now;
        self.manager.gen_jobs(now, self.config.scale_factor)?;
        self.schedule_queues(now)?;
        self.maybe_preempt(now)?;

        for key in self.manager.prepare_finish_tasks(now) {
            let survivors = self.manager.finish_job(key, &mut self.cluster, now)?;
            self.manager.reset_interference(&survivors);
        }

        let utilization = self.cluster.gpu_utilization();
        self.utilization_sum += utilization;
        self.peak_utilization = self.peak_utilization.max(utilization);

        self.manager.step();
        self.now += 1;
        Ok(())
    }

    fn drained(&self) -> SimResult<bool> {
        if !self.replay {
            return Ok(false);
        }
        Ok(self.manager.remaining_jobs()? == 0
            && self.manager.queuing_jobs(None) == 0
            && self.manager.running_jobs().is_empty()
            && self.cluster.is_idle())
    }

    /// Place and start queue heads until one does not fit
    fn schedule_queues(&mut self, now: u64) -> SimResult<()> {
        for queue_idx in 0..self.manager.queue_manager().num_queues() {
            loop {
                let key = match self.manager.pop(now, queue_idx, 0)? {
                    Poll::Ready(key) => key,
                    Poll::NotReady(_) | Poll::Empty => break,
                };
                if !self.place(key)? {
                    self.manager.requeue(key, queue_idx, 0)?;
                    break;
                }
                self.start(key, now)?;
            }
        }
        Ok(())
    }

    /// Reserve every task of `key`; false leaves cluster and job untouched
    fn place(&mut self, key: JobKey) -> SimResult<bool> {
        if self.place_on_single_node(key)? {
            return Ok(true);
        }
        if self.config.multi_node {
            return self.scatter(key);
        }
        Ok(false)
    }

    fn place_on_single_node(&mut self, key: JobKey) -> SimResult<bool> {
        let Some(job) = self.manager.job_mut(key) else {
            return Ok(false);
        };
        for node in self.cluster.nodes_mut() {
            if node.enable_pack() {
                let tasks: Vec<&Task> = job.unplaced_tasks().collect();
                if node.can_fit_num_task(&tasks, true) < tasks.len() {
                    continue;
                }
            }
            if node.try_alloc_job(key, job, true)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// First-fit the job's tasks over several nodes, all or nothing
    fn scatter(&mut self, key: JobKey) -> SimResult<bool> {
        let Some(job) = self.manager.job_mut(key) else {
            return Ok(false);
        };
        for node in self.cluster.nodes_mut() {
            let tasks: Vec<&Task> = job.unplaced_tasks().collect();
            if tasks.is_empty() {
                break;
            }
            if node.enable_pack() && node.can_fit_num_task(&tasks, true) == 0 {
                continue;
            }
            let fit = node.can_fit_num_task(&tasks, false);
            if fit == 0 {
                continue;
            }
            let ids: Vec<TaskId> = tasks[..fit].iter().map(|t| t.task_id).collect();
            node.try_alloc_tasks(key, job, &ids, false)?;
        }

        if job.unplaced_tasks().next().is_none() {
            debug!(job_id = job.job_id, nodes = job.hosting_nodes().len(), "Job scattered");
            return Ok(true);
        }
        self.manager.unplace(key, &mut self.cluster)?;
        Ok(false)
    }

    fn start(&mut self, key: JobKey, now: u64) -> SimResult<()> {
        let hosts: Vec<NodeId> = self
            .manager
            .job(key)
            .map(|job| job.hosting_nodes().into_iter().collect())
            .unwrap_or_default();
        for node_id in hosts {
            self.manager
                .start_job(self.cluster.node_mut(node_id)?, key, now)?;
        }
        Ok(())
    }

    /// Preempt the most recently started job if a ready queue head has
    /// waited past the threshold
    ///
    /// Only jobs that have run for at least the same threshold are eligible,
    /// so a job started this round is never the victim.
    fn maybe_preempt(&mut self, now: u64) -> SimResult<()> {
        let Some(threshold) = self.config.preempt_after_ticks else {
            return Ok(());
        };

        let starving = (0..self.manager.queue_manager().num_queues()).any(|q| {
            match self.manager.get_next_job(now, q, 0) {
                Poll::Ready(key) => self
                    .manager
                    .job(key)
                    .is_some_and(|job| job.pending_time >= threshold),
                Poll::NotReady(_) | Poll::Empty => false,
            }
        });
        if !starving {
            return Ok(());
        }

        let victim = self
            .manager
            .running_jobs()
            .iter()
            .filter_map(|key| self.manager.job(*key).map(|job| (*key, job)))
            .filter(|(_, job)| {
                job.status == JobStatus::Running
                    && !job.is_complete()
                    && job.start_time.is_some_and(|t| t + threshold <= now)
            })
            .max_by_key(|(_, job)| (job.start_time, job.job_id))
            .map(|(key, _)| key);

        if let Some(victim) = victim {
            let survivors = self.manager.preempt(victim, &mut self.cluster)?;
            self.manager.reset_interference(&survivors);
        }
        Ok(())
    }

    /// Snapshot of the run so far
    pub fn report(&self) -> SimulationReport {
        let finished: Vec<_> = self
            .manager
            .finished_jobs()
            .iter()
            .filter_map(|key| self.manager.job(*key))
            .collect();
        let count = finished.len().max(1) as f64;
        let avg_pending_time =
            finished.iter().map(|job| job.pending_time as f64).sum::<f64>() / count;
        let avg_completion_time = finished
            .iter()
            .filter_map(|job| job.finish_time.map(|t| t as f64 - job.submit_time))
            .sum::<f64>()
            / count;

        SimulationReport {
            generated_at: Utc::now(),
            schedule: self.schedule.to_string(),
            replay: self.replay,
            ticks: self.now,
            jobs_submitted: self.manager.jobs_seen(),
            jobs_finished: self.manager.total_finished_jobs(),
            jobs_running: self.manager.running_jobs().len(),
            jobs_queued: self.manager.queuing_jobs(None),
            preemptions: self.manager.preemptions(),
            avg_pending_time,
            avg_completion_time,
            mean_gpu_utilization: self.utilization_sum / self.now.max(1) as f64,
            peak_gpu_utilization: self.peak_utilization,
        }
    }

    /// Running jobs hosted on more than one node
    pub fn scattered_jobs(&self) -> BTreeSet<JobKey> {
        self.manager
            .running_jobs()
            .iter()
            .filter(|key| {
                self.manager
                    .job(**key)
                    .is_some_and(|job| job.hosting_nodes().len() > 1)
            })
            .copied()
            .collect()
    }
}
