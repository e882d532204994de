//! Configuration types for gpusim

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::{Resources, SimError, SimResult};

/// Queue admission and insertion policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SchedulePolicy {
    /// Single queue, arrival order
    Fifo,
    /// Single queue ordered by the queue's priority comparator
    Horus,
    /// Multiple queues assigned by clustering (not implemented)
    HorusPlus,
}

impl SchedulePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulePolicy::Fifo => "fifo",
            SchedulePolicy::Horus => "horus",
            SchedulePolicy::HorusPlus => "horus+",
        }
    }
}

impl FromStr for SchedulePolicy {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fifo" => Ok(SchedulePolicy::Fifo),
            "horus" => Ok(SchedulePolicy::Horus),
            "horus+" => Ok(SchedulePolicy::HorusPlus),
            other => Err(SimError::UnsupportedPolicy(other.to_string())),
        }
    }
}

impl TryFrom<String> for SchedulePolicy {
    type Error = SimError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SchedulePolicy> for String {
    fn from(policy: SchedulePolicy) -> Self {
        policy.as_str().to_string()
    }
}

impl fmt::Display for SchedulePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Top-level simulator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Scheduling policy
    pub schedule: SchedulePolicy,
    /// Workload trace to replay; synthetic generation when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_file: Option<PathBuf>,
    /// Seed for the synthetic workload generator
    pub seed: u64,
    /// Cluster shape
    pub cluster: ClusterConfig,
    /// Queue layout
    pub queue: QueueConfig,
    /// Per-task resource demand
    pub task_shape: TaskShape,
    /// Synthetic workload parameters
    pub generator: GeneratorConfig,
    /// Driving loop parameters
    pub simulation: SimulationConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            schedule: SchedulePolicy::Fifo,
            trace_file: None,
            seed: 42,
            cluster: ClusterConfig::default(),
            queue: QueueConfig::default(),
            task_shape: TaskShape::default(),
            generator: GeneratorConfig::default(),
            simulation: SimulationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl SimConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> SimResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SimError::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> SimResult<Self> {
        let config: SimConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject shapes the simulator cannot run
    pub fn validate(&self) -> SimResult<()> {
        if self.queue.num_queues == 0 {
            return Err(SimError::Config("queue.num_queues must be at least 1".into()));
        }
        if self.cluster.racks == 0 || self.cluster.nodes_per_rack == 0 {
            return Err(SimError::Config("cluster must contain at least one node".into()));
        }
        if self.cluster.node_count().is_none() {
            return Err(SimError::Config(
                "cluster.racks * cluster.nodes_per_rack overflows".into(),
            ));
        }
        if !self.generator.min_minutes.is_finite() || !self.generator.max_minutes.is_finite() {
            return Err(SimError::Config(
                "generator.min_minutes and generator.max_minutes must be finite".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.generator.arrival_probability) {
            return Err(SimError::Config(
                "generator.arrival_probability must be within [0, 1]".into(),
            ));
        }
        if self.generator.min_minutes > self.generator.max_minutes {
            return Err(SimError::Config(
                "generator.min_minutes exceeds generator.max_minutes".into(),
            ));
        }
        Ok(())
    }
}

/// Cluster shape: `racks * nodes_per_rack` identical nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub racks: u32,
    pub nodes_per_rack: u32,
    /// CPUs per node
    pub cpus: u32,
    /// GPUs per node
    pub gpus: u32,
    /// Host memory per node
    pub memory: u64,
    /// Memory per accelerator in MiB
    pub gpu_memory_capacity: f64,
    /// Use pack-aware admission
    pub enable_pack: bool,
}

impl ClusterConfig {
    /// Total number of nodes, `None` on overflow
    pub fn node_count(&self) -> Option<usize> {
        let count = self.racks.checked_mul(self.nodes_per_rack)?;
        usize::try_from(count).ok()
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            racks: 1,
            nodes_per_rack: 4,
            cpus: 32,
            gpus: 4,
            memory: 64,
            gpu_memory_capacity: 16_384.0,
            enable_pack: false,
        }
    }
}

/// Queue layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub num_queues: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { num_queues: 1 }
    }
}

/// Resource demand of every generated task
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskShape {
    pub cpu: u32,
    pub gpu: u32,
    pub mem: u64,
}

impl Default for TaskShape {
    fn default() -> Self {
        Self {
            cpu: 4,
            gpu: 1,
            mem: 6,
        }
    }
}

impl From<TaskShape> for Resources {
    fn from(shape: TaskShape) -> Self {
        Resources::new(shape.cpu, shape.gpu, shape.mem)
    }
}

/// Synthetic workload parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Chance of an arrival burst on each tick
    pub arrival_probability: f64,
    /// Upper bound on jobs in one burst
    pub max_jobs_per_tick: u32,
    /// Upper bound on GPUs per job
    pub max_gpus_per_job: u32,
    pub min_minutes: f64,
    pub max_minutes: f64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            arrival_probability: 0.3,
            max_jobs_per_tick: 2,
            max_gpus_per_job: 4,
            min_minutes: 5.0,
            max_minutes: 60.0,
        }
    }
}

/// Driving loop parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Stop after this many ticks
    pub max_ticks: u64,
    /// Multiplier applied to job durations in minutes
    pub scale_factor: f64,
    /// Allow a job's tasks to be spread over several nodes
    pub multi_node: bool,
    /// Preempt a running job once a queue head has waited this long
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preempt_after_ticks: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            max_ticks: 1_000,
            scale_factor: 1.0,
            multi_node: false,
            preempt_after_ticks: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}
