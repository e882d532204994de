//! gpusim-scheduler: Scheduling engine for the gpusim simulator
//!
//! This crate provides the moving parts of a simulated GPU cluster:
//! - Node resource accounting and transactional task placement
//! - Job queues with FIFO and priority ordering
//! - Workload sources (trace replay and synthetic generation)
//! - The jobs manager driving admission, preemption and completion
//! - The discrete-time simulation loop and its report

pub mod cluster;
pub mod jobs_manager;
pub mod node;
pub mod queue;
pub mod simulation;
pub mod source;

pub use cluster::Cluster;
pub use jobs_manager::{JobsManager, Poll};
pub use node::Node;
pub use queue::{JobQueueManager, QueueEntry, QueueOrdering};
pub use simulation::{Simulation, SimulationReport};
pub use source::{JobGenerator, JobSource, JobTraceReader};
