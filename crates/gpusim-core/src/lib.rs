//! gpusim-core: Core types for the gpusim cluster scheduling simulator
//!
//! This crate provides the fundamental types used throughout gpusim:
//! - Task and job records, and the keys addressing them in the job arena
//! - Resource vectors and checked reservation accounting
//! - Per-accelerator memory ledgers
//! - Configuration types
//! - Error handling

pub mod config;
pub mod device;
pub mod error;
pub mod model;
pub mod resources;

pub use config::*;
pub use device::*;
pub use error::*;
pub use model::*;
pub use resources::*;
