//! Scalar resource vectors and checked reservation accounting

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{SimError, SimResult};

/// CPU, GPU and host memory quantities
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: u32,
    pub gpu: u32,
    pub mem: u64,
}

impl Resources {
    pub fn new(cpu: u32, gpu: u32, mem: u64) -> Self {
        Self { cpu, gpu, mem }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    /// Whether every dimension of `demand` is covered by `self`
    pub fn covers(&self, demand: &Resources) -> bool {
        self.cpu >= demand.cpu && self.gpu >= demand.gpu && self.mem >= demand.mem
    }

    fn checked_add(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            cpu: self.cpu.checked_add(other.cpu)?,
            gpu: self.gpu.checked_add(other.gpu)?,
            mem: self.mem.checked_add(other.mem)?,
        })
    }

    fn checked_sub(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            cpu: self.cpu.checked_sub(other.cpu)?,
            gpu: self.gpu.checked_sub(other.gpu)?,
            mem: self.mem.checked_sub(other.mem)?,
        })
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu={} gpu={} mem={}", self.cpu, self.gpu, self.mem)
    }
}

/// Usage counters bounded by a fixed capacity
///
/// The only way to change the counters is through [`reserve`](Self::reserve)
/// and [`release`](Self::release), which refuse to leave `0 <= used <= capacity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLedger {
    capacity: Resources,
    used: Resources,
}

impl ResourceLedger {
    /// Create an empty ledger
    pub fn new(capacity: Resources) -> Self {
        Self {
            capacity,
            used: Resources::zero(),
        }
    }

    pub fn capacity(&self) -> Resources {
        self.capacity
    }

    pub fn used(&self) -> Resources {
        self.used
    }

    /// Capacity not currently reserved
    pub fn free(&self) -> Resources {
        // used <= capacity is maintained by reserve/release
        Resources {
            cpu: self.capacity.cpu - self.used.cpu,
            gpu: self.capacity.gpu - self.used.gpu,
            mem: self.capacity.mem - self.used.mem,
        }
    }

    /// Whether `demand` can be reserved right now
    pub fn fits(&self, demand: &Resources) -> bool {
        self.free().covers(demand)
    }

    /// Reserve `demand`, failing if any counter would exceed capacity
    pub fn reserve(&mut self, demand: &Resources) -> SimResult<()> {
        let next = self
            .used
            .checked_add(demand)
            .filter(|next| self.capacity.covers(next))
            .ok_or_else(|| {
                SimError::ResourceViolation(format!(
                    "reserving {} on top of {} exceeds capacity {}",
                    demand, self.used, self.capacity
                ))
            })?;
        self.used = next;
        Ok(())
    }

    /// Release `demand`, failing if any counter would go negative
    pub fn release(&mut self, demand: &Resources) -> SimResult<()> {
        self.used = self.used.checked_sub(demand).ok_or_else(|| {
            SimError::ResourceViolation(format!(
                "releasing {} from {} drives usage negative",
                demand, self.used
            ))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_then_release_restores_usage() {
        let mut ledger = ResourceLedger::new(Resources::new(8, 2, 16));
        let demand = Resources::new(4, 1, 8);

        ledger.reserve(&demand).unwrap();
        assert_eq!(ledger.used(), demand);
        assert_eq!(ledger.free(), Resources::new(4, 1, 8));

        ledger.release(&demand).unwrap();
        assert_eq!(ledger.used(), Resources::zero());
    }

    #[test]
    fn test_reserve_over_capacity_is_rejected() {
        let mut ledger = ResourceLedger::new(Resources::new(8, 1, 16));
        ledger.reserve(&Resources::new(2, 1, 2)).unwrap();

        let err = ledger.reserve(&Resources::new(2, 1, 2)).unwrap_err();
        assert!(matches!(err, SimError::ResourceViolation(_)));
        assert_eq!(ledger.used(), Resources::new(2, 1, 2));
    }

    #[test]
    fn test_double_release_is_rejected() {
        let mut ledger = ResourceLedger::new(Resources::new(8, 2, 16));
        let demand = Resources::new(1, 1, 1);
        ledger.reserve(&demand).unwrap();
        ledger.release(&demand).unwrap();

        assert!(ledger.release(&demand).is_err());
        assert_eq!(ledger.used(), Resources::zero());
    }

    #[test]
    fn test_fits() {
        let ledger = ResourceLedger::new(Resources::new(8, 2, 16));
        assert!(ledger.fits(&Resources::new(8, 2, 16)));
        assert!(!ledger.fits(&Resources::new(8, 3, 16)));
    }
}
