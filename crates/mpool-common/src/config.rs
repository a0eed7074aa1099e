//! Configuration for the mpool metadata core
//!
//! Two kinds of configuration exist: `PoolConfig` is persisted in MDC0 as
//! an MPCONFIG record and travels with the pool; `PmdParams` are in-memory
//! tunables supplied at activation.

use uuid::Uuid;

/// Maximum label length persisted with the pool
pub const LABEL_MAX: usize = 64;

/// Persisted pool-wide configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Pool identity
    pub pool_id: Uuid,
    /// Operator label, at most [`LABEL_MAX`] bytes
    pub label: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_id: Uuid::new_v4(),
            label: String::new(),
        }
    }
}

/// Metadata core tunables
#[derive(Clone, Debug)]
pub struct PmdParams {
    /// Worker count for parallel MDC load at activation
    pub objloadjobs: u32,
    /// Capacity target for each mlog of a newly allocated MDC
    pub mdcncap: u64,
    /// Per-MDC compaction trigger: active mlog fill percentage (0-100)
    pub pcopctfull: u8,
    /// Per-MDC compaction trigger: garbage record percentage (0-100)
    pub pcopctgarbage: u8,
    /// New-MDC trigger: overall usage percentage across user MDCs (0-100)
    pub crtmdcpctfull: u8,
    /// New-MDC trigger: overall garbage percentage ceiling (0-100)
    pub crtmdcpctgrbg: u8,
    /// Pre-compaction tick period in seconds, clamped to [1, 3600]
    pub pcoperiod_secs: u64,
    /// MDCs after the current compaction target excluded from allocation
    pub pconbnoalloc: u32,
}

impl Default for PmdParams {
    fn default() -> Self {
        Self {
            objloadjobs: 8,
            mdcncap: 1024 * 1024,
            pcopctfull: 70,
            pcopctgarbage: 20,
            crtmdcpctfull: 80,
            crtmdcpctgrbg: 40,
            pcoperiod_secs: 60,
            pconbnoalloc: 2,
        }
    }
}

impl PmdParams {
    /// Pre-compaction period clamped to the supported range
    #[must_use]
    pub fn pcoperiod_clamped(&self) -> u64 {
        self.pcoperiod_secs.clamp(1, 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcoperiod_clamp() {
        let mut params = PmdParams {
            pcoperiod_secs: 0,
            ..Default::default()
        };
        assert_eq!(params.pcoperiod_clamped(), 1);

        params.pcoperiod_secs = 86400;
        assert_eq!(params.pcoperiod_clamped(), 3600);

        params.pcoperiod_secs = 300;
        assert_eq!(params.pcoperiod_clamped(), 300);
    }
}
