//! Host snapshot included in every scheduler request. Benchmark figures
//! come from an external measurement tool; when absent, conservative
//! defaults keep time estimates usable.

use serde::{Deserialize, Serialize};

use crate::constants;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostInfo {
    pub tz_shift: i64,
    pub domain_name: String,
    pub ip_addr: String,
    pub host_cpid: String,

    pub p_ncpus: i64,
    pub p_vendor: String,
    pub p_model: String,
    pub p_fpops: f64,
    pub p_iops: f64,
    pub p_membw: f64,
    pub p_calculated: f64,

    pub m_nbytes: f64,
    pub m_cache: f64,
    pub m_swap: f64,

    pub d_total: f64,
    pub d_free: f64,

    pub os_name: String,
    pub os_version: String,
}

impl HostInfo {
    /// Flops figure for time estimates, falling back to a default when
    /// benchmarks have never run.
    pub fn usable_fpops(&self) -> f64 {
        if self.p_fpops > 0.0 {
            self.p_fpops
        } else {
            constants::DEFAULT_FPOPS
        }
    }

    pub fn usable_ncpus(&self, max_ncpus: i64) -> i64 {
        let detected = self.p_ncpus.max(1);
        if max_ncpus > 0 {
            detected.min(max_ncpus)
        } else {
            detected
        }
    }
}
