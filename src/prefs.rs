//! Global preferences. Projects may send updated preferences with a
//! scheduler reply; until then the on-disk file (if any) or defaults
//! apply.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors;
use crate::util;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Prefs {
    /// Keep at least this many days of work queued.
    pub work_buf_min_days: f64,
    /// Ask for this much extra beyond the minimum.
    pub work_buf_additional_days: f64,
    /// CPU scheduling period; also the "overworked" debt threshold.
    pub cpu_scheduling_period_minutes: f64,
    /// Override the detected CPU count; 0 means use detected.
    pub max_ncpus: i64,
    /// Timestamp of the last server-side modification, echoed in RPCs.
    pub mod_time: f64,
}

impl Default for Prefs {
    fn default() -> Self {
        Prefs {
            work_buf_min_days: 0.1,
            work_buf_additional_days: 0.25,
            cpu_scheduling_period_minutes: 60.0,
            max_ncpus: 0,
            mod_time: 0.0,
        }
    }
}

impl Prefs {
    /// Missing file is not an error; defaults apply on a fresh install.
    pub fn load(path: &Path) -> errors::R<Prefs> {
        if !path.exists() {
            return Ok(Prefs::default());
        }
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn save(&self, path: &Path) -> errors::R<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        util::write_file_atomic(path, &bytes)
    }

    pub fn work_buf_total_days(&self) -> f64 {
        (self.work_buf_min_days + self.work_buf_additional_days).max(0.01)
    }

    pub fn work_buf_total_secs(&self) -> f64 {
        self.work_buf_total_days() * 86_400.0
    }

    pub fn cpu_scheduling_period_secs(&self) -> f64 {
        self.cpu_scheduling_period_minutes * 60.0
    }
}
