use serde::{Deserialize, Serialize};

use crate::file_info::FileRef;

/// Immutable job description, shared by at most one in-flight result on
/// this host; owned by its project.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Workunit {
    pub name: String,
    pub project_url: String,
    pub app_name: String,
    pub version_num: i32,
    pub command_line: String,
    pub input_files: Vec<FileRef>,
    pub rsc_fpops_est: f64,
    pub rsc_fpops_bound: f64,
    pub rsc_memory_bound: f64,
    pub rsc_disk_bound: f64,
}

impl Workunit {
    /// Estimated CPU seconds on a host of the given speed, corrected by
    /// the project's duration correction factor.
    pub fn estimated_cpu_time(&self, fpops: f64, dcf: f64) -> f64 {
        if self.rsc_fpops_est <= 0.0 {
            return 0.0;
        }
        self.rsc_fpops_est / fpops.max(1.0) * dcf
    }
}
