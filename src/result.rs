use serde::{Deserialize, Serialize};

use crate::common::Time;
use crate::file_info::FileRef;

/// Lifecycle of one attempt at computing a workunit. Running is not a
/// state here: a result in `FilesDownloaded` with an active task is
/// running; the task's completion moves it forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultState {
    New,
    FilesDownloading,
    FilesDownloaded,
    ComputeError,
    FilesUploading,
    FilesUploaded,
    AckedByServer,
    Aborted,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultInfo {
    pub name: String,
    pub wu_name: String,
    pub project_url: String,
    pub report_deadline: Time,
    pub received_time: Time,
    pub output_files: Vec<FileRef>,
    pub state: ResultState,
    pub exit_status: Option<i32>,
    /// Set when the worker was terminated by a signal.
    pub signal: Option<i32>,
    pub stderr_out: String,
    pub final_cpu_time: f64,
    pub suspended_via_gui: bool,
}

impl ResultInfo {
    pub fn new(name: &str, wu_name: &str, project_url: &str, now: Time, deadline: Time) -> Self {
        ResultInfo {
            name: name.into(),
            wu_name: wu_name.into(),
            project_url: project_url.into(),
            report_deadline: deadline,
            received_time: now,
            output_files: Vec::new(),
            state: ResultState::New,
            exit_status: None,
            signal: None,
            stderr_out: String::new(),
            final_cpu_time: 0.0,
            suspended_via_gui: false,
        }
    }

    /// Eligible to start computing (modulo an available slot and the
    /// one-active-task-per-result invariant).
    pub fn runnable(&self) -> bool {
        self.state == ResultState::FilesDownloaded && !self.suspended_via_gui
    }

    pub fn computing_done(&self) -> bool {
        !matches!(
            self.state,
            ResultState::New | ResultState::FilesDownloading | ResultState::FilesDownloaded
        )
    }

    /// Finished (successfully or not) and awaiting server acknowledgement.
    pub fn ready_to_report(&self) -> bool {
        matches!(
            self.state,
            ResultState::FilesUploaded | ResultState::ComputeError | ResultState::Aborted
        )
    }

    pub fn acked(&self) -> bool {
        self.state == ResultState::AckedByServer
    }

    /// Queued or in-progress work that still costs CPU time.
    pub fn not_finished(&self) -> bool {
        !self.computing_done()
    }
}
