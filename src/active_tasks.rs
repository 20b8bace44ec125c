//! Active Task Manager: owns the set of running worker processes, one
//! per result at most. Launch failures and crashes are recorded on the
//! result and reported to the project; retry is a higher-level decision
//! and never happens here.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::MessagePriority;
use crate::constants;
use crate::errors::{Error, R};
use crate::file_info::{FileRef, FileStatus};
use crate::process::ProcessPoll;
use crate::result::ResultState;
use crate::state::{file_key, lookup_app_version, ClientState};
use crate::util;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Uninitialized,
    Running,
    Exited,
    Signaled,
    CouldNotStart,
    ExitUnknown,
}

#[derive(Clone, Debug)]
pub struct ActiveTask {
    pub result_name: String,
    pub slot: usize,
    pub state: TaskState,
    pub paused: bool,
    /// CPU time carried over from before the last client restart.
    pub checkpoint_cpu_time: f64,
    pub handle: Option<Uuid>,
}

/// Persisted form: enough to relaunch after a client restart.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SavedActiveTask {
    pub result_name: String,
    pub slot: usize,
    pub checkpoint_cpu_time: f64,
}

#[derive(Clone, Debug, Default)]
pub struct ActiveTaskSet {
    pub tasks: Vec<ActiveTask>,
}

impl ActiveTaskSet {
    pub fn from_saved(saved: Vec<SavedActiveTask>) -> ActiveTaskSet {
        ActiveTaskSet {
            tasks: saved
                .into_iter()
                .map(|s| ActiveTask {
                    result_name: s.result_name,
                    slot: s.slot,
                    state: TaskState::Uninitialized,
                    paused: false,
                    checkpoint_cpu_time: s.checkpoint_cpu_time,
                    handle: None,
                })
                .collect(),
        }
    }

    pub fn lookup(&self, result_name: &str) -> Option<&ActiveTask> {
        self.tasks.iter().find(|t| t.result_name == result_name)
    }

    pub fn n_running(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.state == TaskState::Running)
            .count()
    }

    /// Lowest-numbered slot directory not in use.
    pub fn free_slot(&self) -> usize {
        let mut n = 0;
        while self.tasks.iter().any(|t| t.slot == n) {
            n += 1;
        }
        n
    }
}

impl ClientState {
    /// Start tasks for runnable results, earliest deadline first, up to
    /// the CPU count. A launch failure is folded into the result right
    /// here so the next candidate gets a chance the same tick.
    pub fn start_runnable_results(&mut self) -> bool {
        let ncpus = self.ncpus() as usize;
        let mut acted = false;
        loop {
            if self.active_tasks.n_running() >= ncpus {
                break;
            }
            let candidate = self
                .results
                .values()
                .filter(|r| r.runnable() && self.active_tasks.lookup(&r.name).is_none())
                .min_by_key(|r| r.report_deadline)
                .map(|r| r.name.clone());
            let name = match candidate {
                Some(n) => n,
                None => break,
            };
            match self.insert_task(&name) {
                Ok(()) => {
                    self.msg(
                        Some(&self.results[&name].project_url.clone()),
                        MessagePriority::Info,
                        &format!("starting task {}", name),
                    );
                }
                Err(e) => {
                    self.record_launch_failure(&name, &e.to_string());
                }
                // Either way the result left the runnable set.
            }
            self.dirty = true;
            acted = true;
        }
        acted
    }

    fn record_launch_failure(&mut self, result_name: &str, why: &str) {
        if let Some(r) = self.results.get_mut(result_name) {
            r.state = ResultState::ComputeError;
            r.exit_status = Some(constants::ERR_COULD_NOT_START);
            r.stderr_out = format!("couldn't start worker: {}", why);
            let url = r.project_url.clone();
            self.msg(
                Some(&url),
                MessagePriority::UserAlert,
                &format!("task {} could not start: {}", result_name, why),
            );
        }
    }

    /// Allocate a slot, bind files, launch the worker.
    fn insert_task(&mut self, result_name: &str) -> R<()> {
        let r = self
            .results
            .get(result_name)
            .ok_or_else(|| Error::no_such("result", result_name))?;
        let wu = self
            .workunits
            .get(&r.wu_name)
            .ok_or_else(|| Error::no_such("workunit", &r.wu_name))?;
        let version = lookup_app_version(
            &self.app_versions,
            &wu.project_url,
            &wu.app_name,
            wu.version_num,
        )
        .ok_or_else(|| Error::process(format!("no usable version of app {}", wu.app_name)))?;

        let project_url = wu.project_url.clone();
        let exec_file = version.exec_file.clone();
        let args: Vec<String> = wu
            .command_line
            .split_whitespace()
            .map(|s| s.to_owned())
            .collect();

        let slot = self.active_tasks.free_slot();
        let slot_dir = self.slot_path(slot);
        std::fs::create_dir_all(&slot_dir)?;
        util::clean_out_dir(&slot_dir)?;
        self.bind_result_files(result_name, slot)?;

        let exe = self.file_path_of(&project_url, &exec_file);
        let stderr_path = slot_dir.join(crate::file_names::STDERR_FILE_NAME);
        let handle = self.process.start(&exe, &args, &slot_dir, &stderr_path)?;

        self.active_tasks.tasks.push(ActiveTask {
            result_name: result_name.to_owned(),
            slot,
            state: TaskState::Running,
            paused: false,
            checkpoint_cpu_time: 0.0,
            handle: Some(handle),
        });
        Ok(())
    }

    /// Link or copy the job's input files into the slot. Already-bound
    /// files are left alone, which is what makes restart re-binding
    /// cheap and idempotent.
    fn bind_result_files(&self, result_name: &str, slot: usize) -> R<()> {
        let r = self
            .results
            .get(result_name)
            .ok_or_else(|| Error::no_such("result", result_name))?;
        let wu = self
            .workunits
            .get(&r.wu_name)
            .ok_or_else(|| Error::no_such("workunit", &r.wu_name))?;
        let slot_dir = self.slot_path(slot);

        for fr in &wu.input_files {
            let key = file_key(&wu.project_url, &fr.file_name);
            let fi = self
                .file_infos
                .get(&key)
                .ok_or_else(|| Error::no_such("file", &fr.file_name))?;
            if fi.status != FileStatus::Present {
                return Err(Error::process(format!(
                    "input file {} not present",
                    fr.file_name
                )));
            }
            let src = self.file_path_of(&wu.project_url, &fr.file_name);
            let dst = slot_dir.join(&fr.open_name);
            if dst.exists() {
                continue;
            }
            if fr.copy_file {
                std::fs::copy(&src, &dst)?;
            } else if std::fs::hard_link(&src, &dst).is_err() {
                // Cross-device slot layout; fall back to a copy.
                std::fs::copy(&src, &dst)?;
            }
        }
        Ok(())
    }

    /// Non-blocking check for exited workers. Completions are folded
    /// into their results and the slot reclaimed in the same tick.
    pub fn active_tasks_poll(&mut self) -> bool {
        let mut completions: Vec<(usize, ProcessPoll)> = Vec::new();
        for (i, t) in self.active_tasks.tasks.iter().enumerate() {
            if t.state != TaskState::Running {
                continue;
            }
            let handle = match t.handle {
                Some(h) => h,
                None => continue,
            };
            match self.process.poll(handle) {
                ProcessPoll::Running => {}
                outcome => completions.push((i, outcome)),
            }
        }
        if completions.is_empty() {
            return false;
        }

        for &(i, outcome) in &completions {
            self.finalize_task(i, outcome);
        }
        self.active_tasks
            .tasks
            .retain(|t| t.state == TaskState::Running || t.state == TaskState::Uninitialized);
        self.dirty = true;
        true
    }

    fn finalize_task(&mut self, index: usize, outcome: ProcessPoll) {
        let (result_name, slot, checkpoint) = {
            let t = &self.active_tasks.tasks[index];
            (t.result_name.clone(), t.slot, t.checkpoint_cpu_time)
        };
        let slot_dir = self.slot_path(slot);
        let stderr_tail = util::read_file_tail(
            &slot_dir.join(crate::file_names::STDERR_FILE_NAME),
            constants::STDERR_TAIL_LEN,
        );

        let (task_state, exit_status, signal, cpu) = match outcome {
            ProcessPoll::Exited { code, cpu_secs } => {
                (TaskState::Exited, Some(code), None, cpu_secs)
            }
            ProcessPoll::Signaled { signal, cpu_secs } => {
                (TaskState::Signaled, None, Some(signal), cpu_secs)
            }
            _ => (TaskState::ExitUnknown, None, None, 0.0),
        };
        self.active_tasks.tasks[index].state = task_state;
        self.active_tasks.tasks[index].handle = None;

        let success = task_state == TaskState::Exited && exit_status == Some(0);
        let mut project_url = String::new();
        let mut outputs: Vec<FileRef> = Vec::new();
        let mut estimated = 0.0;
        if let Some(r) = self.results.get_mut(&result_name) {
            project_url = r.project_url.clone();
            r.final_cpu_time = checkpoint + cpu;
            r.stderr_out = stderr_tail;
            r.exit_status = exit_status;
            r.signal = signal;
            if success {
                r.state = ResultState::FilesUploading;
                outputs = r.output_files.clone();
            } else {
                r.state = ResultState::ComputeError;
            }
        }
        if let Some(wu) = self
            .results
            .get(&result_name)
            .and_then(|r| self.workunits.get(&r.wu_name))
        {
            estimated = wu.estimated_cpu_time(self.host_info.usable_fpops(), 1.0);
        }

        if success {
            // Move outputs out of the slot so the directory can be
            // reclaimed and uploads can proceed.
            for fr in &outputs {
                let src = slot_dir.join(&fr.open_name);
                let dst = self.file_path_of(&project_url, &fr.file_name);
                let key = file_key(&project_url, &fr.file_name);
                if src.exists() {
                    if let Some(parent) = dst.parent() {
                        let _ = std::fs::create_dir_all(parent);
                    }
                    let moved = std::fs::rename(&src, &dst)
                        .or_else(|_| std::fs::copy(&src, &dst).map(|_| ()));
                    if let (Ok(()), Some(fi)) = (moved, self.file_infos.get_mut(&key)) {
                        fi.status = FileStatus::Present;
                        if let Ok(meta) = std::fs::metadata(&dst) {
                            fi.nbytes = meta.len();
                        }
                    }
                } else if let Some(fi) = self.file_infos.get_mut(&key) {
                    fi.record_failure("output file missing");
                }
            }
            if let Some(p) = self.projects.get_mut(&project_url) {
                let actual = checkpoint + cpu;
                p.update_dcf(estimated, actual);
            }
            self.msg(
                Some(&project_url),
                MessagePriority::Info,
                &format!("task {} finished", result_name),
            );
        } else {
            let what = match (exit_status, signal) {
                (_, Some(sig)) => format!("task {} exited with signal {}", result_name, sig),
                (Some(code), _) => format!("task {} exited with status {}", result_name, code),
                _ => format!("task {} exited, outcome unknown", result_name),
            };
            self.msg(Some(&project_url), MessagePriority::UserAlert, &what);
        }

        let _ = util::clean_out_dir(&slot_dir);
    }

    /// Stop every running worker without destroying state. Used by the
    /// power/idle policy, distinct from termination.
    pub fn tasks_suspend_all(&mut self) {
        for t in &mut self.active_tasks.tasks {
            if t.state == TaskState::Running && !t.paused {
                if let Some(h) = t.handle {
                    match self.process.suspend(h) {
                        Ok(()) => t.paused = true,
                        Err(e) => tracing::warn!(task = %t.result_name, error = %e, "suspend failed"),
                    }
                }
            }
        }
    }

    pub fn tasks_resume_all(&mut self) {
        for t in &mut self.active_tasks.tasks {
            if t.state == TaskState::Running && t.paused {
                if let Some(h) = t.handle {
                    match self.process.resume(h) {
                        Ok(()) => t.paused = false,
                        Err(e) => tracing::warn!(task = %t.result_name, error = %e, "resume failed"),
                    }
                }
            }
        }
    }

    /// Relaunch every task that was active when the client last stopped.
    /// Files are re-bound but existing links are left alone. A task that
    /// fails to relaunch marks its result, never silently dropped.
    pub fn restart_tasks(&mut self) {
        let to_restart: Vec<(String, usize)> = self
            .active_tasks
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::Uninitialized)
            .map(|t| (t.result_name.clone(), t.slot))
            .collect();

        for (result_name, slot) in to_restart {
            let outcome = self.restart_one(&result_name, slot);
            match outcome {
                Ok(()) => {
                    self.msg(None, MessagePriority::Info, &format!("restarted task {}", result_name));
                }
                Err(e) => {
                    self.active_tasks.tasks.retain(|t| t.result_name != result_name);
                    if let Some(r) = self.results.get_mut(&result_name) {
                        r.state = ResultState::ComputeError;
                        r.exit_status = Some(constants::ERR_RESTART_FAILED);
                        r.stderr_out = format!("failed to restart after client shutdown: {}", e);
                        let url = r.project_url.clone();
                        self.msg(
                            Some(&url),
                            MessagePriority::UserAlert,
                            &format!("task {} failed to restart: {}", result_name, e),
                        );
                    }
                    self.dirty = true;
                }
            }
        }
    }

    fn restart_one(&mut self, result_name: &str, slot: usize) -> R<()> {
        let r = self
            .results
            .get(result_name)
            .ok_or_else(|| Error::no_such("result", result_name))?;
        let wu = self
            .workunits
            .get(&r.wu_name)
            .ok_or_else(|| Error::no_such("workunit", &r.wu_name))?;
        let version = lookup_app_version(
            &self.app_versions,
            &wu.project_url,
            &wu.app_name,
            wu.version_num,
        )
        .ok_or_else(|| Error::process(format!("no usable version of app {}", wu.app_name)))?;
        let project_url = wu.project_url.clone();
        let exec_file = version.exec_file.clone();
        let args: Vec<String> = wu
            .command_line
            .split_whitespace()
            .map(|s| s.to_owned())
            .collect();

        let slot_dir = self.slot_path(slot);
        std::fs::create_dir_all(&slot_dir)?;
        self.bind_result_files(result_name, slot)?;

        let exe = self.file_path_of(&project_url, &exec_file);
        let stderr_path = slot_dir.join(crate::file_names::STDERR_FILE_NAME);
        let handle = self.process.start(&exe, &args, &slot_dir, &stderr_path)?;

        for t in &mut self.active_tasks.tasks {
            if t.result_name == result_name {
                t.state = TaskState::Running;
                t.handle = Some(handle);
            }
        }
        Ok(())
    }

    /// Snapshot for the state file. A running task's current session is
    /// folded into its checkpoint, so CPU spent before a restart counts
    /// toward the final figure.
    pub fn active_tasks_snapshot(&self) -> Vec<SavedActiveTask> {
        self.active_tasks
            .tasks
            .iter()
            .map(|t| SavedActiveTask {
                result_name: t.result_name.clone(),
                slot: t.slot,
                checkpoint_cpu_time: t.checkpoint_cpu_time
                    + t.handle
                        .and_then(|h| self.process.cpu_time(h))
                        .unwrap_or(0.0),
            })
            .collect()
    }

    /// Shutdown path: terminate every worker but keep the task records,
    /// so the next startup relaunches them from their checkpoints.
    pub fn tasks_kill_all(&mut self) {
        for t in &mut self.active_tasks.tasks {
            if let Some(h) = t.handle.take() {
                if let Some(cpu) = self.process.cpu_time(h) {
                    t.checkpoint_cpu_time += cpu;
                }
                let _ = self.process.kill(h);
            }
            t.state = TaskState::Uninitialized;
            t.paused = false;
        }
    }

    /// User-initiated abort: kill the worker, mark the result, reclaim
    /// the slot.
    pub fn abort_task(&mut self, result_name: &str) {
        let found = self
            .active_tasks
            .tasks
            .iter()
            .position(|t| t.result_name == result_name);
        if let Some(i) = found {
            if let Some(h) = self.active_tasks.tasks[i].handle.take() {
                let _ = self.process.kill(h);
            }
            let slot = self.active_tasks.tasks[i].slot;
            let _ = util::clean_out_dir(&self.slot_path(slot));
            self.active_tasks.tasks.remove(i);
        }
        if let Some(r) = self.results.get_mut(result_name) {
            if !r.computing_done() {
                r.state = ResultState::Aborted;
                r.exit_status = Some(constants::ERR_ABORTED_VIA_GUI);
            }
        }
        self.dirty = true;
    }
}
