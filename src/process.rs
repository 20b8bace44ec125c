//! Worker-process capability. The active-task manager drives untrusted
//! worker executables through this trait; `OsProcessRunner` is the real
//! implementation on top of `std::process`, and tests substitute a
//! scripted one.

use std::collections::HashMap;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Instant;

use uuid::Uuid;

use crate::errors::{Error, R};

#[derive(Clone, Copy, Debug)]
pub enum ProcessPoll {
    Running,
    Exited { code: i32, cpu_secs: f64 },
    Signaled { signal: i32, cpu_secs: f64 },
    /// The process is gone but its fate could not be classified.
    Unknown,
}

pub trait ProcessCapability {
    fn start(
        &mut self,
        exe: &Path,
        args: &[String],
        cwd: &Path,
        stderr_file: &Path,
    ) -> R<Uuid>;
    /// Non-blocking; a handle stays pollable until the terminal status
    /// has been returned once.
    fn poll(&mut self, id: Uuid) -> ProcessPoll;
    /// CPU consumed so far by a still-running worker; `None` once the
    /// handle is gone.
    fn cpu_time(&self, id: Uuid) -> Option<f64>;
    fn suspend(&mut self, id: Uuid) -> R<()>;
    fn resume(&mut self, id: Uuid) -> R<()>;
    fn kill(&mut self, id: Uuid) -> R<()>;
}

struct RunningChild {
    child: Child,
    started: Instant,
    paused_total: f64,
    paused_since: Option<Instant>,
}

impl RunningChild {
    /// Workers are CPU-bound, so wall time excluding paused intervals is
    /// a serviceable CPU-time figure without platform accounting calls.
    fn cpu_secs(&self) -> f64 {
        let mut paused = self.paused_total;
        if let Some(since) = self.paused_since {
            paused += since.elapsed().as_secs_f64();
        }
        (self.started.elapsed().as_secs_f64() - paused).max(0.0)
    }
}

#[derive(Default)]
pub struct OsProcessRunner {
    children: HashMap<Uuid, RunningChild>,
}

impl OsProcessRunner {
    pub fn new() -> OsProcessRunner {
        OsProcessRunner::default()
    }

    #[cfg(unix)]
    fn signal(&mut self, id: Uuid, sig: i32) -> R<()> {
        let rc = self
            .children
            .get_mut(&id)
            .ok_or_else(|| Error::process(format!("no such process handle {}", id)))?;
        let pid = rc.child.id() as i32;
        let ret = unsafe { libc::kill(pid, sig) };
        if ret != 0 {
            return Err(Error::process(format!(
                "kill({}, {}) failed: {}",
                pid,
                sig,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

impl ProcessCapability for OsProcessRunner {
    fn start(
        &mut self,
        exe: &Path,
        args: &[String],
        cwd: &Path,
        stderr_file: &Path,
    ) -> R<Uuid> {
        let stderr = std::fs::File::create(stderr_file)
            .map_err(|e| Error::process(format!("cannot create {}: {}", stderr_file.display(), e)))?;
        let child = Command::new(exe)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr)
            .spawn()
            .map_err(|e| Error::process(format!("cannot start {}: {}", exe.display(), e)))?;
        let id = Uuid::new_v4();
        self.children.insert(
            id,
            RunningChild {
                child,
                started: Instant::now(),
                paused_total: 0.0,
                paused_since: None,
            },
        );
        Ok(id)
    }

    fn poll(&mut self, id: Uuid) -> ProcessPoll {
        let rc = match self.children.get_mut(&id) {
            Some(rc) => rc,
            None => return ProcessPoll::Unknown,
        };
        match rc.child.try_wait() {
            Ok(None) => ProcessPoll::Running,
            Ok(Some(status)) => {
                let cpu = rc.cpu_secs();
                let out = match status.code() {
                    Some(code) => ProcessPoll::Exited {
                        code,
                        cpu_secs: cpu,
                    },
                    None => {
                        #[cfg(unix)]
                        {
                            use std::os::unix::process::ExitStatusExt;
                            match status.signal() {
                                Some(sig) => ProcessPoll::Signaled {
                                    signal: sig,
                                    cpu_secs: cpu,
                                },
                                None => ProcessPoll::Unknown,
                            }
                        }
                        #[cfg(not(unix))]
                        {
                            ProcessPoll::Unknown
                        }
                    }
                };
                self.children.remove(&id);
                out
            }
            Err(_) => {
                self.children.remove(&id);
                ProcessPoll::Unknown
            }
        }
    }

    fn cpu_time(&self, id: Uuid) -> Option<f64> {
        self.children.get(&id).map(|rc| rc.cpu_secs())
    }

    #[cfg(unix)]
    fn suspend(&mut self, id: Uuid) -> R<()> {
        self.signal(id, libc::SIGSTOP)?;
        if let Some(rc) = self.children.get_mut(&id) {
            if rc.paused_since.is_none() {
                rc.paused_since = Some(Instant::now());
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    fn resume(&mut self, id: Uuid) -> R<()> {
        self.signal(id, libc::SIGCONT)?;
        if let Some(rc) = self.children.get_mut(&id) {
            if let Some(since) = rc.paused_since.take() {
                rc.paused_total += since.elapsed().as_secs_f64();
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    fn kill(&mut self, id: Uuid) -> R<()> {
        self.signal(id, libc::SIGKILL)
    }

    #[cfg(not(unix))]
    fn suspend(&mut self, _id: Uuid) -> R<()> {
        Err(Error::process("suspend unsupported on this platform"))
    }

    #[cfg(not(unix))]
    fn resume(&mut self, _id: Uuid) -> R<()> {
        Err(Error::process("resume unsupported on this platform"))
    }

    #[cfg(not(unix))]
    fn kill(&mut self, id: Uuid) -> R<()> {
        match self.children.get_mut(&id) {
            Some(rc) => rc.child.kill().map_err(|e| Error::process(e.to_string())),
            None => Err(Error::process(format!("no such process handle {}", id))),
        }
    }
}
