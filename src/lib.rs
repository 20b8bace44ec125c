//! Scheduling and execution core of a volunteer-computing client.
//!
//! The client attaches to remote projects, fetches computational jobs,
//! runs them as local worker processes, moves their files, and reports
//! completed work back — all driven by a single cooperative polling loop
//! (`state::ClientState::do_something`). Network transport and worker
//! process control are injected capabilities so the scheduling logic
//! stays testable without sockets or real child processes.

pub mod account;
pub mod active_tasks;
pub mod app;
pub mod backoff;
pub mod common;
pub mod constants;
pub mod errors;
pub mod file_info;
pub mod file_names;
pub mod hostinfo;
pub mod messages;
pub mod pers_file_xfer;
pub mod prefs;
pub mod process;
pub mod projects;
pub mod result;
pub mod scheduler_op;
pub mod state;
pub mod util;
pub mod work_fetch;
pub mod workunit;
pub mod xfers;
