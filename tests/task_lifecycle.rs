mod harness;

use harness::{ProcScript, Sim, XferScript};
use volcore::constants;
use volcore::process::ProcessPoll;
use volcore::result::ResultState;
use volcore::state::RunMode;

const URL: &str = "https://proj.example/";

fn quiet_sim() -> Sim {
    let mut sim = Sim::new();
    sim.add_project(URL);
    // Keep the work-fetch engine from issuing RPCs during task tests.
    sim.project_mut(URL).dont_request_more_work = true;
    sim.add_app(URL, "solver");
    sim
}

#[test]
fn successful_task_flows_through_upload() {
    let mut sim = quiet_sim();
    sim.add_job(URL, "solver", "wu_1", "res_1");
    sim.proc.push(ProcScript::Outcome(ProcessPoll::Exited {
        code: 0,
        cpu_secs: 10.0,
    }));

    // Inputs are already present, so the first tick launches the worker.
    sim.tick();
    assert_eq!(sim.proc.n_starts(), 1);
    assert_eq!(sim.state.active_tasks.tasks.len(), 1);
    // The input was hard-linked into slot 0 under its open name.
    assert!(sim.state.slot_path(0).join("wu_1_in").exists());

    // The worker "writes" its output, then exits on the next poll.
    std::fs::write(sim.state.slot_path(0).join("res_1_out"), b"answer").unwrap();
    sim.tick();
    let r = sim.result("res_1");
    assert_eq!(r.state, ResultState::FilesUploading);
    assert_eq!(r.exit_status, Some(0));
    assert!(r.final_cpu_time >= 10.0);
    assert!(sim.state.active_tasks.tasks.is_empty());
    // Output moved out of the slot into the project directory.
    assert!(sim.state.file_path_of(URL, "res_1_out").exists());
    assert!(!sim.state.slot_path(0).join("res_1_out").exists());

    // Upload it and the result becomes reportable.
    sim.xfer.push(XferScript::Done {
        status: 200,
        write: None,
    });
    sim.tick(); // transfer created and started
    sim.tick(); // completion folded in
    assert!(sim.file(URL, "res_1_out").uploaded);
    assert_eq!(sim.result("res_1").state, ResultState::FilesUploaded);
    assert!(sim.result("res_1").ready_to_report());
}

#[test]
fn crash_by_signal_is_recorded_and_not_retried() {
    let mut sim = quiet_sim();
    sim.add_job(URL, "solver", "wu_1", "res_1");
    sim.proc.push(ProcScript::Outcome(ProcessPoll::Signaled {
        signal: 11,
        cpu_secs: 3.0,
    }));

    sim.tick();
    sim.tick();
    let r = sim.result("res_1");
    assert_eq!(r.state, ResultState::ComputeError);
    assert_eq!(r.signal, Some(11));
    assert_eq!(r.exit_status, None);
    assert!(sim.state.active_tasks.tasks.is_empty());
    // Slot reclaimed and no relaunch on later ticks.
    assert!(std::fs::read_dir(sim.state.slot_path(0))
        .map(|mut d| d.next().is_none())
        .unwrap_or(true));
    sim.tick();
    assert_eq!(sim.proc.n_starts(), 1);
}

#[test]
fn nonzero_exit_is_a_compute_error() {
    let mut sim = quiet_sim();
    sim.add_job(URL, "solver", "wu_1", "res_1");
    sim.proc.push(ProcScript::Outcome(ProcessPoll::Exited {
        code: 7,
        cpu_secs: 1.0,
    }));

    sim.tick();
    sim.tick();
    let r = sim.result("res_1");
    assert_eq!(r.state, ResultState::ComputeError);
    assert_eq!(r.exit_status, Some(7));
}

#[test]
fn launch_failure_marks_result_could_not_start() {
    let mut sim = quiet_sim();
    sim.add_job(URL, "solver", "wu_1", "res_1");
    sim.proc.push(ProcScript::FailStart("exec format error".into()));

    sim.tick();
    let r = sim.result("res_1");
    assert_eq!(r.state, ResultState::ComputeError);
    assert_eq!(r.exit_status, Some(constants::ERR_COULD_NOT_START));
    assert!(r.stderr_out.contains("exec format error"));
    assert!(sim.state.active_tasks.tasks.is_empty());
    assert_eq!(sim.proc.n_starts(), 0);
}

#[test]
fn task_count_is_bounded_by_cpus() {
    let mut sim = quiet_sim();
    sim.state.host_info.p_ncpus = 2;
    sim.add_job(URL, "solver", "wu_1", "res_1");
    sim.add_job(URL, "solver", "wu_2", "res_2");
    sim.add_job(URL, "solver", "wu_3", "res_3");

    sim.tick();
    assert_eq!(sim.proc.n_starts(), 2);
    assert_eq!(sim.state.active_tasks.n_running(), 2);
    // Distinct slots.
    let slots: Vec<usize> = sim.state.active_tasks.tasks.iter().map(|t| t.slot).collect();
    assert_ne!(slots[0], slots[1]);
}

#[test]
fn suspend_and_resume_signal_each_task_once() {
    let mut sim = quiet_sim();
    sim.add_job(URL, "solver", "wu_1", "res_1");
    sim.tick();
    assert_eq!(sim.state.active_tasks.n_running(), 1);

    sim.state.run_mode = RunMode::Never;
    sim.tick();
    assert_eq!(sim.proc.suspends(), 1);
    assert!(sim.state.computing_suspended);
    sim.tick();
    sim.tick();
    assert_eq!(sim.proc.suspends(), 1);

    sim.state.run_mode = RunMode::Always;
    sim.tick();
    assert_eq!(sim.proc.resumes(), 1);
    assert!(!sim.state.computing_suspended);
}

#[test]
fn running_tasks_are_relaunched_after_restart() {
    let mut sim = quiet_sim();
    sim.add_job(URL, "solver", "wu_1", "res_1");
    sim.tick();
    assert_eq!(sim.state.active_tasks.n_running(), 1);
    sim.state.save().unwrap();

    let sim = sim.reopen();
    // Fresh process mock, so the single start is the relaunch.
    assert_eq!(sim.proc.n_starts(), 1);
    assert_eq!(sim.state.active_tasks.n_running(), 1);
    assert_eq!(sim.state.active_tasks.tasks[0].result_name, "res_1");
    assert_eq!(sim.state.active_tasks.tasks[0].slot, 0);
    assert_eq!(sim.result("res_1").state, ResultState::FilesDownloaded);
}

#[test]
fn failed_relaunch_marks_the_result() {
    let mut sim = quiet_sim();
    sim.add_job(URL, "solver", "wu_1", "res_1");
    sim.tick();
    sim.state.save().unwrap();

    let harness::Sim { dir, .. } = sim;
    let mut sim = Sim::in_dir(dir);
    sim.proc.push(ProcScript::FailStart("binary vanished".into()));
    sim.state.startup().unwrap();

    assert!(sim.state.active_tasks.tasks.is_empty());
    let r = sim.result("res_1");
    assert_eq!(r.state, ResultState::ComputeError);
    assert_eq!(r.exit_status, Some(constants::ERR_RESTART_FAILED));
    assert!(r.stderr_out.contains("binary vanished"));
}

#[test]
fn kill_all_terminates_workers_but_stays_restartable() {
    let mut sim = quiet_sim();
    sim.add_job(URL, "solver", "wu_1", "res_1");
    sim.tick();
    assert_eq!(sim.state.active_tasks.n_running(), 1);

    sim.proc.set_live_cpu(7.5);
    sim.state.tasks_kill_all();
    sim.state.save().unwrap();
    assert_eq!(sim.proc.kills(), 1);
    assert_eq!(sim.state.active_tasks.tasks.len(), 1);
    assert_eq!(sim.state.active_tasks.n_running(), 0);

    // Next startup picks the task back up in its old slot, carrying the
    // CPU already burned.
    let sim = sim.reopen();
    assert_eq!(sim.proc.n_starts(), 1);
    assert_eq!(sim.state.active_tasks.n_running(), 1);
    assert_eq!(sim.state.active_tasks.tasks[0].slot, 0);
    assert_eq!(sim.state.active_tasks.tasks[0].checkpoint_cpu_time, 7.5);
}

#[test]
fn cpu_time_before_a_restart_is_not_lost() {
    let mut sim = quiet_sim();
    sim.add_job(URL, "solver", "wu_1", "res_1");
    sim.tick();
    sim.proc.set_live_cpu(40.0);
    sim.state.save().unwrap();

    let harness::Sim { dir, .. } = sim;
    let mut sim = Sim::in_dir(dir);
    sim.proc.push(ProcScript::Outcome(ProcessPoll::Exited {
        code: 0,
        cpu_secs: 5.0,
    }));
    sim.state.startup().unwrap();
    assert_eq!(sim.state.active_tasks.tasks[0].checkpoint_cpu_time, 40.0);

    sim.tick();
    assert_eq!(sim.result("res_1").final_cpu_time, 45.0);
}

#[test]
fn abort_kills_worker_and_marks_result() {
    let mut sim = quiet_sim();
    sim.add_job(URL, "solver", "wu_1", "res_1");
    sim.tick();
    assert_eq!(sim.state.active_tasks.n_running(), 1);

    sim.state.abort_task("res_1");
    assert_eq!(sim.proc.kills(), 1);
    assert!(sim.state.active_tasks.tasks.is_empty());
    let r = sim.result("res_1");
    assert_eq!(r.state, ResultState::Aborted);
    assert_eq!(r.exit_status, Some(constants::ERR_ABORTED_VIA_GUI));
}
