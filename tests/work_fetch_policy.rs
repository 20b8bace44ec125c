mod harness;

use harness::{HttpScript, Sim};
use volcore::active_tasks::{ActiveTask, TaskState};
use volcore::common::add_secs;
use volcore::constants;

const URL_A: &str = "https://a.example/";
const URL_B: &str = "https://b.example/";

fn two_project_sim() -> Sim {
    let mut sim = Sim::new();
    sim.add_project(URL_A);
    sim.add_project(URL_B);
    sim.state.now = sim.clock.now();
    sim
}

#[test]
fn deeper_debt_wins_the_fetch() {
    let mut sim = two_project_sim();
    sim.project_mut(URL_B).long_term_debt = -100.0;

    assert_eq!(sim.state.compute_work_requests().as_deref(), Some(URL_B));
    assert!(sim.project(URL_B).work_request_secs > 0.0);
}

#[test]
fn equal_scores_go_to_the_first_url_in_order() {
    let mut sim = two_project_sim();
    assert_eq!(sim.state.compute_work_requests().as_deref(), Some(URL_A));
}

#[test]
fn deadline_trouble_forfeits_priority() {
    let mut sim = two_project_sim();
    sim.state.host_info.p_ncpus = 2;
    sim.project_mut(URL_B).long_term_debt = -100.0;
    // One of B's jobs cannot make its deadline: an hour-long estimate
    // due in ten seconds.
    sim.add_app(URL_B, "solver");
    sim.add_job(URL_B, "solver", "wu_b", "res_b");
    sim.state.results.get_mut("res_b").unwrap().report_deadline =
        add_secs(sim.state.now, 10.0);

    assert_eq!(sim.state.compute_work_requests().as_deref(), Some(URL_A));
    assert!(sim.project(URL_B).deadline_misses > 0);
}

#[test]
fn a_project_full_of_misses_is_skipped_while_work_remains() {
    let mut sim = Sim::new();
    sim.add_project(URL_B);
    sim.state.now = sim.clock.now();
    sim.add_app(URL_B, "solver");
    sim.add_job(URL_B, "solver", "wu_b", "res_b");
    sim.state.results.get_mut("res_b").unwrap().report_deadline =
        add_secs(sim.state.now, 10.0);

    // One CPU, one certain miss: nobody gets asked.
    assert_eq!(sim.state.compute_work_requests(), None);
}

#[test]
fn overworked_project_is_excluded() {
    let mut sim = Sim::new();
    sim.add_project(URL_A);
    sim.state.now = sim.clock.now();
    let period = sim.state.prefs.cpu_scheduling_period_secs();
    sim.project_mut(URL_A).long_term_debt = -(period + 1.0);

    assert_eq!(sim.state.compute_work_requests(), None);
}

#[test]
fn dont_request_more_work_is_honored() {
    let mut sim = Sim::new();
    sim.add_project(URL_A);
    sim.state.now = sim.clock.now();
    sim.project_mut(URL_A).dont_request_more_work = true;

    assert_eq!(sim.state.compute_work_requests(), None);
}

#[test]
fn request_size_is_positive_and_capped() {
    let mut sim = Sim::new();
    sim.add_project(URL_A);
    sim.state.now = sim.clock.now();

    assert_eq!(sim.state.compute_work_requests().as_deref(), Some(URL_A));
    let buffer = sim.state.prefs.work_buf_total_secs() * sim.state.ncpus() as f64;
    let req = sim.project(URL_A).work_request_secs;
    assert!(req > 0.0);
    assert!(req <= constants::WORK_REQUEST_CAP_MULT * buffer);
}

#[test]
fn degenerate_dcf_asks_for_a_token_second() {
    let mut sim = Sim::new();
    sim.add_project(URL_A);
    sim.state.now = sim.clock.now();
    sim.project_mut(URL_A).duration_correction_factor = constants::DCF_MAX * 10.0;

    assert_eq!(sim.state.compute_work_requests().as_deref(), Some(URL_A));
    assert_eq!(sim.project(URL_A).work_request_secs, 1.0);
}

#[test]
fn starved_non_cpu_intensive_project_preempts_everyone() {
    let mut sim = two_project_sim();
    // A would win on debt, but B's trickle workload is empty.
    sim.project_mut(URL_A).long_term_debt = -1000.0;
    sim.project_mut(URL_B).non_cpu_intensive = true;

    assert_eq!(sim.state.compute_work_requests().as_deref(), Some(URL_B));
    assert_eq!(sim.project(URL_B).work_request_secs, 1.0);
}

#[test]
fn a_buffer_already_full_requests_nothing() {
    let mut sim = Sim::new();
    sim.add_project(URL_A);
    sim.state.now = sim.clock.now();
    sim.add_app(URL_A, "solver");
    // Queue far beyond the buffer: ~100000s of estimated work.
    for i in 0..3 {
        let wu = format!("wu_{}", i);
        let res = format!("res_{}", i);
        sim.add_job(URL_A, "solver", &wu, &res);
        sim.state.workunits.get_mut(&wu).unwrap().rsc_fpops_est = 1e9 * 40_000.0;
        // Deadlines far enough out that nothing counts as a miss.
        sim.state.results.get_mut(&res).unwrap().report_deadline =
            add_secs(sim.state.now, 90.0 * 86_400.0);
    }

    assert_eq!(sim.state.compute_work_requests(), None);
}

#[test]
fn debts_drift_apart_under_unequal_service() {
    let mut sim = two_project_sim();
    sim.add_app(URL_B, "solver");
    sim.add_job(URL_B, "solver", "wu_b", "res_b");
    // B is running flat out; A runs nothing.
    sim.state.active_tasks.tasks.push(ActiveTask {
        result_name: "res_b".into(),
        slot: 0,
        state: TaskState::Running,
        paused: false,
        checkpoint_cpu_time: 0.0,
        handle: None,
    });

    sim.state.adjust_debts(100.0);
    let a = sim.project(URL_A).long_term_debt;
    let b = sim.project(URL_B).long_term_debt;
    // Equal shares on one CPU: fair share is 50s each of the 100s tick.
    assert!((a - 50.0).abs() < 1.0);
    assert!((b + 50.0).abs() < 1.0);

    // Paused tasks consume nothing.
    sim.state.active_tasks.tasks[0].paused = true;
    sim.state.adjust_debts(100.0);
    assert!(sim.project(URL_B).long_term_debt > b);
}

#[test]
fn debt_decays_toward_zero() {
    let mut sim = Sim::new();
    sim.add_project(URL_A);
    sim.project_mut(URL_A).long_term_debt = 1000.0;
    sim.project_mut(URL_A)
        .decay_averages(constants::DEBT_HALF_LIFE);
    let d = sim.project(URL_A).long_term_debt;
    assert!((d - 500.0).abs() < 1.0);
}

#[test]
fn at_most_one_work_rpc_per_tick() {
    let mut sim = two_project_sim();
    // Both projects want work; only the better-placed one may ask.
    sim.http.push(HttpScript::Hang);
    sim.tick();
    assert_eq!(sim.http.n_requests(), 1);
    assert!(!sim.state.work_fetch_poll());
    assert_eq!(sim.http.n_requests(), 1);
}
