//! Work Fetch Engine: once per tick, decide whether more work is needed
//! and pick exactly one project to ask, how much to ask for, and keep
//! the long-term-debt ledger that makes the choice fair over weeks of
//! bursty RPCs.

use std::collections::HashMap;

use crate::projects::RpcReason;
use crate::state::ClientState;
use crate::xfers::XferDirection;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FetchUrgency {
    DontNeed,
    Ok,
    Need,
    NeedImmediately,
}

impl ClientState {
    /// Estimated CPU seconds to finish a result from scratch.
    fn estimated_result_cpu(&self, wu_name: &str, dcf: f64) -> f64 {
        match self.workunits.get(wu_name) {
            Some(wu) => wu.estimated_cpu_time(self.host_info.usable_fpops(), dcf),
            None => 0.0,
        }
    }

    fn project_queue_secs(&self, master_url: &str) -> f64 {
        let dcf = self
            .projects
            .get(master_url)
            .map(|p| p.duration_correction_factor.clamp(crate::constants::DCF_MIN, crate::constants::DCF_MAX))
            .unwrap_or(1.0);
        self.results
            .values()
            .filter(|r| r.project_url == master_url && r.not_finished())
            .map(|r| self.estimated_result_cpu(&r.wu_name, dcf))
            .sum()
    }

    fn project_has_stalled_download(&self, master_url: &str) -> bool {
        self.pers_xfers.xfers.iter().any(|x| {
            x.project_url == master_url
                && x.direction == XferDirection::Down
                && x.nretry > 0
                && self.now < x.next_request_time
        })
    }

    fn project_has_suspended_result(&self, master_url: &str) -> bool {
        self.results
            .values()
            .any(|r| r.project_url == master_url && r.suspended_via_gui && r.not_finished())
    }

    fn overall_urgency(&self, global_shortfall: f64) -> FetchUrgency {
        let any_runnable = self.results.values().any(|r| r.not_finished());
        if !any_runnable {
            FetchUrgency::NeedImmediately
        } else if global_shortfall > 0.0 {
            FetchUrgency::Need
        } else {
            FetchUrgency::DontNeed
        }
    }

    /// Compute per-project shortfalls and pick at most one CPU-intensive
    /// project to ask for work (non-CPU-intensive starvation wins the
    /// cycle outright). The winner's request size lands in its
    /// `work_request_secs`.
    pub fn compute_work_requests(&mut self) -> Option<String> {
        let now = self.now;
        let ncpus = self.ncpus() as f64;
        let buffer = self.prefs.work_buf_total_secs() * ncpus;
        let period = self.prefs.cpu_scheduling_period_secs();

        let mut urls: Vec<String> = self.projects.keys().cloned().collect();
        urls.sort(); // deterministic scan order; ties go to the first seen

        // Non-CPU-intensive projects: one unit of work apiece, absolute
        // priority when starved.
        for url in &urls {
            let p = &self.projects[url];
            if !p.non_cpu_intensive || !p.can_request_work(now) {
                continue;
            }
            let starved = !self
                .results
                .values()
                .any(|r| r.project_url == *url && r.not_finished());
            if starved {
                self.projects.get_mut(url).unwrap().work_request_secs = 1.0;
                return Some(url.clone());
            }
        }

        let mut total_queue = 0.0;
        let mut scratch: HashMap<String, (f64, i64)> = HashMap::new();
        for url in &urls {
            let p = &self.projects[url];
            if p.non_cpu_intensive {
                continue;
            }
            let queue = self.project_queue_secs(url);
            total_queue += queue;
            let dcf = p.duration_correction_factor.clamp(
                crate::constants::DCF_MIN,
                crate::constants::DCF_MAX,
            );
            let misses = self
                .results
                .values()
                .filter(|r| r.project_url == *url && r.not_finished())
                .filter(|r| {
                    let est = self.estimated_result_cpu(&r.wu_name, dcf);
                    crate::common::add_secs(now, est) > r.report_deadline
                })
                .count() as i64;
            scratch.insert(url.clone(), ((buffer - queue).max(0.0), misses));
        }
        let global_shortfall = (buffer - total_queue).max(0.0);
        let urgency = self.overall_urgency(global_shortfall);
        if urgency == FetchUrgency::DontNeed {
            for url in &urls {
                if let Some(p) = self.projects.get_mut(url) {
                    if let Some(&(shortfall, misses)) = scratch.get(url) {
                        p.cpu_shortfall = shortfall;
                        p.deadline_misses = misses;
                    }
                }
            }
            return None;
        }

        let total_fetchable_share: f64 = urls
            .iter()
            .filter_map(|u| self.projects.get(u))
            .filter(|p| !p.non_cpu_intensive && p.can_request_work(now))
            .map(|p| p.resource_share)
            .sum();

        let mut winner: Option<(String, bool, f64)> = None;
        for url in &urls {
            let p = &self.projects[url];
            if p.non_cpu_intensive || !p.can_request_work(now) {
                continue;
            }
            let &(shortfall, misses) = scratch.get(url).unwrap_or(&(0.0, 0));
            if p.overworked(period) {
                continue;
            }
            if misses >= ncpus as i64 && urgency < FetchUrgency::NeedImmediately {
                continue;
            }
            if self.project_has_stalled_download(url) || self.project_has_suspended_result(url) {
                continue;
            }
            if shortfall <= 0.0 && global_shortfall <= 0.0 {
                continue;
            }
            let troubled = misses > 0;
            let score = p.long_term_debt + shortfall;
            let take = match &winner {
                None => true,
                Some((_, best_troubled, best_score)) => {
                    if troubled != *best_troubled {
                        // A project not in deadline trouble beats one
                        // that is, even at a worse score.
                        !troubled
                    } else {
                        score < *best_score
                    }
                }
            };
            if take {
                winner = Some((url.clone(), troubled, score));
            }
        }

        for url in &urls {
            if let Some(p) = self.projects.get_mut(url) {
                if let Some(&(shortfall, misses)) = scratch.get(url) {
                    p.cpu_shortfall = shortfall;
                    p.deadline_misses = misses;
                }
            }
        }

        let (url, _, _) = winner?;
        let p = self.projects.get_mut(&url).unwrap();
        let req = if p.dcf_out_of_range() {
            // Estimates are garbage; ask for a token amount instead of
            // trusting them.
            1.0
        } else {
            let share_frac = if total_fetchable_share > 0.0 {
                p.resource_share / total_fetchable_share
            } else {
                1.0
            };
            let cap = crate::constants::WORK_REQUEST_CAP_MULT * buffer;
            p.cpu_shortfall.max(global_shortfall * share_frac).min(cap)
        };
        p.work_request_secs = req;
        Some(url)
    }

    /// Long-term debt bookkeeping: decay with a week-scale half-life,
    /// then credit each project the gap between its fair share of CPU
    /// over this tick and what its tasks actually consumed.
    pub fn adjust_debts(&mut self, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        let ncpus = self.ncpus() as f64;

        let mut actual: HashMap<String, f64> = HashMap::new();
        for t in &self.active_tasks.tasks {
            if t.state != crate::active_tasks::TaskState::Running || t.paused {
                continue;
            }
            if let Some(r) = self.results.get(&t.result_name) {
                *actual.entry(r.project_url.clone()).or_insert(0.0) += dt;
            }
        }

        let total_share: f64 = self
            .projects
            .values()
            .filter(|p| !p.non_cpu_intensive && !p.suspended_via_gui)
            .map(|p| p.resource_share)
            .sum();

        for (url, p) in self.projects.iter_mut() {
            p.decay_averages(dt);
            let consumed = actual.get(url).copied().unwrap_or(0.0);
            p.exp_avg_cpu += consumed;
            if p.non_cpu_intensive || p.suspended_via_gui || total_share <= 0.0 {
                continue;
            }
            let fair = dt * ncpus * p.resource_share / total_share;
            p.long_term_debt += fair - consumed;
        }
    }

    /// Serve pending RPC wishes (results due, user requests) first, then
    /// the work-fetch decision. At most one RPC leaves per tick because
    /// the machine only starts from idle.
    pub fn work_fetch_poll(&mut self) -> bool {
        if self.sched_op.state != crate::scheduler_op::SchedOpState::Idle {
            return false;
        }
        let now = self.now;

        let mut urls: Vec<String> = self.projects.keys().cloned().collect();
        urls.sort();

        for url in &urls {
            let has_due = self
                .results
                .values()
                .any(|r| r.project_url == *url && r.ready_to_report());
            if has_due {
                let p = self.projects.get_mut(url).unwrap();
                if p.sched_rpc_pending.is_none() {
                    p.sched_rpc_pending = Some(RpcReason::ResultsDue);
                }
            }
        }

        for url in &urls {
            let reason = {
                let p = &self.projects[url];
                match p.sched_rpc_pending {
                    Some(r) if p.contactable(now) => r,
                    _ => continue,
                }
            };
            if self.init_sched_op(url, reason).is_ok() {
                return true;
            }
        }

        if let Some(url) = self.compute_work_requests() {
            if self.init_sched_op(&url, RpcReason::NeedWork).is_ok() {
                return true;
            }
        }
        false
    }
}
