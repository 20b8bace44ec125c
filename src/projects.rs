use serde::{Deserialize, Serialize};

use crate::backoff::ExpBackoff;
use crate::common::{secs_between, ProjAm, Time};
use crate::constants;

/// Why a scheduler RPC is wanted for a project.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcReason {
    NeedWork,
    ResultsDue,
    UserRequest,
}

/// One day's worth of credit statistics, as reported by the project's
/// scheduler. Append-only, pruned to a retention window.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DailyStats {
    pub when: Time,
    pub user_total_credit: f64,
    pub host_total_credit: f64,
}

/// A remote job source: credential, fair-share weight, debt ledger,
/// backoff state and the scheduler endpoints learned from its master
/// file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Project {
    pub master_url: String,
    pub project_name: Option<String>,
    pub authenticator: String,
    pub resource_share: f64,

    pub scheduler_urls: Vec<String>,
    pub rpc_seqno: u32,
    pub rpc_backoff: ExpBackoff,
    pub master_fetch_failures: u32,
    pub master_url_fetch_pending: bool,

    pub upload_backoff: ExpBackoff,
    pub download_backoff: ExpBackoff,

    /// Fairness ledger: how much CPU this project is owed. Decays with
    /// a one-week half-life.
    pub long_term_debt: f64,
    /// Exponentially averaged CPU-seconds-per-second recently consumed.
    pub exp_avg_cpu: f64,
    pub duration_correction_factor: f64,

    pub suspended_via_gui: bool,
    pub non_cpu_intensive: bool,
    /// Set by the user or by a scheduler reply's don't-send flag.
    pub dont_request_more_work: bool,

    pub code_sign_key: Option<String>,
    pub statistics: Vec<DailyStats>,

    /// Pending RPC wish, served when the (single) RPC machine is free.
    pub sched_rpc_pending: Option<RpcReason>,

    /// Work-fetch scratch, recomputed every tick.
    #[serde(skip)]
    pub work_request_secs: f64,
    #[serde(skip)]
    pub cpu_shortfall: f64,
    #[serde(skip)]
    pub deadline_misses: i64,
}

impl ProjAm for Project {
    fn master_url(&self) -> &str {
        &self.master_url
    }

    fn project_name(&self) -> Option<&str> {
        self.project_name.as_deref()
    }
}

impl Project {
    pub fn new(master_url: &str, authenticator: &str) -> Project {
        Project {
            master_url: master_url.into(),
            project_name: None,
            authenticator: authenticator.into(),
            resource_share: 100.0,
            scheduler_urls: Vec::new(),
            rpc_seqno: 0,
            rpc_backoff: ExpBackoff::default(),
            master_fetch_failures: 0,
            master_url_fetch_pending: false,
            upload_backoff: ExpBackoff::default(),
            download_backoff: ExpBackoff::default(),
            long_term_debt: 0.0,
            exp_avg_cpu: 0.0,
            duration_correction_factor: 1.0,
            suspended_via_gui: false,
            non_cpu_intensive: false,
            dont_request_more_work: false,
            code_sign_key: None,
            statistics: Vec::new(),
            sched_rpc_pending: None,
            work_request_secs: 0.0,
            cpu_shortfall: 0.0,
            deadline_misses: 0,
        }
    }

    /// May this project be asked for anything right now? Retry pacing
    /// is the backoff's job alone; failure counters never gate contact
    /// outright, so an outage can always be recovered from.
    pub fn contactable(&self, now: Time) -> bool {
        !self.suspended_via_gui
            && !self.master_url_fetch_pending
            && self.rpc_backoff.allows(now)
    }

    pub fn can_request_work(&self, now: Time) -> bool {
        self.contactable(now) && !self.dont_request_more_work
    }

    /// Debt so negative the project has run far beyond its share.
    pub fn overworked(&self, scheduling_period_secs: f64) -> bool {
        self.long_term_debt < -scheduling_period_secs
    }

    /// Flop-based estimates unusable; ask for a token one second.
    pub fn dcf_out_of_range(&self) -> bool {
        self.duration_correction_factor < constants::DCF_MIN
            || self.duration_correction_factor > constants::DCF_MAX
    }

    /// Fold an observed runtime into the duration correction factor,
    /// nudging estimates toward reality.
    pub fn update_dcf(&mut self, estimated: f64, actual: f64) {
        if estimated <= 0.0 || actual <= 0.0 {
            return;
        }
        let ratio = actual / estimated * self.duration_correction_factor;
        // Move quickly toward longer estimates, slowly toward shorter.
        if ratio > self.duration_correction_factor {
            self.duration_correction_factor = ratio;
        } else {
            self.duration_correction_factor += 0.1 * (ratio - self.duration_correction_factor);
        }
    }

    pub fn add_stats(&mut self, now: Time, user_total: f64, host_total: f64) {
        self.statistics.push(DailyStats {
            when: now,
            user_total_credit: user_total,
            host_total_credit: host_total,
        });
        let cutoff = chrono::Duration::days(constants::STATS_RETENTION_DAYS);
        self.statistics.retain(|s| now - s.when <= cutoff);
    }

    /// Decay debt and the recent-CPU average over `dt` seconds.
    pub fn decay_averages(&mut self, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        self.long_term_debt *= (-dt * std::f64::consts::LN_2 / constants::DEBT_HALF_LIFE).exp();
        self.exp_avg_cpu *= (-dt * std::f64::consts::LN_2 / constants::CPU_AVG_HALF_LIFE).exp();
    }

    /// Seconds until contact is allowed again; for status displays.
    pub fn backoff_remaining(&self, now: Time) -> f64 {
        match self.rpc_backoff.next_allowed {
            Some(t) if t > now => secs_between(now, t),
            _ => 0.0,
        }
    }
}
