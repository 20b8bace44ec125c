//! Exponential backoff shared by scheduler RPCs and file transfers:
//! `delay = clamp(base * 2^min(failures, cap), min, max)`, reset to zero
//! on the first success.

use serde::{Deserialize, Serialize};

use crate::common::{add_secs, Time};
use crate::constants;

#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub base: f64,
    pub cap: u32,
    pub min_delay: f64,
    pub max_delay: f64,
}

impl BackoffPolicy {
    pub fn scheduler() -> BackoffPolicy {
        BackoffPolicy {
            base: constants::RETRY_BASE_PERIOD,
            cap: constants::RETRY_CAP,
            min_delay: constants::SCHED_RETRY_DELAY_MIN,
            max_delay: constants::SCHED_RETRY_DELAY_MAX,
        }
    }

    pub fn file_xfer() -> BackoffPolicy {
        BackoffPolicy {
            base: constants::RETRY_BASE_PERIOD,
            cap: constants::RETRY_CAP,
            min_delay: constants::PERS_RETRY_DELAY_MIN,
            max_delay: constants::PERS_RETRY_DELAY_MAX,
        }
    }

    pub fn delay_secs(&self, failures: u32) -> f64 {
        let n = failures.min(self.cap);
        (self.base * 2f64.powi(n as i32)).clamp(self.min_delay, self.max_delay)
    }
}

/// Consecutive-failure counter plus the earliest time the next attempt
/// is allowed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExpBackoff {
    pub failures: u32,
    pub next_allowed: Option<Time>,
}

impl ExpBackoff {
    pub fn allows(&self, now: Time) -> bool {
        match self.next_allowed {
            Some(t) => now >= t,
            None => true,
        }
    }

    pub fn failure(&mut self, now: Time, policy: &BackoffPolicy) {
        self.failures += 1;
        self.next_allowed = Some(add_secs(now, policy.delay_secs(self.failures)));
    }

    pub fn success(&mut self) {
        self.failures = 0;
        self.next_allowed = None;
    }

    /// Server-mandated delay; does not count as a failure.
    pub fn defer(&mut self, now: Time, secs: f64) {
        let t = add_secs(now, secs);
        if self.next_allowed.map_or(true, |cur| t > cur) {
            self.next_allowed = Some(t);
        }
    }
}
