use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub type Time = chrono::DateTime<chrono::offset::Utc>;

/// Injectable clock so tests can drive time explicitly.
pub type ClockSource = Arc<dyn Fn() -> Time + Sync + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessagePriority {
    Debug,
    Info,
    UserAlert,
    InternalError,
    SchedulerAlert,
}

impl From<MessagePriority> for u8 {
    fn from(v: MessagePriority) -> u8 {
        match v {
            MessagePriority::Debug => 0,
            MessagePriority::Info => 1,
            MessagePriority::UserAlert => 2,
            MessagePriority::InternalError => 3,
            MessagePriority::SchedulerAlert => 4,
        }
    }
}

impl MessagePriority {
    pub fn from_num(v: u8) -> Option<MessagePriority> {
        match v {
            0 => Some(MessagePriority::Debug),
            1 => Some(MessagePriority::Info),
            2 => Some(MessagePriority::UserAlert),
            3 => Some(MessagePriority::InternalError),
            4 => Some(MessagePriority::SchedulerAlert),
            _ => None,
        }
    }
}

/// Anything that can be attributed in the message log: a project or an
/// account manager.
pub trait ProjAm {
    fn master_url(&self) -> &str;
    fn project_name(&self) -> Option<&str>;

    fn get_project_name(&self) -> &str {
        self.project_name().unwrap_or_else(|| self.master_url())
    }
}

/// Seconds from `a` to `b`, negative if `b` precedes `a`.
pub fn secs_between(a: Time, b: Time) -> f64 {
    (b - a).num_milliseconds() as f64 / 1e3
}

/// `t` advanced by a (possibly fractional) number of seconds.
pub fn add_secs(t: Time, secs: f64) -> Time {
    t + chrono::Duration::milliseconds((secs * 1e3) as i64)
}
