//! User-visible message log with per-project attribution. This is the
//! log a GUI or status tool reads back by sequence number; diagnostics
//! for developers go through `tracing` instead, and the standard logger
//! forwards there too.

use std::fmt::Display;
use std::sync::{Arc, RwLock};

use crate::common;

#[derive(Clone, Debug)]
pub struct Message {
    pub project_name: Option<String>,
    pub priority: common::MessagePriority,
    pub body: String,
    pub timestamp: common::Time,
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "{} [{}] {}",
            self.timestamp,
            match self.project_name.as_ref() {
                Some(s) => s.as_str(),
                None => "---",
            },
            self.body
        )
    }
}

pub trait Logger {
    fn insert(
        &self,
        project: Option<&dyn common::ProjAm>,
        priority: common::MessagePriority,
        now: common::Time,
        msg: &str,
    );
    fn cleanup(&self);
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Messages starting at 1-based sequence number `seqno`.
    fn get(&self, seqno: usize) -> Vec<Message>;
}

pub type SafeLogger = Arc<dyn Logger + Send + Sync>;

#[derive(Debug, Default)]
pub struct StandardLogger {
    msgs: RwLock<Vec<Message>>,
}

impl Logger for StandardLogger {
    fn insert(
        &self,
        project: Option<&dyn common::ProjAm>,
        priority: common::MessagePriority,
        now: common::Time,
        msg: &str,
    ) {
        let m = Message {
            project_name: project.map(|p| p.get_project_name().to_owned()),
            priority,
            body: msg.into(),
            timestamp: now,
        };
        match m.priority {
            common::MessagePriority::Debug => tracing::debug!("{}", m),
            common::MessagePriority::InternalError => tracing::error!("{}", m),
            common::MessagePriority::UserAlert | common::MessagePriority::SchedulerAlert => {
                tracing::warn!("{}", m)
            }
            common::MessagePriority::Info => tracing::info!("{}", m),
        }
        self.msgs.write().unwrap().push(m);
    }

    fn cleanup(&self) {
        self.msgs.write().unwrap().clear();
    }

    fn len(&self) -> usize {
        self.msgs.read().unwrap().len()
    }

    fn get(&self, seqno: usize) -> Vec<Message> {
        let data = self.msgs.read().unwrap();
        if seqno > data.len() {
            vec![]
        } else {
            data[seqno.max(1) - 1..].to_vec()
        }
    }
}
