//! Error taxonomy of the scheduling core.
//!
//! Transient failures feed exponential backoff and are never fatal;
//! permanent failures give up on one file or result only; protocol
//! failures count as RPC failures but are logged distinctly; process
//! failures are recorded on the result and reported to the project;
//! persistence failures keep the previous durable state and retry next
//! tick. Nothing here terminates the client.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transient failure: {what}")]
    Transient { what: String },

    #[error("permanent failure: {what}")]
    Permanent { what: String },

    #[error("protocol error: {what}")]
    Protocol { what: String },

    #[error("process error: {what}")]
    Process { what: String },

    #[error("no such {kind}: {name}")]
    NoSuchEntity { kind: &'static str, name: String },

    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    #[error("already attached to {url}")]
    AlreadyAttached { url: String },

    #[error("aborted by user")]
    UserAbort,

    #[error("internal error: {what}")]
    Internal { what: String },
}

impl Error {
    pub fn transient<S: Into<String>>(what: S) -> Error {
        Error::Transient { what: what.into() }
    }

    pub fn permanent<S: Into<String>>(what: S) -> Error {
        Error::Permanent { what: what.into() }
    }

    pub fn protocol<S: Into<String>>(what: S) -> Error {
        Error::Protocol { what: what.into() }
    }

    pub fn process<S: Into<String>>(what: S) -> Error {
        Error::Process { what: what.into() }
    }

    pub fn no_such(kind: &'static str, name: &str) -> Error {
        Error::NoSuchEntity {
            kind,
            name: name.into(),
        }
    }
}

pub type R<T> = Result<T, Error>;
