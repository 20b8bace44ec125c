//! Network capability seams. The scheduling core never talks to sockets
//! itself: it starts an operation through one of these traits and polls
//! for completion. Real implementations wrap an HTTP client; tests
//! script outcomes.

use std::path::Path;

use uuid::Uuid;

use crate::errors::R;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XferDirection {
    Up,
    Down,
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Clone, Debug)]
pub enum HttpPoll {
    InProgress,
    Done(HttpResponse),
    /// Could not reach the server at all (DNS, connect, timeout).
    TransportFailure(String),
}

/// Request/reply HTTP exchanges: scheduler RPCs and master-file fetches.
pub trait HttpCapability {
    fn post(&mut self, url: &str, payload: Vec<u8>) -> R<Uuid>;
    fn get(&mut self, url: &str) -> R<Uuid>;
    fn poll(&mut self, id: Uuid) -> HttpPoll;
    /// Safe on unknown or completed handles.
    fn cancel(&mut self, id: Uuid);
}

#[derive(Clone, Debug)]
pub enum FileXferPoll {
    InProgress { bytes_xferred: u64 },
    Done { status: u16 },
    TransportFailure(String),
}

/// Bulk byte movement with resume support on the transport side.
pub trait FileXferCapability {
    fn start_download(&mut self, url: &str, dest: &Path) -> R<Uuid>;
    fn start_upload(&mut self, url: &str, src: &Path) -> R<Uuid>;
    fn poll(&mut self, id: Uuid) -> FileXferPoll;
    fn cancel(&mut self, id: Uuid);
}

/// Stand-in transport for running without a network layer wired in:
/// every operation fails as unreachable, which the backoff machinery
/// absorbs like any other offline period.
#[derive(Debug, Default)]
pub struct NullTransport;

impl HttpCapability for NullTransport {
    fn post(&mut self, _url: &str, _payload: Vec<u8>) -> R<Uuid> {
        Ok(Uuid::new_v4())
    }

    fn get(&mut self, _url: &str) -> R<Uuid> {
        Ok(Uuid::new_v4())
    }

    fn poll(&mut self, _id: Uuid) -> HttpPoll {
        HttpPoll::TransportFailure("no transport configured".into())
    }

    fn cancel(&mut self, _id: Uuid) {}
}

impl FileXferCapability for NullTransport {
    fn start_download(&mut self, _url: &str, _dest: &Path) -> R<Uuid> {
        Ok(Uuid::new_v4())
    }

    fn start_upload(&mut self, _url: &str, _src: &Path) -> R<Uuid> {
        Ok(Uuid::new_v4())
    }

    fn poll(&mut self, _id: Uuid) -> FileXferPoll {
        FileXferPoll::TransportFailure("no transport configured".into())
    }

    fn cancel(&mut self, _id: Uuid) {}
}
