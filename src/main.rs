use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use volcore::common::ClockSource;
use volcore::messages::{SafeLogger, StandardLogger};
use volcore::process::OsProcessRunner;
use volcore::state::ClientState;
use volcore::xfers::NullTransport;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let data_dir: PathBuf = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(dir = %data_dir.display(), error = %e, "cannot create data directory");
        std::process::exit(1);
    }

    let msgs: SafeLogger = Arc::new(StandardLogger::default());
    let clock: ClockSource = Arc::new(chrono::Utc::now);

    // An HTTP transport is wired in by the embedding application; the
    // standalone binary runs with the placeholder and simply treats the
    // network as unreachable.
    let mut state = match ClientState::new(
        &data_dir,
        clock,
        msgs,
        Box::new(NullTransport),
        Box::new(NullTransport),
        Box::new(OsProcessRunner::new()),
    ) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "cannot initialize client state");
            std::process::exit(1);
        }
    };
    state.network_available = false;

    if let Err(e) = state.startup() {
        tracing::error!(error = %e, "startup failed");
        std::process::exit(1);
    }

    loop {
        let acted = state.do_something();
        if !acted {
            std::thread::sleep(std::time::Duration::from_secs(1));
        }
    }
}
