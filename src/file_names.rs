//! On-disk layout of the client's data directory.

use std::path::{Path, PathBuf};

use crate::util;

pub const STATE_FILE_NAME: &str = "client_state.json";
pub const PREFS_FILE_NAME: &str = "global_prefs.json";
pub const STDERR_FILE_NAME: &str = "stderr.txt";

pub const PROJECTS_DIR: &str = "projects";
pub const SLOTS_DIR: &str = "slots";
pub const ACCOUNTS_DIR: &str = "accounts";

pub fn account_filename(canonical_master_url: &str) -> String {
    format!("account_{}.json", canonical_master_url)
}

pub fn state_file(data_dir: &Path) -> PathBuf {
    data_dir.join(STATE_FILE_NAME)
}

pub fn prefs_file(data_dir: &Path) -> PathBuf {
    data_dir.join(PREFS_FILE_NAME)
}

pub fn accounts_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(ACCOUNTS_DIR)
}

pub fn project_dir(data_dir: &Path, master_url: &str) -> PathBuf {
    data_dir
        .join(PROJECTS_DIR)
        .join(util::canonicalize_url(master_url))
}

pub fn slot_dir(data_dir: &Path, slot: usize) -> PathBuf {
    data_dir.join(SLOTS_DIR).join(slot.to_string())
}

/// Where a file's bytes live between transfers and runs.
pub fn file_path(data_dir: &Path, master_url: &str, file_name: &str) -> PathBuf {
    project_dir(data_dir, master_url).join(file_name)
}
