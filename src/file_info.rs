use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors;
use crate::util;

/// On-disk presence of a file's bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    NotPresent,
    Present,
    Error,
}

impl Default for FileStatus {
    fn default() -> Self {
        FileStatus::NotPresent
    }
}

/// How a job refers to a file: by which name it appears in the slot
/// directory, and whether the bytes must be private to the job (copy)
/// or may be shared across jobs (hard link).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileRef {
    pub file_name: String,
    pub open_name: String,
    pub copy_file: bool,
}

impl FileRef {
    pub fn new(file_name: &str) -> FileRef {
        FileRef {
            file_name: file_name.into(),
            open_name: file_name.into(),
            copy_file: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub project_url: String,
    pub nbytes: u64,
    /// Hex sha256 of the expected contents; empty if the server did not
    /// supply one (uploads in progress, for instance).
    pub checksum: String,
    pub status: FileStatus,
    pub error_msg: Option<String>,
    pub executable: bool,
    /// Survives garbage collection even at zero references.
    pub sticky: bool,
    pub uploaded: bool,
    pub download_urls: Vec<String>,
    pub upload_urls: Vec<String>,

    /// Recomputed by each garbage-collection mark pass; not persisted.
    #[serde(skip)]
    pub ref_count: u32,
}

impl FileInfo {
    pub fn new(name: &str, project_url: &str) -> FileInfo {
        FileInfo {
            name: name.into(),
            project_url: project_url.into(),
            nbytes: 0,
            checksum: String::new(),
            status: FileStatus::NotPresent,
            error_msg: None,
            executable: false,
            sticky: false,
            uploaded: false,
            download_urls: Vec::new(),
            upload_urls: Vec::new(),
            ref_count: 0,
        }
    }

    /// Output files have upload URLs; everything else is an input.
    pub fn is_output(&self) -> bool {
        !self.upload_urls.is_empty()
    }

    pub fn had_failure(&self) -> bool {
        self.status == FileStatus::Error
    }

    pub fn record_failure(&mut self, msg: &str) {
        self.status = FileStatus::Error;
        self.error_msg = Some(msg.into());
    }

    /// True if the bytes on disk match the declared size and checksum.
    /// An unknown checksum verifies by size alone.
    pub fn verify_on_disk(&self, path: &Path) -> errors::R<bool> {
        let meta = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(_) => return Ok(false),
        };
        if self.nbytes > 0 && meta.len() != self.nbytes {
            return Ok(false);
        }
        if self.checksum.is_empty() {
            return Ok(true);
        }
        Ok(util::sha256_file(path)? == self.checksum)
    }
}
