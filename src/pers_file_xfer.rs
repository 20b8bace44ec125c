//! Persistent file transfers: one record per file that needs bytes
//! moved, surviving client restarts. The actual byte movement happens
//! behind `FileXferCapability`; this layer owns retries, URL fail-over
//! and the per-project per-direction backoff.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::common::{add_secs, secs_between, MessagePriority, Time};
use crate::constants;
use crate::errors::R;
use crate::file_info::FileStatus;
use crate::result::ResultState;
use crate::state::{file_key, lookup_app_version, ClientState};
use crate::xfers::{FileXferPoll, XferDirection};

// XferDirection is not serde-derived in the capability layer; persist it
// as a tag here.
fn ser_dir<S: serde::Serializer>(d: &XferDirection, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(match d {
        XferDirection::Up => "up",
        XferDirection::Down => "down",
    })
}

fn de_dir<'de, D: serde::Deserializer<'de>>(d: D) -> Result<XferDirection, D::Error> {
    let tag = String::deserialize(d)?;
    match tag.as_str() {
        "up" => Ok(XferDirection::Up),
        "down" => Ok(XferDirection::Down),
        other => Err(serde::de::Error::custom(format!(
            "bad transfer direction {:?}",
            other
        ))),
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistentFileXfer {
    pub file_name: String,
    pub project_url: String,
    #[serde(serialize_with = "ser_dir", deserialize_with = "de_dir")]
    pub direction: XferDirection,
    pub nretry: u32,
    pub first_request_time: Time,
    pub next_request_time: Time,
    /// Active transfer seconds, suspension intervals excluded.
    pub time_so_far: f64,
    pub url_index: usize,
    pub done: bool,

    #[serde(skip)]
    pub handle: Option<Uuid>,
    #[serde(skip)]
    pub last_time_sample: Option<Time>,
    #[serde(skip)]
    pub bytes_xferred: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PersFileXferSet {
    pub xfers: Vec<PersistentFileXfer>,
    #[serde(skip)]
    pub last_poll: Option<Time>,
}

impl PersFileXferSet {
    pub fn lookup(&self, project_url: &str, file_name: &str) -> Option<&PersistentFileXfer> {
        self.xfers
            .iter()
            .find(|x| x.project_url == project_url && x.file_name == file_name)
    }
}

enum XferOutcome {
    Success,
    /// 404 on an upload means the receiving endpoint doesn't exist;
    /// same for a download of a file the server no longer has. Verify
    /// failures land here too.
    Permanent(String),
    /// 416: our partial bytes disagree with the server; start over.
    BadRange,
    Other(String),
    Offline,
}

impl ClientState {
    /// Create transfer records for files that need movement: inputs of
    /// unfinished results that are not on disk, outputs of finished
    /// computations not yet uploaded.
    pub fn create_needed_xfers(&mut self) {
        let mut wanted: Vec<(String, String, XferDirection)> = Vec::new();

        for r in self.results.values() {
            if r.not_finished() {
                let wu = match self.workunits.get(&r.wu_name) {
                    Some(wu) => wu,
                    None => continue,
                };
                for fr in &wu.input_files {
                    wanted.push((
                        wu.project_url.clone(),
                        fr.file_name.clone(),
                        XferDirection::Down,
                    ));
                }
                if let Some(v) = lookup_app_version(
                    &self.app_versions,
                    &wu.project_url,
                    &wu.app_name,
                    wu.version_num,
                ) {
                    wanted.push((
                        v.project_url.clone(),
                        v.exec_file.clone(),
                        XferDirection::Down,
                    ));
                }
            } else if r.state == ResultState::FilesUploading {
                for fr in &r.output_files {
                    wanted.push((
                        r.project_url.clone(),
                        fr.file_name.clone(),
                        XferDirection::Up,
                    ));
                }
            }
        }

        for (url, name, dir) in wanted {
            if self.pers_xfers.lookup(&url, &name).is_some() {
                continue;
            }
            let fi = match self.file_infos.get(&file_key(&url, &name)) {
                Some(fi) => fi,
                None => continue,
            };
            if fi.had_failure() {
                continue;
            }
            let needed = match dir {
                XferDirection::Down => {
                    fi.status == FileStatus::NotPresent && !fi.download_urls.is_empty()
                }
                XferDirection::Up => {
                    fi.status == FileStatus::Present
                        && !fi.uploaded
                        && !fi.upload_urls.is_empty()
                }
            };
            if !needed {
                continue;
            }
            self.pers_xfers.xfers.push(PersistentFileXfer {
                file_name: name,
                project_url: url,
                direction: dir,
                nretry: 0,
                first_request_time: self.now,
                next_request_time: self.now,
                time_so_far: 0.0,
                url_index: 0,
                done: false,
                handle: None,
                last_time_sample: None,
                bytes_xferred: 0,
            });
        }
    }

    /// Drive all transfers. Runs on a fixed period; calls in between are
    /// no-ops.
    pub fn pers_xfers_poll(&mut self) -> bool {
        let now = self.now;
        if let Some(last) = self.pers_xfers.last_poll {
            if secs_between(last, now) < constants::PERS_XFER_POLL_PERIOD {
                return false;
            }
        }
        self.pers_xfers.last_poll = Some(now);

        self.create_needed_xfers();

        let mut acted = false;
        for i in 0..self.pers_xfers.xfers.len() {
            if self.pers_xfers.xfers[i].done {
                continue;
            }
            if self.pers_xfers.xfers[i].handle.is_none() {
                acted |= self.maybe_start_xfer(i);
            } else {
                acted |= self.poll_active_xfer(i);
            }
        }

        let before = self.pers_xfers.xfers.len();
        self.pers_xfers.xfers.retain(|x| !x.done);
        if self.pers_xfers.xfers.len() != before {
            self.dirty = true;
        }
        acted
    }

    fn maybe_start_xfer(&mut self, i: usize) -> bool {
        let now = self.now;
        let (project_url, file_name, direction, url_index) = {
            let x = &self.pers_xfers.xfers[i];
            if now < x.next_request_time {
                return false;
            }
            (
                x.project_url.clone(),
                x.file_name.clone(),
                x.direction,
                x.url_index,
            )
        };

        // Project-level backoff is shared by all of that project's
        // transfers in the same direction.
        if let Some(p) = self.projects.get(&project_url) {
            let backoff = match direction {
                XferDirection::Up => &p.upload_backoff,
                XferDirection::Down => &p.download_backoff,
            };
            if !backoff.allows(now) {
                return false;
            }
        }

        let key = file_key(&project_url, &file_name);
        let local_path = self.file_path_of(&project_url, &file_name);

        if direction == XferDirection::Down {
            // Short-circuit: bytes may already be on disk and correct.
            let verified = self
                .file_infos
                .get(&key)
                .map(|fi| fi.verify_on_disk(&local_path).unwrap_or(false))
                .unwrap_or(false);
            if verified {
                if let Some(fi) = self.file_infos.get_mut(&key) {
                    fi.status = FileStatus::Present;
                }
                self.pers_xfers.xfers[i].done = true;
                self.dirty = true;
                return true;
            }
        }

        let url = {
            let fi = match self.file_infos.get(&key) {
                Some(fi) => fi,
                None => return false,
            };
            let urls = match direction {
                XferDirection::Up => &fi.upload_urls,
                XferDirection::Down => &fi.download_urls,
            };
            match urls.get(url_index) {
                Some(u) => u.clone(),
                None => return false,
            }
        };

        if let Some(parent) = local_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let started: R<Uuid> = match direction {
            XferDirection::Down => self.file_xfer.start_download(&url, &local_path),
            XferDirection::Up => self.file_xfer.start_upload(&url, &local_path),
        };
        match started {
            Ok(h) => {
                let x = &mut self.pers_xfers.xfers[i];
                x.handle = Some(h);
                x.last_time_sample = Some(now);
                true
            }
            Err(e) => {
                tracing::warn!(file = %file_name, error = %e, "transfer failed to start");
                self.xfer_failed(i, XferOutcome::Other(e.to_string()));
                true
            }
        }
    }

    fn poll_active_xfer(&mut self, i: usize) -> bool {
        let now = self.now;
        let handle = self.pers_xfers.xfers[i].handle.unwrap();
        match self.file_xfer.poll(handle) {
            FileXferPoll::InProgress { bytes_xferred } => {
                let x = &mut self.pers_xfers.xfers[i];
                if let Some(last) = x.last_time_sample {
                    let gap = secs_between(last, now);
                    // A long gap means we were suspended, not transferring.
                    if gap >= 0.0 && gap <= constants::XFER_IDLE_GAP {
                        x.time_so_far += gap;
                    }
                }
                x.last_time_sample = Some(now);
                x.bytes_xferred = bytes_xferred;
                false
            }
            FileXferPoll::Done { status } => {
                self.pers_xfers.xfers[i].handle = None;
                let outcome = self.classify_completion(i, status);
                match outcome {
                    XferOutcome::Success => self.xfer_succeeded(i),
                    other => self.xfer_failed(i, other),
                }
                true
            }
            FileXferPoll::TransportFailure(why) => {
                self.pers_xfers.xfers[i].handle = None;
                if self.network_available {
                    self.xfer_failed(i, XferOutcome::Other(why));
                } else {
                    // Failing while offline says nothing about the project.
                    self.xfer_failed(i, XferOutcome::Offline);
                }
                true
            }
        }
    }

    fn classify_completion(&mut self, i: usize, status: u16) -> XferOutcome {
        let (project_url, file_name, direction) = {
            let x = &self.pers_xfers.xfers[i];
            (x.project_url.clone(), x.file_name.clone(), x.direction)
        };
        match status {
            200..=299 => {
                if direction == XferDirection::Down {
                    let key = file_key(&project_url, &file_name);
                    let path = self.file_path_of(&project_url, &file_name);
                    let ok = self
                        .file_infos
                        .get(&key)
                        .map(|fi| fi.verify_on_disk(&path).unwrap_or(false))
                        .unwrap_or(false);
                    if !ok {
                        let _ = std::fs::remove_file(&path);
                        return XferOutcome::Permanent("downloaded file failed checksum".into());
                    }
                }
                XferOutcome::Success
            }
            constants::HTTP_STATUS_NOT_FOUND => {
                XferOutcome::Permanent(format!("server returned 404 for {}", file_name))
            }
            constants::HTTP_STATUS_RANGE_ERROR => XferOutcome::BadRange,
            other => XferOutcome::Other(format!("HTTP status {}", other)),
        }
    }

    fn xfer_succeeded(&mut self, i: usize) {
        let (project_url, file_name, direction) = {
            let x = &mut self.pers_xfers.xfers[i];
            x.done = true;
            (x.project_url.clone(), x.file_name.clone(), x.direction)
        };
        let key = file_key(&project_url, &file_name);
        if let Some(fi) = self.file_infos.get_mut(&key) {
            match direction {
                XferDirection::Down => fi.status = FileStatus::Present,
                XferDirection::Up => fi.uploaded = true,
            }
        }
        if let Some(p) = self.projects.get_mut(&project_url) {
            match direction {
                XferDirection::Up => p.upload_backoff.success(),
                XferDirection::Down => p.download_backoff.success(),
            }
        }
        self.msg(
            Some(&project_url),
            MessagePriority::Info,
            &format!(
                "finished {} of {}",
                match direction {
                    XferDirection::Up => "upload",
                    XferDirection::Down => "download",
                },
                file_name
            ),
        );
        self.dirty = true;
    }

    fn xfer_failed(&mut self, i: usize, outcome: XferOutcome) {
        let now = self.now;
        let (project_url, file_name, direction) = {
            let x = &self.pers_xfers.xfers[i];
            (x.project_url.clone(), x.file_name.clone(), x.direction)
        };
        let key = file_key(&project_url, &file_name);
        let n_urls = self
            .file_infos
            .get(&key)
            .map(|fi| match direction {
                XferDirection::Up => fi.upload_urls.len(),
                XferDirection::Down => fi.download_urls.len(),
            })
            .unwrap_or(0);

        match outcome {
            XferOutcome::Success => unreachable!(),
            XferOutcome::Offline => {
                // Try again shortly; no counters move.
                let x = &mut self.pers_xfers.xfers[i];
                x.next_request_time = add_secs(now, constants::PERS_RETRY_DELAY_MIN);
            }
            XferOutcome::BadRange => {
                // Partial bytes are poison; delete and start from scratch.
                let path = self.file_path_of(&project_url, &file_name);
                let _ = std::fs::remove_file(&path);
                let x = &mut self.pers_xfers.xfers[i];
                x.nretry += 1;
                x.bytes_xferred = 0;
                x.next_request_time = add_secs(now, constants::PERS_RETRY_DELAY_MIN);
            }
            XferOutcome::Permanent(why) => {
                let x = &mut self.pers_xfers.xfers[i];
                x.nretry += 1;
                if x.url_index + 1 < n_urls {
                    x.url_index += 1;
                } else {
                    x.done = true;
                    if let Some(fi) = self.file_infos.get_mut(&key) {
                        fi.record_failure(&why);
                    }
                    self.msg(
                        Some(&project_url),
                        MessagePriority::UserAlert,
                        &format!("giving up on {}: {}", file_name, why),
                    );
                }
            }
            XferOutcome::Other(why) => {
                let x = &mut self.pers_xfers.xfers[i];
                x.nretry += 1;
                if x.url_index + 1 < n_urls {
                    // More URLs to try; no backoff yet.
                    x.url_index += 1;
                } else {
                    x.url_index = 0;
                    if let Some(p) = self.projects.get_mut(&project_url) {
                        let backoff = match direction {
                            XferDirection::Up => &mut p.upload_backoff,
                            XferDirection::Down => &mut p.download_backoff,
                        };
                        backoff.failure(now, &BackoffPolicy::file_xfer());
                    }
                    let x = &mut self.pers_xfers.xfers[i];
                    x.next_request_time = add_secs(now, constants::PERS_RETRY_DELAY_MIN);
                    tracing::debug!(file = %file_name, retries = x.nretry, %why, "transfer failed, backing off");
                }
            }
        }
        self.dirty = true;
    }

    /// User cancellation, safe mid-transfer. The in-flight operation is
    /// cancelled exactly once; the file gets a user-abort error.
    pub fn pers_xfer_abort(&mut self, project_url: &str, file_name: &str) {
        let found = self
            .pers_xfers
            .xfers
            .iter()
            .position(|x| x.project_url == project_url && x.file_name == file_name);
        if let Some(i) = found {
            if let Some(h) = self.pers_xfers.xfers[i].handle.take() {
                self.file_xfer.cancel(h);
            }
            self.pers_xfers.xfers[i].done = true;
        }
        let key = file_key(project_url, file_name);
        if let Some(fi) = self.file_infos.get_mut(&key) {
            fi.record_failure("transfer aborted by user");
        }
        self.dirty = true;
    }

    /// Tear down in-flight network operations, keeping retry and backoff
    /// accounting so transfers restart fresh on resume.
    pub fn pers_xfers_suspend_all(&mut self) {
        for x in &mut self.pers_xfers.xfers {
            if let Some(h) = x.handle.take() {
                self.file_xfer.cancel(h);
                x.last_time_sample = None;
            }
        }
    }
}
