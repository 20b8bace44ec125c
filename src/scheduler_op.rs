//! Scheduler RPC state machine. One instance client-wide: `Idle →
//! FetchingMasterFile → Idle` to learn a project's scheduler list, and
//! `Idle → Rpc → Idle` for the report-work/get-work exchange. URL
//! fail-over is immediate; backoff applies only once every URL has been
//! tried, and a failure while offline counts against nobody.

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app::{App, AppVersion};
use crate::backoff::BackoffPolicy;
use crate::common::{MessagePriority, Time};
use crate::constants;
use crate::errors::{Error, R};
use crate::file_info::{FileInfo, FileRef};
use crate::file_names;
use crate::hostinfo::HostInfo;
use crate::prefs::Prefs;
use crate::projects::RpcReason;
use crate::result::{ResultInfo, ResultState};
use crate::state::{file_key, ClientState};
use crate::workunit::Workunit;
use crate::xfers::HttpPoll;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedOpState {
    Idle,
    FetchingMasterFile,
    Rpc,
}

#[derive(Debug)]
pub struct SchedulerOp {
    pub state: SchedOpState,
    pub project_url: Option<String>,
    pub url_index: usize,
    pub reason: Option<RpcReason>,
    pub handle: Option<Uuid>,
}

impl Default for SchedulerOp {
    fn default() -> Self {
        SchedulerOp {
            state: SchedOpState::Idle,
            project_url: None,
            url_index: 0,
            reason: None,
            handle: None,
        }
    }
}

// ---------------------------------------------------------------------
// Wire payloads. JSON over the injected HTTP capability; the transport
// and any outer envelope are someone else's problem.

#[derive(Debug, Serialize, Deserialize)]
pub struct ResultReport {
    pub name: String,
    pub exit_status: i32,
    pub signal: Option<i32>,
    pub cpu_time: f64,
    pub stderr_out: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SchedRequest {
    pub authenticator: String,
    pub seqno: u32,
    pub platform: String,
    pub core_version: String,
    pub prefs_mod_time: f64,
    pub work_req_seconds: f64,
    pub resource_share: f64,
    pub host_info: HostInfo,
    pub results: Vec<ResultReport>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppDesc {
    pub name: String,
    pub user_friendly_name: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppVersionDesc {
    pub app_name: String,
    pub version_num: i32,
    pub platform: String,
    pub avg_ncpus: f64,
    pub flops: f64,
    pub exec_file: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileDesc {
    pub name: String,
    pub nbytes: u64,
    pub checksum: String,
    pub executable: bool,
    pub sticky: bool,
    pub download_urls: Vec<String>,
    pub upload_urls: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkunitDesc {
    pub name: String,
    pub app_name: String,
    pub version_num: i32,
    pub command_line: String,
    pub input_files: Vec<FileRef>,
    pub rsc_fpops_est: f64,
    pub rsc_fpops_bound: f64,
    pub rsc_memory_bound: f64,
    pub rsc_disk_bound: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResultDesc {
    pub name: String,
    pub wu_name: String,
    pub report_deadline: Time,
    #[serde(default)]
    pub output_files: Vec<FileRef>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedReply {
    pub request_delay: f64,
    pub message: Option<String>,
    pub project_name: Option<String>,
    pub apps: Vec<AppDesc>,
    pub app_versions: Vec<AppVersionDesc>,
    pub file_infos: Vec<FileDesc>,
    pub workunits: Vec<WorkunitDesc>,
    pub results: Vec<ResultDesc>,
    pub result_acks: Vec<String>,
    pub dont_send_work: bool,
    pub code_sign_key: Option<String>,
    /// Replacement global preferences; applied only when newer than the
    /// copy the client already has.
    pub global_prefs: Option<Prefs>,
    pub user_total_credit: f64,
    pub host_total_credit: f64,
}

impl ClientState {
    /// Begin an operation for a project: a master-file fetch if we don't
    /// yet know its schedulers, otherwise the RPC itself. Only callable
    /// when the machine is idle — there is at most one scheduler RPC in
    /// flight across the whole client.
    pub fn init_sched_op(&mut self, project_url: &str, reason: RpcReason) -> R<()> {
        if self.sched_op.state != SchedOpState::Idle {
            return Err(Error::Internal {
                what: "scheduler op already in flight".into(),
            });
        }
        let p = self
            .projects
            .get(project_url)
            .ok_or_else(|| Error::no_such("project", project_url))?;

        if p.scheduler_urls.is_empty() || p.master_url_fetch_pending {
            self.start_master_fetch(project_url, reason)
        } else {
            // Random starting point among equals spreads load across a
            // big project's server pool; fail-over walks on from there.
            let n = p.scheduler_urls.len();
            let start = if n > 1 {
                rand::thread_rng().gen_range(0..n)
            } else {
                0
            };
            self.start_rpc(project_url, reason, start)
        }
    }

    fn start_master_fetch(&mut self, project_url: &str, reason: RpcReason) -> R<()> {
        let handle = self.http.get(project_url)?;
        if let Some(p) = self.projects.get_mut(project_url) {
            p.master_url_fetch_pending = true;
        }
        self.sched_op = SchedulerOp {
            state: SchedOpState::FetchingMasterFile,
            project_url: Some(project_url.to_owned()),
            url_index: 0,
            reason: Some(reason),
            handle: Some(handle),
        };
        self.msg(
            Some(project_url),
            MessagePriority::Info,
            "fetching master file",
        );
        Ok(())
    }

    fn start_rpc(&mut self, project_url: &str, reason: RpcReason, url_index: usize) -> R<()> {
        let request = self.build_sched_request(project_url)?;
        let sched_url = {
            let p = self
                .projects
                .get(project_url)
                .ok_or_else(|| Error::no_such("project", project_url))?;
            p.scheduler_urls
                .get(url_index % p.scheduler_urls.len().max(1))
                .cloned()
                .ok_or_else(|| Error::protocol("no scheduler URLs"))?
        };
        let body = serde_json::to_vec(&request)?;
        let handle = self.http.post(&sched_url, body)?;
        self.sched_op = SchedulerOp {
            state: SchedOpState::Rpc,
            project_url: Some(project_url.to_owned()),
            url_index,
            reason: Some(reason),
            handle: Some(handle),
        };
        self.msg(
            Some(project_url),
            MessagePriority::Info,
            &format!(
                "contacting scheduler (requesting {:.0}s of work, reporting {} results)",
                request.work_req_seconds,
                request.results.len()
            ),
        );
        Ok(())
    }

    /// Everything finished, uploaded and not yet acknowledged goes into
    /// the report.
    fn build_sched_request(&self, project_url: &str) -> R<SchedRequest> {
        let p = self
            .projects
            .get(project_url)
            .ok_or_else(|| Error::no_such("project", project_url))?;
        let results = self
            .results
            .values()
            .filter(|r| r.project_url == project_url && r.ready_to_report())
            .map(|r| ResultReport {
                name: r.name.clone(),
                exit_status: r.exit_status.unwrap_or(0),
                signal: r.signal,
                cpu_time: r.final_cpu_time,
                stderr_out: r.stderr_out.clone(),
            })
            .collect();
        Ok(SchedRequest {
            authenticator: p.authenticator.clone(),
            seqno: p.rpc_seqno,
            platform: std::env::consts::OS.to_owned(),
            core_version: format!(
                "{}.{}",
                constants::CORE_MAJOR_VERSION,
                constants::CORE_MINOR_VERSION
            ),
            prefs_mod_time: self.prefs.mod_time,
            work_req_seconds: p.work_request_secs,
            resource_share: p.resource_share,
            host_info: self.host_info.clone(),
            results,
        })
    }

    /// Poll the in-flight operation, if any.
    pub fn scheduler_rpc_poll(&mut self) -> bool {
        let handle = match self.sched_op.handle {
            Some(h) => h,
            None => return false,
        };
        match self.sched_op.state {
            SchedOpState::Idle => false,
            SchedOpState::FetchingMasterFile => match self.http.poll(handle) {
                HttpPoll::InProgress => false,
                HttpPoll::Done(resp) => {
                    self.master_fetch_completed(resp.status, &resp.body);
                    true
                }
                HttpPoll::TransportFailure(why) => {
                    self.master_fetch_failed(&why);
                    true
                }
            },
            SchedOpState::Rpc => match self.http.poll(handle) {
                HttpPoll::InProgress => false,
                HttpPoll::Done(resp) => {
                    if resp.status == constants::HTTP_STATUS_OK {
                        let url = self.sched_op.project_url.clone().unwrap_or_default();
                        match self.handle_sched_reply(&url, &resp.body) {
                            Ok(()) => self.rpc_succeeded(),
                            Err(e) => {
                                self.msg(
                                    Some(&url),
                                    MessagePriority::SchedulerAlert,
                                    &format!("malformed scheduler reply: {}", e),
                                );
                                self.rpc_failed();
                            }
                        }
                    } else {
                        self.rpc_failed();
                    }
                    true
                }
                HttpPoll::TransportFailure(_) => {
                    self.rpc_failed();
                    true
                }
            },
        }
    }

    fn master_fetch_completed(&mut self, status: u16, body: &[u8]) {
        let url = self.sched_op.project_url.clone().unwrap_or_default();
        if status != constants::HTTP_STATUS_OK {
            self.master_fetch_failed(&format!("HTTP status {}", status));
            return;
        }
        let sched_urls = parse_master_file(body);
        if sched_urls.is_empty() {
            self.master_fetch_failed("no scheduler URLs in master file");
            return;
        }
        if let Some(p) = self.projects.get_mut(&url) {
            if p.scheduler_urls != sched_urls {
                p.scheduler_urls = sched_urls;
                // A changed server list wipes the RPC failure history;
                // the old counters were about the old servers.
                p.rpc_backoff.success();
            }
            p.master_fetch_failures = 0;
            p.master_url_fetch_pending = false;
        }
        self.msg(Some(&url), MessagePriority::Info, "master file fetched");
        self.dirty = true;
        self.sched_op = SchedulerOp::default();
    }

    fn master_fetch_failed(&mut self, why: &str) {
        let url = self.sched_op.project_url.clone().unwrap_or_default();
        let now = self.now;
        let offline = !self.network_available;
        if let Some(p) = self.projects.get_mut(&url) {
            p.master_url_fetch_pending = false;
            if !offline {
                p.master_fetch_failures += 1;
                p.rpc_backoff.failure(now, &BackoffPolicy::scheduler());
            }
        }
        self.msg(
            Some(&url),
            MessagePriority::SchedulerAlert,
            &format!("master file fetch failed: {}", why),
        );
        self.sched_op = SchedulerOp::default();
    }

    fn rpc_succeeded(&mut self) {
        let url = self.sched_op.project_url.clone().unwrap_or_default();
        if let Some(p) = self.projects.get_mut(&url) {
            p.rpc_backoff.success();
            p.sched_rpc_pending = None;
            p.work_request_secs = 0.0;
        }
        self.dirty = true;
        self.sched_op = SchedulerOp::default();
    }

    /// Walk to the next scheduler URL immediately; back off only when
    /// the whole list has failed, and periodically force a master-file
    /// re-fetch in case the list itself is stale.
    fn rpc_failed(&mut self) {
        let url = self.sched_op.project_url.clone().unwrap_or_default();
        let reason = self.sched_op.reason.unwrap_or(RpcReason::NeedWork);
        let next_index = self.sched_op.url_index + 1;
        let now = self.now;
        let offline = !self.network_available;

        let n_urls = self
            .projects
            .get(&url)
            .map(|p| p.scheduler_urls.len())
            .unwrap_or(0);

        if next_index < n_urls {
            self.sched_op = SchedulerOp::default();
            if self.start_rpc(&url, reason, next_index).is_ok() {
                return;
            }
        }

        if let Some(p) = self.projects.get_mut(&url) {
            if !offline {
                p.rpc_backoff.failure(now, &BackoffPolicy::scheduler());
                if p.rpc_backoff.failures % constants::MASTER_FETCH_PERIOD == 0 {
                    p.master_url_fetch_pending = true;
                }
            }
        }
        self.msg(
            Some(&url),
            MessagePriority::SchedulerAlert,
            "scheduler request failed",
        );
        self.sched_op = SchedulerOp::default();
    }

    /// Merge a reply into the entity store. New entities are added only
    /// if not already present by name; acknowledged results are marked
    /// and left for garbage collection.
    pub fn handle_sched_reply(&mut self, project_url: &str, body: &[u8]) -> R<()> {
        let reply: SchedReply =
            serde_json::from_slice(body).map_err(|e| Error::protocol(e.to_string()))?;
        let now = self.now;

        if let Some(message) = &reply.message {
            self.msg(Some(project_url), MessagePriority::SchedulerAlert, message);
        }

        if let Some(p) = self.projects.get_mut(project_url) {
            p.rpc_seqno += 1;
            if reply.request_delay > 0.0 {
                p.rpc_backoff.defer(now, reply.request_delay);
            }
            if let Some(name) = reply.project_name.clone() {
                p.project_name = Some(name);
            }
            if reply.dont_send_work {
                p.dont_request_more_work = true;
            }
            match (&p.code_sign_key, &reply.code_sign_key) {
                (None, Some(key)) => p.code_sign_key = Some(key.clone()),
                (Some(old), Some(new)) if old != new => {
                    // A key change must be validated out of band; an
                    // unannounced one is treated as hostile and ignored.
                    tracing::error!(project = %project_url, "scheduler sent a different code-sign key; ignoring");
                }
                _ => {}
            }
            if reply.user_total_credit > 0.0 || reply.host_total_credit > 0.0 {
                p.add_stats(now, reply.user_total_credit, reply.host_total_credit);
            }
        }

        if let Some(new_prefs) = reply.global_prefs {
            // Several attached projects may each carry a copy; mod_time
            // decides which one is current.
            if new_prefs.mod_time > self.prefs.mod_time {
                self.prefs = new_prefs;
                if let Err(e) = self.prefs.save(&file_names::prefs_file(&self.data_dir)) {
                    self.msg(
                        None,
                        MessagePriority::InternalError,
                        &format!("cannot write preferences file: {}", e),
                    );
                }
                self.msg(
                    Some(project_url),
                    MessagePriority::Info,
                    "general preferences updated",
                );
            }
        }

        for a in reply.apps {
            let key = file_key(project_url, &a.name);
            self.apps.entry(key).or_insert_with(|| App {
                name: a.name,
                user_friendly_name: a.user_friendly_name,
                project_url: project_url.to_owned(),
            });
        }
        for v in reply.app_versions {
            let key = AppVersion::key(project_url, &v.app_name, v.version_num);
            self.app_versions.entry(key).or_insert_with(|| AppVersion {
                app_name: v.app_name,
                version_num: v.version_num,
                platform: v.platform,
                avg_ncpus: v.avg_ncpus,
                flops: v.flops,
                exec_file: v.exec_file,
                project_url: project_url.to_owned(),
            });
        }
        for f in reply.file_infos {
            let key = file_key(project_url, &f.name);
            self.file_infos.entry(key).or_insert_with(|| {
                let mut fi = FileInfo::new(&f.name, project_url);
                fi.nbytes = f.nbytes;
                fi.checksum = f.checksum;
                fi.executable = f.executable;
                fi.sticky = f.sticky;
                fi.download_urls = f.download_urls;
                fi.upload_urls = f.upload_urls;
                fi
            });
        }
        for w in reply.workunits {
            if !self.apps.contains_key(&file_key(project_url, &w.app_name)) {
                self.msg(
                    Some(project_url),
                    MessagePriority::SchedulerAlert,
                    &format!("workunit {} references unknown app {}", w.name, w.app_name),
                );
                continue;
            }
            self.workunits.entry(w.name.clone()).or_insert_with(|| Workunit {
                name: w.name,
                project_url: project_url.to_owned(),
                app_name: w.app_name,
                version_num: w.version_num,
                command_line: w.command_line,
                input_files: w.input_files,
                rsc_fpops_est: w.rsc_fpops_est,
                rsc_fpops_bound: w.rsc_fpops_bound,
                rsc_memory_bound: w.rsc_memory_bound,
                rsc_disk_bound: w.rsc_disk_bound,
            });
        }
        let mut new_results = 0;
        for r in reply.results {
            if !self.workunits.contains_key(&r.wu_name) {
                self.msg(
                    Some(project_url),
                    MessagePriority::SchedulerAlert,
                    &format!("result {} references unknown workunit {}", r.name, r.wu_name),
                );
                continue;
            }
            if self.results.contains_key(&r.name) {
                continue;
            }
            let mut info = ResultInfo::new(&r.name, &r.wu_name, project_url, now, r.report_deadline);
            info.output_files = r.output_files;
            self.results.insert(r.name.clone(), info);
            new_results += 1;
        }
        for name in &reply.result_acks {
            if let Some(r) = self.results.get_mut(name) {
                if r.ready_to_report() {
                    r.state = ResultState::AckedByServer;
                }
            }
        }

        if new_results > 0 {
            self.msg(
                Some(project_url),
                MessagePriority::Info,
                &format!("got {} new tasks", new_results),
            );
        }
        self.dirty = true;
        Ok(())
    }

    /// Cancel any in-flight operation and return the machine to idle.
    /// Safe from the suspend path.
    pub fn abort_sched_op(&mut self) {
        if let Some(h) = self.sched_op.handle.take() {
            self.http.cancel(h);
        }
        if let Some(url) = self.sched_op.project_url.clone() {
            if let Some(p) = self.projects.get_mut(&url) {
                p.master_url_fetch_pending = false;
            }
        }
        self.sched_op = SchedulerOp::default();
    }
}

/// The master file is a small document listing scheduler endpoints, one
/// per line, optionally tagged. Anything that looks like an HTTP URL on
/// a `scheduler` line counts.
pub fn parse_master_file(body: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(body);
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        let candidate = if let Some(rest) = line.strip_prefix("scheduler:") {
            rest.trim()
        } else if line.starts_with("<scheduler>") {
            line.trim_start_matches("<scheduler>")
                .trim_end_matches("</scheduler>")
                .trim()
        } else {
            line
        };
        if candidate.starts_with("http://") || candidate.starts_with("https://") {
            if !out.contains(&candidate.to_owned()) {
                out.push(candidate.to_owned());
            }
        }
    }
    out
}
