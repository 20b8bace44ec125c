//! The entity store and the cooperative scheduling loop.
//!
//! `ClientState` is the single owner of all mutable scheduling state.
//! Everything is driven from `do_something`, called once per tick from
//! one thread; subsystems never block and never touch state behind the
//! loop's back — process and network I/O happen behind capability
//! traits that are polled here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::account;
use crate::active_tasks::{ActiveTaskSet, SavedActiveTask};
use crate::app::{App, AppVersion};
use crate::common::{secs_between, ClockSource, MessagePriority, Time};
use crate::errors::R;
use crate::file_info::{FileInfo, FileStatus};
use crate::file_names;
use crate::hostinfo::HostInfo;
use crate::messages::SafeLogger;
use crate::pers_file_xfer::PersFileXferSet;
use crate::prefs::Prefs;
use crate::process::ProcessCapability;
use crate::projects::Project;
use crate::result::{ResultInfo, ResultState};
use crate::scheduler_op::SchedulerOp;
use crate::util;
use crate::workunit::Workunit;
use crate::xfers::{FileXferCapability, HttpCapability};

/// Files are scoped by project; workunit and result names are generated
/// by servers to be globally unique, so those maps key by bare name.
pub fn file_key(project_url: &str, file_name: &str) -> String {
    format!("{}//{}", project_url, file_name)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    Always,
    /// Run unless the user is active at the machine.
    Auto,
    Never,
}

pub struct ClientState {
    pub data_dir: PathBuf,
    pub clock: ClockSource,
    pub msgs: SafeLogger,

    pub host_info: HostInfo,
    pub prefs: Prefs,
    pub run_mode: RunMode,
    /// Set by platform idle detection; only consulted in `Auto` mode.
    pub user_active: bool,
    /// When false, network failures do not count toward backoff.
    pub network_available: bool,

    pub projects: HashMap<String, Project>,
    pub apps: HashMap<String, App>,
    pub app_versions: HashMap<String, AppVersion>,
    pub workunits: HashMap<String, Workunit>,
    pub results: HashMap<String, ResultInfo>,
    pub file_infos: HashMap<String, FileInfo>,

    pub active_tasks: ActiveTaskSet,
    pub pers_xfers: PersFileXferSet,
    pub sched_op: SchedulerOp,

    pub http: Box<dyn HttpCapability>,
    pub file_xfer: Box<dyn FileXferCapability>,
    pub process: Box<dyn ProcessCapability>,

    pub now: Time,
    pub last_tick: Option<Time>,
    pub computing_suspended: bool,
    pub dirty: bool,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(default)]
struct SavedState {
    host_info: HostInfo,
    run_mode: Option<RunMode>,
    projects: Vec<Project>,
    apps: Vec<App>,
    app_versions: Vec<AppVersion>,
    workunits: Vec<Workunit>,
    results: Vec<ResultInfo>,
    file_infos: Vec<FileInfo>,
    active_tasks: Vec<SavedActiveTask>,
    pers_xfers: PersFileXferSet,
}

impl ClientState {
    pub fn new(
        data_dir: &Path,
        clock: ClockSource,
        msgs: SafeLogger,
        http: Box<dyn HttpCapability>,
        file_xfer: Box<dyn FileXferCapability>,
        process: Box<dyn ProcessCapability>,
    ) -> R<ClientState> {
        let now = clock();
        let prefs = Prefs::load(&file_names::prefs_file(data_dir))?;
        Ok(ClientState {
            data_dir: data_dir.to_owned(),
            clock,
            msgs,
            host_info: HostInfo::default(),
            prefs,
            run_mode: RunMode::Always,
            user_active: false,
            network_available: true,
            projects: HashMap::new(),
            apps: HashMap::new(),
            app_versions: HashMap::new(),
            workunits: HashMap::new(),
            results: HashMap::new(),
            file_infos: HashMap::new(),
            active_tasks: ActiveTaskSet::default(),
            pers_xfers: PersFileXferSet::default(),
            sched_op: SchedulerOp::default(),
            http,
            file_xfer,
            process,
            now,
            last_tick: None,
            computing_suspended: false,
            dirty: false,
        })
    }

    /// Startup sequence: recover durable state, seed projects from
    /// account files, relaunch tasks that were running when the client
    /// last stopped.
    pub fn startup(&mut self) -> R<()> {
        let state_path = file_names::state_file(&self.data_dir);
        if state_path.exists() {
            if let Err(e) = self.load(&state_path) {
                self.msg(
                    None,
                    MessagePriority::InternalError,
                    &format!("state file unusable, starting fresh: {}", e),
                );
            }
        }
        self.seed_projects_from_accounts()?;
        self.restart_tasks();
        Ok(())
    }

    fn seed_projects_from_accounts(&mut self) -> R<()> {
        let accts = account::read_accounts(&file_names::accounts_dir(&self.data_dir))?;
        for acct in accts {
            if let Some(p) = self.projects.get_mut(&acct.master_url) {
                // Account file is authoritative for credentials and share.
                p.authenticator = acct.authenticator;
                p.resource_share = acct.resource_share;
                continue;
            }
            let mut p = Project::new(&acct.master_url, &acct.authenticator);
            p.project_name = acct.project_name;
            p.resource_share = acct.resource_share;
            self.msg(
                Some(&acct.master_url),
                MessagePriority::Info,
                "attached to project",
            );
            self.projects.insert(acct.master_url.clone(), p);
            self.dirty = true;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Persistence

    pub fn load(&mut self, path: &Path) -> R<()> {
        let bytes = std::fs::read(path)?;
        let saved: SavedState = serde_json::from_slice(&bytes)?;

        self.host_info = saved.host_info;
        if let Some(mode) = saved.run_mode {
            self.run_mode = mode;
        }
        self.projects = saved
            .projects
            .into_iter()
            .map(|p| (p.master_url.clone(), p))
            .collect();
        self.apps = saved
            .apps
            .into_iter()
            .map(|a| (file_key(&a.project_url, &a.name), a))
            .collect();
        self.app_versions = saved
            .app_versions
            .into_iter()
            .map(|v| {
                (
                    AppVersion::key(&v.project_url, &v.app_name, v.version_num),
                    v,
                )
            })
            .collect();
        self.workunits = saved
            .workunits
            .into_iter()
            .map(|w| (w.name.clone(), w))
            .collect();
        self.results = saved
            .results
            .into_iter()
            .map(|r| (r.name.clone(), r))
            .collect();
        self.file_infos = saved
            .file_infos
            .into_iter()
            .map(|f| (file_key(&f.project_url, &f.name), f))
            .collect();
        self.pers_xfers = saved.pers_xfers;
        self.active_tasks = ActiveTaskSet::from_saved(saved.active_tasks);

        self.drop_orphans();
        Ok(())
    }

    /// Cross-references are persisted by name; anything that no longer
    /// resolves is dropped with a logged message rather than crashing.
    fn drop_orphans(&mut self) {
        let projects = &self.projects;
        let workunits = &mut self.workunits;
        let mut dropped: Vec<String> = Vec::new();

        workunits.retain(|name, wu| {
            let ok = projects.contains_key(&wu.project_url);
            if !ok {
                dropped.push(format!("workunit {} (no project)", name));
            }
            ok
        });

        let workunits = &self.workunits;
        self.results.retain(|name, r| {
            let ok = projects.contains_key(&r.project_url) && workunits.contains_key(&r.wu_name);
            if !ok {
                dropped.push(format!("result {} (broken reference)", name));
            }
            ok
        });

        self.file_infos.retain(|_, f| {
            let ok = projects.contains_key(&f.project_url);
            if !ok {
                dropped.push(format!("file {} (no project)", f.name));
            }
            ok
        });

        let results = &self.results;
        self.active_tasks
            .tasks
            .retain(|t| results.contains_key(&t.result_name));

        for what in dropped {
            self.msg(
                None,
                MessagePriority::InternalError,
                &format!("dropping orphaned {}", what),
            );
        }
    }

    pub fn save(&self) -> R<()> {
        let saved = SavedState {
            host_info: self.host_info.clone(),
            run_mode: Some(self.run_mode),
            projects: self.projects.values().cloned().collect(),
            apps: self.apps.values().cloned().collect(),
            app_versions: self.app_versions.values().cloned().collect(),
            workunits: self.workunits.values().cloned().collect(),
            results: self.results.values().cloned().collect(),
            file_infos: self.file_infos.values().cloned().collect(),
            active_tasks: self.active_tasks_snapshot(),
            pers_xfers: self.pers_xfers.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&saved)?;
        util::write_file_atomic(&file_names::state_file(&self.data_dir), &bytes)
    }

    // ------------------------------------------------------------------
    // Garbage collection

    /// Mark-and-sweep over the entity graph: acked results go first,
    /// then unreferenced workunits, then files nothing points at (their
    /// bytes included). Returns whether anything was deleted, which is
    /// what decides a lazy state flush.
    pub fn garbage_collect(&mut self) -> bool {
        let mut changed = false;

        let before = self.results.len();
        self.results.retain(|_, r| !r.acked());
        changed |= self.results.len() != before;

        let mut wu_refs: HashMap<String, u32> = HashMap::new();
        for r in self.results.values() {
            *wu_refs.entry(r.wu_name.clone()).or_insert(0) += 1;
        }
        let before = self.workunits.len();
        self.workunits
            .retain(|name, _| wu_refs.get(name).copied().unwrap_or(0) > 0);
        changed |= self.workunits.len() != before;

        for f in self.file_infos.values_mut() {
            f.ref_count = 0;
        }
        let mut bump = |file_infos: &mut HashMap<String, FileInfo>, url: &str, name: &str| {
            if let Some(f) = file_infos.get_mut(&file_key(url, name)) {
                f.ref_count += 1;
            }
        };
        for wu in self.workunits.values() {
            for fr in &wu.input_files {
                bump(&mut self.file_infos, &wu.project_url, &fr.file_name);
            }
        }
        for r in self.results.values() {
            for fr in &r.output_files {
                bump(&mut self.file_infos, &r.project_url, &fr.file_name);
            }
        }
        for v in self.app_versions.values() {
            bump(&mut self.file_infos, &v.project_url, &v.exec_file);
        }

        let data_dir = self.data_dir.clone();
        let mut deleted_bytes: Vec<PathBuf> = Vec::new();
        let before = self.file_infos.len();
        self.file_infos.retain(|_, f| {
            let keep = f.ref_count > 0 || f.sticky || f.executable;
            if !keep {
                deleted_bytes.push(file_names::file_path(&data_dir, &f.project_url, &f.name));
            }
            keep
        });
        changed |= self.file_infos.len() != before;
        for path in deleted_bytes {
            if path.exists() {
                let _ = std::fs::remove_file(&path);
            }
        }

        // Transfers for files that no longer exist have nothing to
        // move; any still-running network operation goes with them.
        let file_infos = &self.file_infos;
        let before = self.pers_xfers.xfers.len();
        let mut dead_handles = Vec::new();
        self.pers_xfers.xfers.retain(|x| {
            let keep = file_infos.contains_key(&file_key(&x.project_url, &x.file_name));
            if !keep {
                if let Some(h) = x.handle {
                    dead_handles.push(h);
                }
            }
            keep
        });
        for h in dead_handles {
            self.file_xfer.cancel(h);
        }
        changed |= self.pers_xfers.xfers.len() != before;

        changed
    }

    /// Remove a project and everything that hangs off it.
    pub fn detach_project(&mut self, master_url: &str) -> R<()> {
        let url = master_url.to_owned();
        if self.projects.remove(&url).is_none() {
            return Err(crate::errors::Error::no_such("project", master_url));
        }
        if self.sched_op.project_url.as_deref() == Some(master_url) {
            self.abort_sched_op();
        }
        let result_names: Vec<String> = self
            .results
            .values()
            .filter(|r| r.project_url == url)
            .map(|r| r.name.clone())
            .collect();
        for name in result_names {
            self.abort_task(&name);
            self.results.remove(&name);
        }
        self.workunits.retain(|_, w| w.project_url != url);
        self.apps.retain(|_, a| a.project_url != url);
        self.app_versions.retain(|_, v| v.project_url != url);
        self.file_infos.retain(|_, f| f.project_url != url);
        let mut dead_handles = Vec::new();
        self.pers_xfers.xfers.retain(|x| {
            let keep = x.project_url != url;
            if !keep {
                if let Some(h) = x.handle {
                    dead_handles.push(h);
                }
            }
            keep
        });
        // Cancel before the project directory goes away, or an in-flight
        // download keeps writing into it.
        for h in dead_handles {
            self.file_xfer.cancel(h);
        }
        let dir = file_names::project_dir(&self.data_dir, &url);
        if dir.exists() {
            let _ = std::fs::remove_dir_all(&dir);
        }
        self.msg(Some(&url), MessagePriority::Info, "detached from project");
        self.dirty = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // The scheduling loop

    /// One tick of the cooperative loop. Sub-poll order is fixed so a
    /// task that just finished is folded into result state before the
    /// work-fetch decision reads debt figures. Returns whether anything
    /// happened.
    pub fn do_something(&mut self) -> bool {
        let now = (self.clock)();
        let dt = self.last_tick.map_or(0.0, |t| secs_between(t, now)).max(0.0);
        self.last_tick = Some(now);
        self.now = now;

        let mut acted = false;

        let should_suspend = self.should_suspend();
        if should_suspend != self.computing_suspended {
            // Edge-triggered: signal processes once per transition, not
            // every tick.
            if should_suspend {
                self.tasks_suspend_all();
                self.pers_xfers_suspend_all();
                self.abort_sched_op();
            } else {
                self.tasks_resume_all();
            }
            self.computing_suspended = should_suspend;
            acted = true;
        }

        if !self.computing_suspended {
            acted |= self.pers_xfers_poll();
            acted |= self.scheduler_rpc_poll();
            acted |= self.active_tasks_poll();
            self.update_result_states();
            self.adjust_debts(dt);
            acted |= self.work_fetch_poll();
            acted |= self.start_runnable_results();
        }

        if self.garbage_collect() {
            self.dirty = true;
            acted = true;
        }

        if self.dirty {
            match self.save() {
                Ok(()) => self.dirty = false,
                Err(e) => {
                    // Previous durable state is intact; retry next tick.
                    self.msg(
                        None,
                        MessagePriority::InternalError,
                        &format!("cannot write state file: {}", e),
                    );
                }
            }
        }

        acted
    }

    fn should_suspend(&self) -> bool {
        match self.run_mode {
            RunMode::Always => false,
            RunMode::Never => true,
            RunMode::Auto => self.user_active,
        }
    }

    /// Move results forward on file-state changes: inputs all present →
    /// ready to run; an errored input kills the result; outputs all
    /// settled → ready to report.
    pub fn update_result_states(&mut self) {
        let mut failures: Vec<(String, String)> = Vec::new();

        for r in self.results.values_mut() {
            match r.state {
                ResultState::New | ResultState::FilesDownloading => {
                    let wu = match self.workunits.get(&r.wu_name) {
                        Some(wu) => wu,
                        None => continue,
                    };
                    let mut input_keys: Vec<String> = wu
                        .input_files
                        .iter()
                        .map(|fr| file_key(&wu.project_url, &fr.file_name))
                        .collect();
                    if let Some(v) = lookup_app_version(
                        &self.app_versions,
                        &wu.project_url,
                        &wu.app_name,
                        wu.version_num,
                    ) {
                        input_keys.push(file_key(&v.project_url, &v.exec_file));
                    }
                    let mut all_present = true;
                    let mut failed: Option<String> = None;
                    for key in &input_keys {
                        match self.file_infos.get(key) {
                            Some(f) if f.status == FileStatus::Present => {}
                            Some(f) if f.had_failure() => {
                                failed = Some(
                                    f.error_msg.clone().unwrap_or_else(|| "file error".into()),
                                );
                                break;
                            }
                            _ => all_present = false,
                        }
                    }
                    if let Some(msg) = failed {
                        r.state = ResultState::ComputeError;
                        r.exit_status = Some(crate::constants::ERR_FILE_XFER);
                        r.stderr_out = format!("input file failure: {}", msg);
                        failures.push((r.project_url.clone(), r.name.clone()));
                    } else if all_present {
                        r.state = ResultState::FilesDownloaded;
                    } else {
                        r.state = ResultState::FilesDownloading;
                    }
                }
                ResultState::FilesUploading => {
                    let mut settled = true;
                    for fr in &r.output_files {
                        match self.file_infos.get(&file_key(&r.project_url, &fr.file_name)) {
                            Some(f) => {
                                if !f.uploaded && !f.had_failure() {
                                    settled = false;
                                }
                            }
                            None => {}
                        }
                    }
                    if settled {
                        r.state = ResultState::FilesUploaded;
                    }
                }
                _ => {}
            }
        }

        let msgs = self.msgs.clone();
        for (url, result_name) in failures {
            if let Some(p) = self.projects.get(&url) {
                msgs.insert(
                    Some(p),
                    MessagePriority::UserAlert,
                    self.now,
                    &format!("giving up on {}: file transfer failed", result_name),
                );
            }
            self.dirty = true;
        }
    }

    // ------------------------------------------------------------------
    // Helpers shared across subsystem impls

    pub fn msg(&self, project_url: Option<&str>, priority: MessagePriority, body: &str) {
        let project = project_url.and_then(|u| self.projects.get(u));
        self.msgs.insert(
            project.map(|p| p as &dyn crate::common::ProjAm),
            priority,
            self.now,
            body,
        );
    }

    pub fn project_dir_of(&self, master_url: &str) -> PathBuf {
        file_names::project_dir(&self.data_dir, master_url)
    }

    pub fn file_path_of(&self, master_url: &str, file_name: &str) -> PathBuf {
        file_names::file_path(&self.data_dir, master_url, file_name)
    }

    pub fn slot_path(&self, slot: usize) -> PathBuf {
        file_names::slot_dir(&self.data_dir, slot)
    }

    pub fn ncpus(&self) -> i64 {
        self.host_info.usable_ncpus(self.prefs.max_ncpus)
    }
}

/// Exact version if known, otherwise the newest version of the app.
pub fn lookup_app_version<'a>(
    app_versions: &'a HashMap<String, AppVersion>,
    project_url: &str,
    app_name: &str,
    version_num: i32,
) -> Option<&'a AppVersion> {
    if version_num != 0 {
        if let Some(v) = app_versions.get(&AppVersion::key(project_url, app_name, version_num)) {
            return Some(v);
        }
    }
    app_versions
        .values()
        .filter(|v| v.project_url == project_url && v.app_name == app_name)
        .max_by_key(|v| v.version_num)
}
