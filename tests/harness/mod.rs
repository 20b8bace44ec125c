//! Shared test fixtures: a client wired to scripted capability mocks
//! and a hand-driven clock, so whole scheduling scenarios run without
//! sockets, child processes or real time.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::TimeZone;
use tempfile::TempDir;
use uuid::Uuid;

use volcore::app::{App, AppVersion};
use volcore::common::{add_secs, ClockSource, Time};
use volcore::errors::{Error, R};
use volcore::file_info::{FileInfo, FileRef, FileStatus};
use volcore::messages::StandardLogger;
use volcore::process::{ProcessCapability, ProcessPoll};
use volcore::projects::Project;
use volcore::result::ResultInfo;
use volcore::state::{file_key, ClientState};
use volcore::workunit::Workunit;
use volcore::xfers::{
    FileXferCapability, FileXferPoll, HttpCapability, HttpPoll, HttpResponse,
};

// ---------------------------------------------------------------------
// Clock

#[derive(Clone)]
pub struct TestClock(Arc<RwLock<Time>>);

impl TestClock {
    pub fn new() -> TestClock {
        TestClock(Arc::new(RwLock::new(
            chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        )))
    }

    pub fn source(&self) -> ClockSource {
        let h = self.0.clone();
        Arc::new(move || *h.read().unwrap())
    }

    pub fn advance(&self, secs: f64) {
        let mut t = self.0.write().unwrap();
        *t = add_secs(*t, secs);
    }

    pub fn now(&self) -> Time {
        *self.0.read().unwrap()
    }
}

// ---------------------------------------------------------------------
// HTTP mock

pub enum HttpScript {
    Status(u16, Vec<u8>),
    Transport(String),
    Hang,
}

#[derive(Default)]
pub struct HttpInner {
    pub script: VecDeque<HttpScript>,
    /// (url, body); body empty for GETs.
    pub requests: Vec<(String, Vec<u8>)>,
    pub active: HashMap<Uuid, HttpScript>,
    pub cancelled: usize,
}

#[derive(Clone, Default)]
pub struct MockHttp(pub Arc<Mutex<HttpInner>>);

impl MockHttp {
    fn begin(&self, url: &str, body: Vec<u8>) -> R<Uuid> {
        let mut g = self.0.lock().unwrap();
        g.requests.push((url.to_owned(), body));
        let s = g
            .script
            .pop_front()
            .unwrap_or_else(|| HttpScript::Transport("unscripted request".into()));
        let id = Uuid::new_v4();
        g.active.insert(id, s);
        Ok(id)
    }

    pub fn push(&self, s: HttpScript) {
        self.0.lock().unwrap().script.push_back(s);
    }

    pub fn n_requests(&self) -> usize {
        self.0.lock().unwrap().requests.len()
    }

    pub fn request(&self, i: usize) -> (String, Vec<u8>) {
        self.0.lock().unwrap().requests[i].clone()
    }

    pub fn cancelled(&self) -> usize {
        self.0.lock().unwrap().cancelled
    }
}

impl HttpCapability for MockHttp {
    fn post(&mut self, url: &str, payload: Vec<u8>) -> R<Uuid> {
        self.begin(url, payload)
    }

    fn get(&mut self, url: &str) -> R<Uuid> {
        self.begin(url, Vec::new())
    }

    fn poll(&mut self, id: Uuid) -> HttpPoll {
        let mut g = self.0.lock().unwrap();
        match g.active.get(&id) {
            None => HttpPoll::TransportFailure("unknown handle".into()),
            Some(HttpScript::Hang) => HttpPoll::InProgress,
            Some(HttpScript::Status(status, body)) => {
                let out = HttpPoll::Done(HttpResponse {
                    status: *status,
                    body: body.clone(),
                });
                g.active.remove(&id);
                out
            }
            Some(HttpScript::Transport(why)) => {
                let out = HttpPoll::TransportFailure(why.clone());
                g.active.remove(&id);
                out
            }
        }
    }

    fn cancel(&mut self, id: Uuid) {
        let mut g = self.0.lock().unwrap();
        g.active.remove(&id);
        g.cancelled += 1;
    }
}

// ---------------------------------------------------------------------
// File-transfer mock

pub enum XferScript {
    /// Complete with this HTTP status; for successful downloads the
    /// given bytes are written to the destination first.
    Done {
        status: u16,
        write: Option<Vec<u8>>,
    },
    Transport(String),
    Hang,
}

pub struct XferStart {
    pub url: String,
    pub path: PathBuf,
    pub upload: bool,
}

#[derive(Default)]
pub struct XferInner {
    pub script: VecDeque<XferScript>,
    pub starts: Vec<XferStart>,
    pub active: HashMap<Uuid, (XferScript, PathBuf)>,
    pub cancelled: usize,
}

#[derive(Clone, Default)]
pub struct MockXfer(pub Arc<Mutex<XferInner>>);

impl MockXfer {
    fn begin(&self, url: &str, path: &Path, upload: bool) -> R<Uuid> {
        let mut g = self.0.lock().unwrap();
        g.starts.push(XferStart {
            url: url.to_owned(),
            path: path.to_owned(),
            upload,
        });
        let s = g
            .script
            .pop_front()
            .unwrap_or_else(|| XferScript::Transport("unscripted transfer".into()));
        let id = Uuid::new_v4();
        g.active.insert(id, (s, path.to_owned()));
        Ok(id)
    }

    pub fn push(&self, s: XferScript) {
        self.0.lock().unwrap().script.push_back(s);
    }

    pub fn n_starts(&self) -> usize {
        self.0.lock().unwrap().starts.len()
    }

    pub fn start_url(&self, i: usize) -> String {
        self.0.lock().unwrap().starts[i].url.clone()
    }

    pub fn cancelled(&self) -> usize {
        self.0.lock().unwrap().cancelled
    }
}

impl FileXferCapability for MockXfer {
    fn start_download(&mut self, url: &str, dest: &Path) -> R<Uuid> {
        self.begin(url, dest, false)
    }

    fn start_upload(&mut self, url: &str, src: &Path) -> R<Uuid> {
        self.begin(url, src, true)
    }

    fn poll(&mut self, id: Uuid) -> FileXferPoll {
        let mut g = self.0.lock().unwrap();
        match g.active.get(&id) {
            None => FileXferPoll::TransportFailure("unknown handle".into()),
            Some((XferScript::Hang, _)) => FileXferPoll::InProgress { bytes_xferred: 0 },
            Some((XferScript::Done { status, write }, path)) => {
                if let Some(bytes) = write {
                    if let Some(parent) = path.parent() {
                        let _ = std::fs::create_dir_all(parent);
                    }
                    std::fs::write(path, bytes).unwrap();
                }
                let out = FileXferPoll::Done { status: *status };
                g.active.remove(&id);
                out
            }
            Some((XferScript::Transport(why), _)) => {
                let out = FileXferPoll::TransportFailure(why.clone());
                g.active.remove(&id);
                out
            }
        }
    }

    fn cancel(&mut self, id: Uuid) {
        let mut g = self.0.lock().unwrap();
        g.active.remove(&id);
        g.cancelled += 1;
    }
}

// ---------------------------------------------------------------------
// Worker-process mock

pub enum ProcScript {
    FailStart(String),
    /// Poll reports Running until the scripted outcome is consumed.
    Outcome(ProcessPoll),
    Run,
}

#[derive(Default)]
pub struct ProcInner {
    pub script: VecDeque<ProcScript>,
    pub starts: Vec<(PathBuf, Vec<String>)>,
    pub active: HashMap<Uuid, ProcScript>,
    /// Reported as the live CPU figure of every active worker.
    pub live_cpu: f64,
    pub suspends: usize,
    pub resumes: usize,
    pub kills: usize,
}

#[derive(Clone, Default)]
pub struct MockProc(pub Arc<Mutex<ProcInner>>);

impl MockProc {
    pub fn push(&self, s: ProcScript) {
        self.0.lock().unwrap().script.push_back(s);
    }

    pub fn n_starts(&self) -> usize {
        self.0.lock().unwrap().starts.len()
    }

    pub fn suspends(&self) -> usize {
        self.0.lock().unwrap().suspends
    }

    pub fn resumes(&self) -> usize {
        self.0.lock().unwrap().resumes
    }

    pub fn kills(&self) -> usize {
        self.0.lock().unwrap().kills
    }

    pub fn set_live_cpu(&self, secs: f64) {
        self.0.lock().unwrap().live_cpu = secs;
    }
}

impl ProcessCapability for MockProc {
    fn start(
        &mut self,
        exe: &Path,
        args: &[String],
        _cwd: &Path,
        _stderr_file: &Path,
    ) -> R<Uuid> {
        let mut g = self.0.lock().unwrap();
        match g.script.pop_front().unwrap_or(ProcScript::Run) {
            ProcScript::FailStart(why) => Err(Error::process(why)),
            s => {
                g.starts.push((exe.to_owned(), args.to_vec()));
                let id = Uuid::new_v4();
                g.active.insert(id, s);
                Ok(id)
            }
        }
    }

    fn poll(&mut self, id: Uuid) -> ProcessPoll {
        let mut g = self.0.lock().unwrap();
        match g.active.get(&id) {
            None => ProcessPoll::Unknown,
            Some(ProcScript::Run) => ProcessPoll::Running,
            Some(ProcScript::Outcome(p)) => {
                let out = *p;
                g.active.remove(&id);
                out
            }
            Some(ProcScript::FailStart(_)) => ProcessPoll::Unknown,
        }
    }

    fn cpu_time(&self, id: Uuid) -> Option<f64> {
        let g = self.0.lock().unwrap();
        if g.active.contains_key(&id) {
            Some(g.live_cpu)
        } else {
            None
        }
    }

    fn suspend(&mut self, _id: Uuid) -> R<()> {
        self.0.lock().unwrap().suspends += 1;
        Ok(())
    }

    fn resume(&mut self, _id: Uuid) -> R<()> {
        self.0.lock().unwrap().resumes += 1;
        Ok(())
    }

    fn kill(&mut self, id: Uuid) -> R<()> {
        let mut g = self.0.lock().unwrap();
        g.active.remove(&id);
        g.kills += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Whole-client fixture

pub struct Sim {
    pub dir: TempDir,
    pub clock: TestClock,
    pub http: MockHttp,
    pub xfer: MockXfer,
    pub proc: MockProc,
    pub state: ClientState,
}

impl Sim {
    pub fn new() -> Sim {
        let dir = tempfile::tempdir().unwrap();
        Sim::in_dir(dir)
    }

    pub fn in_dir(dir: TempDir) -> Sim {
        let clock = TestClock::new();
        let http = MockHttp::default();
        let xfer = MockXfer::default();
        let proc = MockProc::default();
        let mut state = ClientState::new(
            dir.path(),
            clock.source(),
            Arc::new(StandardLogger::default()),
            Box::new(http.clone()),
            Box::new(xfer.clone()),
            Box::new(proc.clone()),
        )
        .unwrap();
        state.host_info.p_ncpus = 1;
        state.host_info.p_fpops = 1e9;
        Sim {
            dir,
            clock,
            http,
            xfer,
            proc,
            state,
        }
    }

    /// Simulate a client restart on the same data directory: fresh state
    /// object, fresh mocks, recovered from the state file.
    pub fn reopen(self) -> Sim {
        let Sim { dir, .. } = self;
        let mut sim = Sim::in_dir(dir);
        sim.state.startup().unwrap();
        sim
    }

    /// One scheduling tick with the clock advanced far enough that no
    /// poll-period gate skips.
    pub fn tick(&mut self) -> bool {
        self.clock.advance(2.0);
        self.state.do_something()
    }

    pub fn add_project(&mut self, url: &str) {
        let mut p = Project::new(url, "test-auth");
        p.scheduler_urls = vec![format!("{}cgi", url)];
        self.state.projects.insert(url.to_owned(), p);
    }

    pub fn project(&self, url: &str) -> &Project {
        &self.state.projects[url]
    }

    pub fn project_mut(&mut self, url: &str) -> &mut Project {
        self.state.projects.get_mut(url).unwrap()
    }

    /// App with one version whose executable is already present.
    pub fn add_app(&mut self, url: &str, app_name: &str) {
        self.state.apps.insert(
            file_key(url, app_name),
            App {
                name: app_name.to_owned(),
                user_friendly_name: app_name.to_owned(),
                project_url: url.to_owned(),
            },
        );
        let exec_name = format!("{}_v1", app_name);
        self.state.app_versions.insert(
            AppVersion::key(url, app_name, 1),
            AppVersion {
                app_name: app_name.to_owned(),
                version_num: 1,
                platform: "test".into(),
                avg_ncpus: 1.0,
                flops: 1e9,
                exec_file: exec_name.clone(),
                project_url: url.to_owned(),
            },
        );
        let mut fi = FileInfo::new(&exec_name, url);
        fi.executable = true;
        fi.sticky = true;
        fi.status = FileStatus::Present;
        self.write_project_file(url, &exec_name, b"#!/bin/true");
        self.state.file_infos.insert(file_key(url, &exec_name), fi);
    }

    /// Workunit plus result with one input file (present on disk) and
    /// one output file.
    pub fn add_job(&mut self, url: &str, app_name: &str, wu_name: &str, result_name: &str) {
        let input_name = format!("{}_in", wu_name);
        let output_name = format!("{}_out", result_name);

        let mut input = FileInfo::new(&input_name, url);
        input.status = FileStatus::Present;
        input.download_urls = vec![format!("{}download/{}", url, input_name)];
        self.write_project_file(url, &input_name, b"input bytes");
        self.state.file_infos.insert(file_key(url, &input_name), input);

        let mut output = FileInfo::new(&output_name, url);
        output.upload_urls = vec![format!("{}upload/{}", url, output_name)];
        self.state
            .file_infos
            .insert(file_key(url, &output_name), output);

        self.state.workunits.insert(
            wu_name.to_owned(),
            Workunit {
                name: wu_name.to_owned(),
                project_url: url.to_owned(),
                app_name: app_name.to_owned(),
                version_num: 1,
                command_line: "--work".into(),
                input_files: vec![FileRef::new(&input_name)],
                rsc_fpops_est: 3600.0 * 1e9,
                rsc_fpops_bound: 36_000.0 * 1e9,
                rsc_memory_bound: 1e8,
                rsc_disk_bound: 1e8,
            },
        );

        let now = self.clock.now();
        let mut r = ResultInfo::new(
            result_name,
            wu_name,
            url,
            now,
            add_secs(now, 7.0 * 86_400.0),
        );
        r.output_files = vec![FileRef::new(&output_name)];
        self.state.results.insert(result_name.to_owned(), r);
    }

    pub fn write_project_file(&self, url: &str, name: &str, bytes: &[u8]) {
        let path = volcore::file_names::file_path(self.dir.path(), url, name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    pub fn result(&self, name: &str) -> &ResultInfo {
        &self.state.results[name]
    }

    pub fn file(&self, url: &str, name: &str) -> &FileInfo {
        &self.state.file_infos[&file_key(url, name)]
    }
}
