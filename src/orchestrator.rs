use crate::bundle::{write_debug_bundle, BundleInputs};
use crate::config::JobConfig;
use crate::contract::{validate_outputs, Contract, ContractError, OutputCheck};
use crate::kernel::{ExecutionKernel, KernelError, VariableSurface, BOOTSTRAP_SCRIPT};
use crate::locator::{pair_for_path, DesignPair, LocateOutcome, Locator, REASON_USER_SELECTED};
use crate::protocol::manifest::SelectedDesign;
use crate::protocol::{
    AckStatus, Candidate, ErrorType, JobStatus, LocatorMode, Manifest, ProtocolError, Summary,
    TimelineWriter,
};
use crate::rundir::{create_run_dir, RunDirError, RunPaths};
use crate::session::{
    launcher_from_config, HealthWatcher, Launcher, SessionError, SessionSupervisor,
};
use crate::shared::new_job_id;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    RunDir(#[from] RunDirError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("unknown job `{job_id}`")]
    UnknownJob { job_id: String },
    #[error("job `{job_id}` is not awaiting a selection")]
    NotAwaitingSelection { job_id: String },
    #[error("selection index {index} out of range ({count} candidates)")]
    InvalidSelection { index: usize, count: usize },
}

/// Lifecycle states in visit order; every failure converges on `FAIL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Init,
    PrepareRundir,
    LocateDb,
    StartSession,
    RestoreDb,
    RunSkill,
    ValidateOutputs,
    Summarize,
    Done,
    Fail,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Init => "INIT",
            JobState::PrepareRundir => "PREPARE_RUNDIR",
            JobState::LocateDb => "LOCATE_DB",
            JobState::StartSession => "START_SESSION",
            JobState::RestoreDb => "RESTORE_DB",
            JobState::RunSkill => "RUN_SKILL",
            JobState::ValidateOutputs => "VALIDATE_OUTPUTS",
            JobState::Summarize => "SUMMARIZE",
            JobState::Done => "DONE",
            JobState::Fail => "FAIL",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub job_id: String,
    pub status: JobStatus,
    pub error_type: ErrorType,
    pub run_dir: PathBuf,
}

/// Stepwise outcome of driving a job. Multi-candidate locator results pause
/// the job instead of blocking on user input; the caller resumes with
/// [`Orchestrator::resume_job`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Terminated(JobReport),
    AwaitingSelection {
        job_id: String,
        run_dir: PathBuf,
        candidates: Vec<Candidate>,
    },
}

struct Failure {
    error_type: ErrorType,
    message: String,
}

impl Failure {
    fn classified(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }

    fn internal(source: impl std::fmt::Display) -> Self {
        Self {
            error_type: ErrorType::InternalError,
            message: source.to_string(),
        }
    }
}

/// Mutable evidence accumulated while a job runs; consumed by the failure
/// path so the bundler sees whatever existed at the point of failure.
#[derive(Default)]
struct Scratch {
    contract: Option<Contract>,
    contract_path: Option<PathBuf>,
    pair: Option<DesignPair>,
    handle: Option<crate::session::SessionHandle>,
    watcher: Option<HealthWatcher>,
    checks: Option<Vec<OutputCheck>>,
    last_fail_ack: Option<String>,
}

enum Flow {
    Pass,
    Await { candidates: Vec<Candidate> },
}

enum EntryPoint {
    Fresh,
    Resume { candidate_path: PathBuf },
}

/// Drives one job through the state machine, converging every terminal
/// outcome to a single classification and a complete evidence trail in the
/// run directory.
pub struct Orchestrator {
    cwd: PathBuf,
    skill_root: PathBuf,
    config: JobConfig,
    supervisor: Arc<SessionSupervisor>,
}

impl Orchestrator {
    pub fn new(
        cwd: impl Into<PathBuf>,
        skill_root: impl Into<PathBuf>,
        config: JobConfig,
    ) -> Result<Self, OrchestratorError> {
        let launcher = launcher_from_config(&config)?;
        Ok(Self::with_launcher(cwd, skill_root, config, launcher))
    }

    /// Inject a launcher directly; this is how test doubles replace the real
    /// tool without touching anything else.
    pub fn with_launcher(
        cwd: impl Into<PathBuf>,
        skill_root: impl Into<PathBuf>,
        config: JobConfig,
        launcher: Box<dyn Launcher>,
    ) -> Self {
        let supervisor = Arc::new(SessionSupervisor::new(launcher, &config));
        Self {
            cwd: cwd.into(),
            skill_root: skill_root.into(),
            config,
            supervisor,
        }
    }

    pub fn run_job(&self, query: &str, skill_name: &str) -> Result<JobOutcome, OrchestratorError> {
        let job_id = new_job_id();
        let (paths, mut manifest, mut timeline) =
            create_run_dir(&self.cwd, &job_id, self.supervisor.launcher_name())?;
        Ok(self.drive(
            &paths,
            &mut manifest,
            &mut timeline,
            query,
            skill_name,
            EntryPoint::Fresh,
        ))
    }

    /// Resume a job that paused on a multi-candidate locator result.
    /// Re-resuming an already terminal job returns its terminal report
    /// unchanged.
    pub fn resume_job(
        &self,
        job_id: &str,
        chosen_index: usize,
    ) -> Result<JobOutcome, OrchestratorError> {
        let paths = RunPaths::for_job(&self.cwd, job_id);
        if !paths.root.is_dir() {
            return Err(OrchestratorError::UnknownJob {
                job_id: job_id.to_string(),
            });
        }
        let mut manifest = Manifest::load(&paths.root)?;
        if manifest.status != JobStatus::Running {
            return Ok(JobOutcome::Terminated(JobReport {
                job_id: job_id.to_string(),
                status: manifest.status,
                error_type: manifest.error_type,
                run_dir: paths.root.clone(),
            }));
        }
        let design = manifest
            .design
            .as_ref()
            .filter(|d| !d.candidates.is_empty() && d.selected.is_none())
            .ok_or_else(|| OrchestratorError::NotAwaitingSelection {
                job_id: job_id.to_string(),
            })?;
        let candidate =
            design
                .candidates
                .get(chosen_index)
                .ok_or(OrchestratorError::InvalidSelection {
                    index: chosen_index,
                    count: design.candidates.len(),
                })?;
        let candidate_path = PathBuf::from(&candidate.path);
        let query = design.query.clone();
        // The skill package directory, recovered from the recorded contract
        // path; the contract's own name may differ from the directory.
        let skill_name = manifest
            .skill
            .as_ref()
            .and_then(|s| {
                Path::new(&s.contract_path)
                    .parent()
                    .and_then(|p| p.file_name())
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
            })
            .unwrap_or_default();

        let mut timeline = TimelineWriter::open(&paths.root, job_id)?;
        Ok(self.drive(
            &paths,
            &mut manifest,
            &mut timeline,
            &query,
            &skill_name,
            EntryPoint::Resume { candidate_path },
        ))
    }

    fn drive(
        &self,
        paths: &RunPaths,
        manifest: &mut Manifest,
        timeline: &mut TimelineWriter,
        query: &str,
        skill_name: &str,
        entry: EntryPoint,
    ) -> JobOutcome {
        let mut scratch = Scratch::default();
        match self.execute(paths, manifest, timeline, &mut scratch, query, skill_name, entry) {
            Ok(Flow::Await { candidates }) => JobOutcome::AwaitingSelection {
                job_id: paths.job_id().to_string(),
                run_dir: paths.root.clone(),
                candidates,
            },
            Ok(Flow::Pass) => self.complete(paths, manifest, timeline, scratch),
            Err(failure) => {
                JobOutcome::Terminated(self.fail_job(paths, manifest, timeline, scratch, failure))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn execute(
        &self,
        paths: &RunPaths,
        manifest: &mut Manifest,
        timeline: &mut TimelineWriter,
        scratch: &mut Scratch,
        query: &str,
        skill_name: &str,
        entry: EntryPoint,
    ) -> Result<Flow, Failure> {
        let job_id = paths.job_id().to_string();
        let mut kernel = ExecutionKernel::new(paths.clone());

        let preselected = match entry {
            EntryPoint::Fresh => {
                self.exit(timeline, JobState::Init)?;

                self.enter(timeline, JobState::PrepareRundir)?;
                self.load_contract(paths, manifest, scratch, skill_name)?;
                self.exit(timeline, JobState::PrepareRundir)?;
                None
            }
            EntryPoint::Resume { candidate_path } => {
                // Contract was already vetted before the pause; reload it
                // without replaying the PREPARE_RUNDIR events.
                self.load_contract(paths, manifest, scratch, skill_name)?;
                Some(candidate_path)
            }
        };

        self.enter(timeline, JobState::LocateDb)?;
        timeline
            .action("locate_db", query, None)
            .map_err(Failure::internal)?;
        let pair = match preselected {
            Some(candidate_path) => {
                let pair = pair_for_path(&candidate_path)
                    .map_err(|reason| Failure::classified(ErrorType::LocatorFail, reason))?;
                let candidates = manifest
                    .design
                    .as_ref()
                    .map(|d| d.candidates.clone())
                    .unwrap_or_default();
                manifest.record_selection(
                    query,
                    LocatorMode::NameScan,
                    candidates,
                    selected_from(&pair),
                    REASON_USER_SELECTED,
                );
                pair
            }
            None => {
                let locator = Locator::new(self.cwd.clone(), self.config.scan_depth);
                match locator.locate(query) {
                    LocateOutcome::Selected {
                        mode,
                        pair,
                        candidates,
                        selection_reason,
                    } => {
                        manifest.record_selection(
                            query,
                            mode,
                            candidates,
                            selected_from(&pair),
                            selection_reason,
                        );
                        pair
                    }
                    LocateOutcome::NeedsSelection { mode, candidates } => {
                        manifest.record_candidates(query, mode, candidates.clone());
                        manifest.store(&paths.root).map_err(Failure::internal)?;
                        timeline
                            .action(
                                "await_selection",
                                "multiple candidates, selection required",
                                Some(serde_json::json!({ "candidates": candidates.len() })),
                            )
                            .map_err(Failure::internal)?;
                        return Ok(Flow::Await { candidates });
                    }
                    LocateOutcome::Failed { mode, reason } => {
                        manifest.record_candidates(query, mode, Vec::new());
                        return Err(Failure::classified(ErrorType::LocatorFail, reason));
                    }
                }
            }
        };
        manifest.store(&paths.root).map_err(Failure::internal)?;
        scratch.pair = Some(pair.clone());
        self.exit(timeline, JobState::LocateDb)?;

        self.enter(timeline, JobState::StartSession)?;
        timeline
            .action("start_session", self.supervisor.launcher_name(), None)
            .map_err(Failure::internal)?;
        let surface = VariableSurface::new(paths, &job_id, Some(&pair));
        kernel.write_bootstrap(&surface).map_err(Failure::internal)?;
        let init_script = paths.scripts_dir().join(BOOTSTRAP_SCRIPT);
        let handle = self
            .supervisor
            .start(paths, &BTreeMap::new(), &init_script)
            .map_err(|e| Failure::classified(ErrorType::SessionStartFail, e.to_string()))?;
        scratch.handle = Some(handle.clone());
        self.supervisor
            .wait_ready(paths, &handle)
            .map_err(|e| Failure::classified(ErrorType::SessionStartFail, e.to_string()))?;
        self.exit(timeline, JobState::StartSession)?;

        // From here on a background watcher races the ack waits: a crashed
        // or silent session interrupts them instead of running into the
        // full ack timeout.
        scratch.watcher = Some(HealthWatcher::spawn(
            self.supervisor.clone(),
            paths.clone(),
            handle,
            Duration::from_millis(self.config.health_poll_interval_ms),
        ));

        self.enter(timeline, JobState::RestoreDb)?;
        kernel
            .write_restore_wrapper(&surface)
            .map_err(Failure::internal)?;
        self.submit_and_wait(
            &mut kernel,
            scratch,
            timeline,
            "scripts/restore_wrapper.tcl",
            self.config.restore_timeout_s,
            "restore",
        )?;
        self.exit(timeline, JobState::RestoreDb)?;

        self.enter(timeline, JobState::RunSkill)?;
        let contract = scratch
            .contract
            .as_ref()
            .ok_or_else(|| Failure::internal("contract missing after preparation"))?;
        let script = kernel
            .write_skill_entry(&self.skill_root.join(skill_name), contract, &surface)
            .map_err(|e| match e {
                KernelError::Skill { reason } => {
                    Failure::classified(ErrorType::ContractInvalid, reason)
                }
                KernelError::Io { path, source } => Failure::classified(
                    ErrorType::ContractInvalid,
                    format!("skill entry unreadable at {path}: {source}"),
                ),
                other => Failure::internal(other),
            })?;
        self.submit_and_wait(
            &mut kernel,
            scratch,
            timeline,
            &script,
            self.config.ack_timeout_s,
            "skill",
        )?;
        self.exit(timeline, JobState::RunSkill)?;

        self.enter(timeline, JobState::ValidateOutputs)?;
        timeline
            .action("validate_outputs", "", None)
            .map_err(Failure::internal)?;
        let contract = scratch
            .contract
            .as_ref()
            .ok_or_else(|| Failure::internal("contract missing at validation"))?;
        let (checks, verdict) = validate_outputs(contract, &paths.reports_dir()).map_err(|e| {
            match e {
                ContractError::Invalid { reason } => {
                    Failure::classified(ErrorType::ContractInvalid, reason)
                }
                other => Failure::internal(other),
            }
        })?;
        let failed: Vec<_> = checks
            .iter()
            .filter(|c| c.status != crate::contract::OutputStatus::Ok)
            .map(|c| c.pattern.clone())
            .collect();
        scratch.checks = Some(checks);
        if verdict.is_failure() {
            return Err(Failure::classified(
                verdict,
                format!("unsatisfied required outputs: {}", failed.join(", ")),
            ));
        }
        self.exit(timeline, JobState::ValidateOutputs)?;

        self.enter(timeline, JobState::Summarize)?;
        timeline
            .action("summarize", "", None)
            .map_err(Failure::internal)?;
        let mut summary = Summary::new(&job_id, JobStatus::Pass, ErrorType::Ok, &paths.root)
            .with_design(selected_from(&pair));
        if let Some(skill) = &manifest.skill {
            summary = summary.with_skill(&skill.name, &skill.version);
        }
        let total = scratch.checks.as_ref().map(Vec::len).unwrap_or(0);
        summary.set_metric("total_outputs", serde_json::json!(total));
        summary
            .store(&paths.root, "All required outputs validated.", "")
            .map_err(Failure::internal)?;
        self.exit(timeline, JobState::Summarize)?;

        Ok(Flow::Pass)
    }

    fn load_contract(
        &self,
        paths: &RunPaths,
        manifest: &mut Manifest,
        scratch: &mut Scratch,
        skill_name: &str,
    ) -> Result<(), Failure> {
        if skill_name.trim().is_empty() {
            return Err(Failure::classified(
                ErrorType::ContractInvalid,
                "no skill name given",
            ));
        }
        let contract_path = Contract::path_for_skill(&self.skill_root, skill_name);
        scratch.contract_path = Some(contract_path.clone());
        let contract = Contract::load(&contract_path)
            .and_then(|c| c.validate_static().map(|()| c))
            .map_err(|e| Failure::classified(ErrorType::ContractInvalid, e.to_string()))?;
        manifest.record_skill(&contract.name, &contract.version, &contract_path);
        manifest.store(&paths.root).map_err(Failure::internal)?;
        scratch.contract = Some(contract);
        Ok(())
    }

    fn submit_and_wait(
        &self,
        kernel: &mut ExecutionKernel,
        scratch: &mut Scratch,
        timeline: &mut TimelineWriter,
        script: &str,
        timeout_s: u64,
        tag: &str,
    ) -> Result<(), Failure> {
        let request_id = kernel
            .submit(script, timeout_s, tag, timeline)
            .map_err(Failure::internal)?;
        let watcher = scratch
            .watcher
            .as_ref()
            .ok_or_else(|| Failure::internal("health watcher missing"))?;
        let ack = match kernel.wait_for_ack(
            &request_id,
            timeout_s,
            Duration::from_millis(self.config.ack_poll_interval_ms),
            watcher,
            timeline,
        ) {
            Ok(ack) => ack,
            Err(KernelError::SessionFault { fault, .. }) => {
                return Err(Failure::classified(
                    fault.error_type(),
                    format!("session fault while waiting for `{script}`"),
                ))
            }
            Err(KernelError::AckTimeout { waited_s, .. }) => {
                return Err(Failure::classified(
                    ErrorType::QueueTimeout,
                    format!("no ack for `{script}` within {waited_s}s"),
                ))
            }
            Err(other) => return Err(Failure::internal(other)),
        };
        if ack.status == AckStatus::Fail {
            scratch.last_fail_ack = Some(request_id);
            let error_type = if ack.error_type == ErrorType::Ok {
                ErrorType::CmdFail
            } else {
                ack.error_type
            };
            return Err(Failure::classified(error_type, ack.message));
        }
        Ok(())
    }

    fn complete(
        &self,
        paths: &RunPaths,
        manifest: &mut Manifest,
        timeline: &mut TimelineWriter,
        mut scratch: Scratch,
    ) -> JobOutcome {
        if let Some(watcher) = scratch.watcher.take() {
            watcher.shutdown();
        }
        if let Some(handle) = &scratch.handle {
            self.supervisor.stop(paths, handle, "job complete");
        }

        manifest.finalize(JobStatus::Pass, ErrorType::Ok);
        manifest.record_artifacts(&paths.root, false);
        if let Err(err) = manifest.store(&paths.root) {
            return JobOutcome::Terminated(self.fail_job(
                paths,
                manifest,
                timeline,
                scratch,
                Failure::internal(err),
            ));
        }
        let _ = timeline.done("job completed");

        JobOutcome::Terminated(JobReport {
            job_id: paths.job_id().to_string(),
            status: JobStatus::Pass,
            error_type: ErrorType::Ok,
            run_dir: paths.root.clone(),
        })
    }

    fn fail_job(
        &self,
        paths: &RunPaths,
        manifest: &mut Manifest,
        timeline: &mut TimelineWriter,
        mut scratch: Scratch,
        failure: Failure,
    ) -> JobReport {
        manifest.finalize(JobStatus::Fail, failure.error_type);
        manifest.record_artifacts(&paths.root, true);
        let _ = manifest.store(&paths.root);
        let _ = timeline.fail(failure.error_type, &failure.message, None);

        if let Some(watcher) = scratch.watcher.take() {
            watcher.shutdown();
        }
        if let Some(handle) = &scratch.handle {
            self.supervisor.stop(paths, handle, "job failed");
        }

        let inputs = BundleInputs {
            last_fail_ack_id: scratch.last_fail_ack.as_deref(),
            contract_path: scratch.contract_path.as_deref(),
            contract: scratch.contract.as_ref(),
            output_checks: scratch.checks.as_deref(),
        };
        let _ = write_debug_bundle(
            paths,
            failure.error_type,
            &failure.message,
            &inputs,
            self.config.bundle_tail_lines,
        );

        let mut summary = Summary::new(
            paths.job_id(),
            JobStatus::Fail,
            failure.error_type,
            &paths.root,
        );
        if let Some(pair) = &scratch.pair {
            summary = summary.with_design(selected_from(pair));
        }
        if let Some(skill) = &manifest.skill {
            summary = summary.with_skill(&skill.name, &skill.version);
        }
        let _ = summary.store(&paths.root, "", &failure.message);

        JobReport {
            job_id: paths.job_id().to_string(),
            status: JobStatus::Fail,
            error_type: failure.error_type,
            run_dir: paths.root.clone(),
        }
    }

    fn enter(&self, timeline: &mut TimelineWriter, state: JobState) -> Result<(), Failure> {
        timeline.state_enter(state.as_str()).map_err(Failure::internal)
    }

    fn exit(&self, timeline: &mut TimelineWriter, state: JobState) -> Result<(), Failure> {
        timeline.state_exit(state.as_str()).map_err(Failure::internal)
    }
}

fn selected_from(pair: &DesignPair) -> SelectedDesign {
    SelectedDesign {
        enc_path: pair.enc_path.display().to_string(),
        enc_dat_path: pair.enc_dat_path.display().to_string(),
    }
}

/// List run directories below `cwd`, newest last; job ids order
/// lexicographically by construction.
pub fn list_jobs(cwd: &Path) -> Vec<String> {
    let runs_root = cwd.join(crate::rundir::RUNS_ROOT);
    let Ok(entries) = std::fs::read_dir(runs_root) else {
        return Vec::new();
    };
    let mut jobs: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    jobs.sort();
    jobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::load_record;

    #[test]
    fn job_states_render_their_wire_names() {
        assert_eq!(JobState::PrepareRundir.to_string(), "PREPARE_RUNDIR");
        assert_eq!(JobState::LocateDb.to_string(), "LOCATE_DB");
        assert_eq!(JobState::ValidateOutputs.to_string(), "VALIDATE_OUTPUTS");
        let encoded = serde_json::to_string(&JobState::RestoreDb).expect("encode");
        assert_eq!(encoded, "\"RESTORE_DB\"");
    }

    #[test]
    fn resume_on_missing_job_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let orchestrator = Orchestrator::new(tmp.path(), tmp.path().join("skills"), JobConfig::default())
            .expect("orchestrator");
        let err = orchestrator
            .resume_job("20990101_000000_dead", 0)
            .expect_err("unknown job");
        assert!(matches!(err, OrchestratorError::UnknownJob { .. }));
    }

    #[test]
    fn list_jobs_is_sorted_and_tolerates_missing_root() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert!(list_jobs(tmp.path()).is_empty());

        for job in ["20260102_000000_bb22", "20260101_000000_aa11"] {
            std::fs::create_dir_all(tmp.path().join(crate::rundir::RUNS_ROOT).join(job))
                .expect("dirs");
        }
        assert_eq!(
            list_jobs(tmp.path()),
            vec!["20260101_000000_aa11", "20260102_000000_bb22"]
        );
    }

    #[test]
    fn failure_helpers_carry_classification() {
        let failure = Failure::classified(ErrorType::QueueTimeout, "no ack");
        assert_eq!(failure.error_type, ErrorType::QueueTimeout);
        let internal = Failure::internal(std::io::Error::other("boom"));
        assert_eq!(internal.error_type, ErrorType::InternalError);
        assert!(internal.message.contains("boom"));
    }

    #[test]
    fn manifest_after_failed_store_still_loads() {
        // complete() falls back to the failure path when the terminal
        // manifest cannot be written; here we just pin the happy ordering:
        // a stored terminal manifest round-trips with its artifacts block.
        let tmp = tempfile::tempdir().expect("tempdir");
        let (paths, mut manifest, _timeline) =
            create_run_dir(tmp.path(), "job1", "pseudo").expect("create");
        manifest.finalize(JobStatus::Pass, ErrorType::Ok);
        manifest.record_artifacts(&paths.root, false);
        manifest.store(&paths.root).expect("store");

        let loaded: Manifest = load_record(&paths.manifest_path()).expect("load");
        assert_eq!(loaded.status, JobStatus::Pass);
        assert!(loaded.artifacts.expect("artifacts").debug_bundle_dir.is_none());
    }
}
