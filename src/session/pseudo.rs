use super::{Launcher, SessionError, SessionHandle};
use crate::protocol::request::validate_script_path;
use crate::protocol::{Ack, ErrorType, Request, ACTION_SOURCE_TCL};
use crate::rundir::RunPaths;
use crate::shared::now_secs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub const INJECT_FILE: &str = "inject.json";

/// Failure-injection knobs for the pseudo session. Tests either hand them to
/// [`PseudoLauncher::new`] or drop them as `session/inject.json` before the
/// loop starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InjectConfig {
    /// Never emit a heartbeat, so the ready wait expires.
    #[serde(default)]
    pub never_ready: bool,
    /// Acknowledge the restore wrapper with `RESTORE_FAIL`.
    #[serde(default)]
    pub restore_fail: bool,
    /// Fail any request whose script path contains this substring.
    #[serde(default)]
    pub fail_on_script: Option<String>,
    /// Execute skill scripts without producing any report files.
    #[serde(default)]
    pub suppress_reports: bool,
    /// Hang (no heartbeat, no request processing) once this many acks were
    /// written, simulating a wedged tool.
    #[serde(default)]
    pub hang_after_acks: Option<u32>,
    /// Terminate abruptly (non-zero exit) once this many acks were written.
    #[serde(default)]
    pub crash_after_acks: Option<u32>,
}

/// In-memory stand-in for a real tool session: runs the queue-processor loop
/// on a thread against the same run directory contract, so whole jobs can be
/// exercised without an EDA tool installation.
#[derive(Debug, Default)]
pub struct PseudoLauncher {
    inject: InjectConfig,
}

impl PseudoLauncher {
    pub fn new(inject: InjectConfig) -> Self {
        Self { inject }
    }
}

impl Launcher for PseudoLauncher {
    fn name(&self) -> &str {
        crate::config::LAUNCHER_PSEUDO
    }

    fn launch(
        &self,
        paths: &RunPaths,
        _env: &BTreeMap<String, String>,
        _init_script: &Path,
    ) -> Result<SessionHandle, SessionError> {
        // A file-based inject config wins over the constructor's, mirroring
        // how a real session picks its behavior up from the run directory.
        let inject_path = paths.session_dir().join(INJECT_FILE);
        let inject = if inject_path.is_file() {
            let raw = fs::read_to_string(&inject_path)
                .map_err(|e| super::io_error(&inject_path, e))?;
            serde_json::from_str(&raw).map_err(|e| SessionError::Spawn {
                reason: format!("invalid {}: {e}", inject_path.display()),
            })?
        } else {
            self.inject.clone()
        };

        let alive = Arc::new(AtomicBool::new(true));
        let exit_code = Arc::new(Mutex::new(None));
        let thread_paths = paths.clone();
        let thread_alive = alive.clone();
        let thread_exit = exit_code.clone();
        thread::spawn(move || {
            run_queue_processor(&thread_paths, &inject, &thread_alive, &thread_exit);
        });

        Ok(SessionHandle::for_thread(alive, exit_code))
    }
}

enum LoopVerdict {
    Continue,
    Stop,
    Crash,
}

fn run_queue_processor(
    paths: &RunPaths,
    inject: &InjectConfig,
    alive: &Arc<AtomicBool>,
    exit_code: &Arc<Mutex<Option<i32>>>,
) {
    log_stdout(paths, "pseudo session started");
    let mut acks_written = 0u32;
    let mut hung = false;
    let mut final_code = 0;

    while alive.load(Ordering::Relaxed) {
        if !inject.never_ready && !hung {
            let _ = fs::write(paths.heartbeat_path(), now_secs().to_string());
        }
        if paths.stop_path().exists() {
            log_stdout(paths, "stop observed, session exiting");
            break;
        }

        if !inject.never_ready && !hung {
            match drain_pending(paths, inject, &mut acks_written) {
                LoopVerdict::Continue => {}
                LoopVerdict::Stop => break,
                LoopVerdict::Crash => {
                    log_stdout(paths, "simulated tool crash");
                    final_code = 134;
                    break;
                }
            }
            if inject
                .hang_after_acks
                .is_some_and(|limit| acks_written >= limit)
            {
                log_stdout(paths, "simulated hang, heartbeat frozen");
                hung = true;
            }
        }

        thread::sleep(Duration::from_millis(50));
    }

    if let Ok(mut slot) = exit_code.lock() {
        slot.get_or_insert(final_code);
    }
    alive.store(false, Ordering::Relaxed);
}

/// One pass over `queue/`: requests are handled in filename order and any id
/// that already has an ack is skipped, which makes re-delivery harmless.
fn drain_pending(
    paths: &RunPaths,
    inject: &InjectConfig,
    acks_written: &mut u32,
) -> LoopVerdict {
    for request_path in pending_requests(&paths.queue_dir()) {
        let Some(request_id) = request_path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(str::to_string)
        else {
            continue;
        };
        if Ack::path_for(&paths.ack_dir(), &request_id).exists() {
            continue;
        }

        let mut ack = evaluate_request(paths, inject, &request_id, &request_path);
        ack.finish();
        if ack.store(&paths.ack_dir()).is_ok() {
            *acks_written += 1;
            log_stdout(
                paths,
                &format!("request {request_id} acknowledged: {:?}", ack.status),
            );
        }

        if inject
            .crash_after_acks
            .is_some_and(|limit| *acks_written >= limit)
        {
            return LoopVerdict::Crash;
        }
        if paths.stop_path().exists() {
            return LoopVerdict::Stop;
        }
    }
    LoopVerdict::Continue
}

fn evaluate_request(
    paths: &RunPaths,
    inject: &InjectConfig,
    request_id: &str,
    request_path: &Path,
) -> Ack {
    let request = match Request::load(request_path) {
        Ok(request) => request,
        Err(err) => {
            return Ack::fail(
                request_id,
                paths.job_id(),
                ErrorType::CmdFail,
                &format!("unreadable request: {err}"),
            )
        }
    };
    log_stdout(
        paths,
        &format!("processing request {request_id} script {}", request.script),
    );

    if request.action != ACTION_SOURCE_TCL {
        return Ack::fail(
            &request.request_id,
            &request.job_id,
            ErrorType::CmdFail,
            &format!("unsupported action `{}`", request.action),
        );
    }
    let script_path = match validate_script_path(&paths.root, &request.script) {
        Ok(path) => path,
        Err(violation) => {
            return Ack::fail(
                &request.request_id,
                &request.job_id,
                ErrorType::CmdFail,
                &format!("security violation: {violation}"),
            )
        }
    };

    if let Some(needle) = inject
        .fail_on_script
        .as_deref()
        .filter(|needle| request.script.contains(*needle))
    {
        return Ack::fail(
            &request.request_id,
            &request.job_id,
            ErrorType::CmdFail,
            &format!("injected failure for `{needle}`"),
        );
    }

    let is_restore = script_path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.contains("restore_wrapper"));
    if is_restore {
        if inject.restore_fail {
            return Ack::fail(
                &request.request_id,
                &request.job_id,
                ErrorType::RestoreFail,
                "error while sourcing design descriptor",
            )
            .with_evidence(vec!["session/innovus.stdout.log".to_string()]);
        }
        return Ack::pass(&request.request_id, &request.job_id, "restore completed");
    }

    if !inject.suppress_reports {
        write_mock_reports(&paths.reports_dir());
    }
    Ack::pass(
        &request.request_id,
        &request.job_id,
        "skill execution completed",
    )
}

fn pending_requests(queue_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(queue_dir) else {
        return Vec::new();
    };
    let mut requests: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension().and_then(|ext| ext.to_str()) == Some("json")
                && !p
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with('.'))
        })
        .collect();
    requests.sort();
    requests
}

fn write_mock_reports(reports_dir: &Path) {
    let _ = fs::create_dir_all(reports_dir);
    let _ = fs::write(
        reports_dir.join("summary_health.txt"),
        "Design Health Summary\n=====================\nOverall Status: HEALTHY\nTotal Cells: 123456\nUtilization: 45.2%\n",
    );
    let _ = fs::write(
        reports_dir.join("timing_health.txt"),
        "Timing Health Report\n====================\nSetup WNS: 0.45 ns\nHold WNS: 0.12 ns\nCritical Path Count: 15\n",
    );
}

fn log_stdout(paths: &RunPaths, line: &str) {
    if let Ok(mut file) = fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(paths.tool_stdout_log_path())
    {
        let _ = writeln!(file, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AckStatus;
    use std::time::Instant;
    use tempfile::tempdir;

    fn prepared() -> (tempfile::TempDir, RunPaths) {
        let tmp = tempdir().expect("tempdir");
        let paths = RunPaths::new(tmp.path().join("run"));
        for dir in paths.required_directories() {
            fs::create_dir_all(dir).expect("dirs");
        }
        (tmp, paths)
    }

    fn launch(paths: &RunPaths, inject: InjectConfig) -> SessionHandle {
        PseudoLauncher::new(inject)
            .launch(paths, &BTreeMap::new(), &paths.scripts_dir().join("bootstrap.tcl"))
            .expect("launch")
    }

    fn submit_script(paths: &RunPaths, request_id: &str, name: &str, body: &str) {
        fs::write(paths.scripts_dir().join(name), body).expect("script");
        Request::new(request_id, "job1", &format!("scripts/{name}"), None)
            .store(&paths.queue_dir())
            .expect("request");
    }

    fn wait_for_ack(paths: &RunPaths, request_id: &str) -> Ack {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(ack) = Ack::try_load(&paths.ack_dir(), request_id).expect("load") {
                return ack;
            }
            assert!(Instant::now() < deadline, "timed out waiting for ack");
            thread::sleep(Duration::from_millis(20));
        }
    }

    fn stop(paths: &RunPaths, handle: &SessionHandle) {
        fs::write(paths.stop_path(), "test").expect("stop");
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.is_alive() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn processes_requests_in_filename_order() {
        let (_tmp, paths) = prepared();

        // Both requests are queued before the session comes up, so a single
        // drain pass observes them together.
        submit_script(&paths, "job1_0002_second", "second.tcl", "puts two\n");
        submit_script(&paths, "job1_0001_first", "restore_wrapper.tcl", "puts one\n");
        let handle = launch(&paths, InjectConfig::default());
        let first = wait_for_ack(&paths, "job1_0001_first");
        let second = wait_for_ack(&paths, "job1_0002_second");
        assert_eq!(first.status, AckStatus::Pass);
        assert_eq!(second.status, AckStatus::Pass);

        let log = fs::read_to_string(paths.tool_stdout_log_path()).expect("log");
        let first_at = log.find("job1_0001_first").expect("first logged");
        let second_at = log.find("job1_0002_second").expect("second logged");
        assert!(first_at < second_at, "filename order must be preserved");
        stop(&paths, &handle);
    }

    #[test]
    fn existing_ack_suppresses_re_execution() {
        let (_tmp, paths) = prepared();

        // Pre-place an ack, then deliver the request: it must be skipped.
        let mut ack = Ack::pass("job1_0001_restore", "job1", "already handled");
        ack.finish();
        ack.store(&paths.ack_dir()).expect("pre-ack");

        let handle = launch(&paths, InjectConfig::default());
        submit_script(&paths, "job1_0001_restore", "restore_wrapper.tcl", "puts hi\n");
        thread::sleep(Duration::from_millis(300));

        let loaded = wait_for_ack(&paths, "job1_0001_restore");
        assert_eq!(loaded.message, "already handled");
        stop(&paths, &handle);
    }

    #[test]
    fn escaping_script_path_is_a_security_violation() {
        let (_tmp, paths) = prepared();
        let handle = launch(&paths, InjectConfig::default());

        fs::write(paths.scripts_dir().join("ok.tcl"), "puts ok\n").expect("script");
        Request::new("job1_0001_evil", "job1", "scripts/../scripts/ok.tcl", None)
            .store(&paths.queue_dir())
            .expect("request");

        let ack = wait_for_ack(&paths, "job1_0001_evil");
        assert_eq!(ack.status, AckStatus::Fail);
        assert_eq!(ack.error_type, ErrorType::CmdFail);
        assert!(ack.message.contains("security violation"));
        stop(&paths, &handle);
    }

    #[test]
    fn restore_fail_injection_classifies_restore() {
        let (_tmp, paths) = prepared();
        let handle = launch(
            &paths,
            InjectConfig {
                restore_fail: true,
                ..InjectConfig::default()
            },
        );
        submit_script(&paths, "job1_0001_restore", "restore_wrapper.tcl", "cd /x\n");
        let ack = wait_for_ack(&paths, "job1_0001_restore");
        assert_eq!(ack.status, AckStatus::Fail);
        assert_eq!(ack.error_type, ErrorType::RestoreFail);
        stop(&paths, &handle);
    }

    #[test]
    fn skill_scripts_produce_reports_unless_suppressed() {
        let (_tmp, paths) = prepared();
        let handle = launch(&paths, InjectConfig::default());
        submit_script(&paths, "job1_0002_skill", "run_health.tcl", "report\n");
        wait_for_ack(&paths, "job1_0002_skill");
        assert!(paths.reports_dir().join("summary_health.txt").is_file());
        assert!(paths.reports_dir().join("timing_health.txt").is_file());
        stop(&paths, &handle);
    }

    #[test]
    fn inject_file_in_session_dir_overrides_constructor() {
        let (_tmp, paths) = prepared();
        fs::write(
            paths.session_dir().join(INJECT_FILE),
            r#"{"suppress_reports": true}"#,
        )
        .expect("inject");
        let handle = launch(&paths, InjectConfig::default());
        submit_script(&paths, "job1_0002_skill", "run_health.tcl", "report\n");
        wait_for_ack(&paths, "job1_0002_skill");
        assert!(!paths.reports_dir().join("summary_health.txt").exists());
        stop(&paths, &handle);
    }

    #[test]
    fn crash_injection_sets_nonzero_exit() {
        let (_tmp, paths) = prepared();
        let handle = launch(
            &paths,
            InjectConfig {
                crash_after_acks: Some(1),
                ..InjectConfig::default()
            },
        );
        submit_script(&paths, "job1_0001_restore", "restore_wrapper.tcl", "puts hi\n");
        wait_for_ack(&paths, "job1_0001_restore");

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.is_alive() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!handle.is_alive());
        assert_eq!(handle.exit_code(), Some(134));
    }
}
