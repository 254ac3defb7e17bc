use super::{io_error, Launcher, SessionError, SessionHandle, SessionState};
use crate::config::JobConfig;
use crate::protocol::ErrorType;
use crate::rundir::RunPaths;
use crate::shared::clock::file_age_secs;
use crate::shared::utc_timestamp;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionHealth {
    Alive,
    HeartbeatLost { age_s: f64 },
    Crashed { exit_code: Option<i32> },
    /// Clean exit after a requested stop.
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFault {
    HeartbeatLost,
    Crashed,
}

impl SessionFault {
    pub fn error_type(self) -> ErrorType {
        match self {
            SessionFault::HeartbeatLost => ErrorType::HeartbeatLost,
            SessionFault::Crashed => ErrorType::InnovusCrash,
        }
    }
}

/// Starts, watches and reaps one tool session through a pluggable
/// [`Launcher`]. Owns `session/state.json`, `session/supervisor.log` and the
/// `session/ready` marker; the in-session queue processor owns the heartbeat
/// and the tool logs.
pub struct SessionSupervisor {
    launcher: Box<dyn Launcher>,
    heartbeat_timeout_s: u64,
    ready_timeout_s: u64,
    grace_period_s: u64,
}

impl SessionSupervisor {
    pub fn new(launcher: Box<dyn Launcher>, config: &JobConfig) -> Self {
        Self {
            launcher,
            heartbeat_timeout_s: config.heartbeat_timeout_s,
            ready_timeout_s: config.ready_timeout_s,
            grace_period_s: config.session_grace_period_s,
        }
    }

    pub fn launcher_name(&self) -> &str {
        self.launcher.name()
    }

    pub fn start(
        &self,
        paths: &RunPaths,
        env: &BTreeMap<String, String>,
        init_script: &Path,
    ) -> Result<SessionHandle, SessionError> {
        let session_dir = paths.session_dir();
        fs::create_dir_all(&session_dir).map_err(|e| io_error(&session_dir, e))?;
        self.log(
            paths,
            "info",
            "session.start",
            &format!("launcher={}", self.launcher.name()),
        );

        let handle = self.launcher.launch(paths, env, init_script)?;
        SessionState::new(handle.pid).store(paths)?;
        self.log(
            paths,
            "info",
            "session.launched",
            &format!("pid={}", handle.pid.unwrap_or(0)),
        );
        Ok(handle)
    }

    /// Block until the session signals readiness: either the `ready` marker
    /// exists or the first heartbeat lands. On heartbeat-first readiness the
    /// supervisor latches the marker itself.
    pub fn wait_ready(&self, paths: &RunPaths, handle: &SessionHandle) -> Result<(), SessionError> {
        let deadline = Instant::now() + Duration::from_secs(self.ready_timeout_s);
        loop {
            if paths.ready_path().exists() {
                return Ok(());
            }
            if paths.heartbeat_path().exists() {
                let _ = fs::write(paths.ready_path(), b"ready");
                self.log(paths, "info", "session.ready", "first heartbeat observed");
                return Ok(());
            }
            if handle.has_exited() {
                self.log(paths, "error", "session.start.failed", "tool exited before ready");
                return Err(SessionError::Spawn {
                    reason: "tool exited before becoming ready".to_string(),
                });
            }
            if Instant::now() >= deadline {
                self.log(paths, "error", "session.start.timeout", "ready wait expired");
                return Err(SessionError::ReadyTimeout {
                    waited_s: self.ready_timeout_s,
                });
            }
            thread::sleep(Duration::from_millis(100));
        }
    }

    /// Combine process liveness, recorded exit code and heartbeat age into a
    /// single health verdict. Heartbeat age exactly at the threshold still
    /// counts as alive; only strictly past it is a loss.
    pub fn poll_health(&self, paths: &RunPaths, handle: &SessionHandle) -> SessionHealth {
        let stop_requested = paths.stop_path().exists();
        if let Some(code) = handle.exit_code() {
            if code == 0 && stop_requested {
                return SessionHealth::Exited;
            }
            return SessionHealth::Crashed {
                exit_code: Some(code),
            };
        }
        if handle.has_exited() {
            if stop_requested {
                return SessionHealth::Exited;
            }
            return SessionHealth::Crashed { exit_code: None };
        }

        let threshold = self.heartbeat_timeout_s as f64;
        match file_age_secs(&paths.heartbeat_path()) {
            Some(age) if age > threshold => SessionHealth::HeartbeatLost { age_s: age },
            Some(_) => SessionHealth::Alive,
            // No heartbeat yet: measure from session start instead.
            None => match file_age_secs(&paths.session_state_path()) {
                Some(age) if age > threshold => SessionHealth::HeartbeatLost { age_s: age },
                _ => SessionHealth::Alive,
            },
        }
    }

    /// Graceful stop: drop the `stop` marker, give the session a grace
    /// period to exit on its own, then terminate. Finalizes `state.json`.
    pub fn stop(&self, paths: &RunPaths, handle: &SessionHandle, reason: &str) {
        let stop_reason = if reason.is_empty() {
            "stopped_by_supervisor"
        } else {
            reason
        };
        let _ = fs::write(paths.stop_path(), stop_reason.as_bytes());
        self.log(paths, "info", "session.stop.requested", stop_reason);

        let deadline = Instant::now() + Duration::from_secs(self.grace_period_s);
        while handle.is_alive() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(100));
        }
        if handle.is_alive() {
            self.log(paths, "warn", "session.stop.forced", "grace period expired");
            handle.terminate();
        }

        self.finalize_state(paths, handle);
        self.log(paths, "info", "session.stopped", "");
    }

    fn finalize_state(&self, paths: &RunPaths, handle: &SessionHandle) {
        let mut state = SessionState::load(paths).unwrap_or_else(|_| SessionState::new(handle.pid));
        state.exit_code = handle.exit_code().or(Some(0));
        if paths.heartbeat_path().exists() {
            state.last_heartbeat_ts = Some(utc_timestamp());
        }
        let _ = state.store(paths);
    }

    /// One JSON line per supervisor event, serialized the same way the
    /// timeline serializes its records. Best effort; logging never fails the
    /// job.
    fn log(&self, paths: &RunPaths, level: &str, event: &str, message: &str) {
        let record = SupervisorLogLine {
            ts: utc_timestamp(),
            level,
            event,
            message,
        };
        let Ok(body) = serde_json::to_string(&record) else {
            return;
        };
        if let Ok(mut file) = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(paths.supervisor_log_path())
        {
            let _ = writeln!(file, "{body}");
        }
    }
}

#[derive(Serialize)]
struct SupervisorLogLine<'a> {
    ts: String,
    level: &'a str,
    event: &'a str,
    message: &'a str,
}

/// Background poller that trips a shared fault flag the moment the session
/// crashes or its heartbeat goes stale. Waiters observe the flag through
/// [`HealthWatcher::fault`] and abandon their ack wait.
pub struct HealthWatcher {
    fault: Arc<Mutex<Option<SessionFault>>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl HealthWatcher {
    pub fn spawn(
        supervisor: Arc<SessionSupervisor>,
        paths: RunPaths,
        handle: SessionHandle,
        interval: Duration,
    ) -> Self {
        let fault = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));
        let fault_slot = fault.clone();
        let stop_flag = stop.clone();

        let thread = thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                match supervisor.poll_health(&paths, &handle) {
                    SessionHealth::Alive => {}
                    SessionHealth::HeartbeatLost { age_s } => {
                        supervisor.log(
                            &paths,
                            "error",
                            "session.heartbeat.lost",
                            &format!("age_s={age_s:.1}"),
                        );
                        if let Ok(mut slot) = fault_slot.lock() {
                            *slot = Some(SessionFault::HeartbeatLost);
                        }
                        return;
                    }
                    SessionHealth::Crashed { exit_code } => {
                        supervisor.log(
                            &paths,
                            "error",
                            "session.crashed",
                            &format!("exit_code={exit_code:?}"),
                        );
                        if let Ok(mut slot) = fault_slot.lock() {
                            *slot = Some(SessionFault::Crashed);
                        }
                        return;
                    }
                    SessionHealth::Exited => return,
                }
                thread::sleep(interval);
            }
        });

        Self {
            fault,
            stop,
            thread: Some(thread),
        }
    }

    /// Watcher that never reports a fault; used before a session exists.
    pub fn idle() -> Self {
        Self {
            fault: Arc::new(Mutex::new(None)),
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn fault(&self) -> Option<SessionFault> {
        self.fault.lock().ok().and_then(|slot| *slot)
    }

    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for HealthWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
