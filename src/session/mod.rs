pub mod batch;
pub mod local;
pub mod pseudo;
pub mod supervisor;

use crate::protocol::{encode_pretty, load_record, ProtocolError, SCHEMA_VERSION};
use crate::rundir::RunPaths;
use crate::shared::{atomic_write_file, utc_timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub use batch::BatchLauncher;
pub use local::LocalLauncher;
pub use pseudo::{InjectConfig, PseudoLauncher};
pub use supervisor::{HealthWatcher, SessionFault, SessionHealth, SessionSupervisor};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to launch tool session: {reason}")]
    Spawn { reason: String },
    #[error("session not ready after {waited_s}s")]
    ReadyTimeout { waited_s: u64 },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub(crate) fn io_error(path: &Path, source: std::io::Error) -> SessionError {
    SessionError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Strategy for bringing up the tool process. Implementations must not leak
/// into the orchestrator or kernel; an in-memory double replaces the real
/// thing in tests without further code changes.
pub trait Launcher: Send + Sync {
    fn name(&self) -> &str;

    /// Start the tool for this run. `init_script` is the queue-processor
    /// bootstrap inside `scripts/`; stdout/stderr must end up in the session
    /// log files owned by the launched side.
    fn launch(
        &self,
        paths: &RunPaths,
        env: &BTreeMap<String, String>,
        init_script: &Path,
    ) -> Result<SessionHandle, SessionError>;
}

/// Live reference to one launched session. Cloneable so the health watcher
/// can observe the process while the orchestrator keeps driving it.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub pid: Option<u32>,
    kind: HandleKind,
}

#[derive(Debug, Clone)]
enum HandleKind {
    Process { child: Arc<Mutex<Child>> },
    InProcess {
        alive: Arc<AtomicBool>,
        exit_code: Arc<Mutex<Option<i32>>>,
    },
}

impl SessionHandle {
    pub(crate) fn for_process(child: Child) -> Self {
        Self {
            pid: Some(child.id()),
            kind: HandleKind::Process {
                child: Arc::new(Mutex::new(child)),
            },
        }
    }

    pub(crate) fn for_thread(alive: Arc<AtomicBool>, exit_code: Arc<Mutex<Option<i32>>>) -> Self {
        Self {
            pid: Some(std::process::id()),
            kind: HandleKind::InProcess { alive, exit_code },
        }
    }

    pub fn is_alive(&self) -> bool {
        match &self.kind {
            HandleKind::Process { child } => {
                let Ok(mut child) = child.lock() else {
                    return false;
                };
                matches!(child.try_wait(), Ok(None))
            }
            HandleKind::InProcess { alive, .. } => alive.load(Ordering::Relaxed),
        }
    }

    /// Exit code once the session has terminated; `None` while it runs or
    /// when the code is unobtainable.
    pub fn exit_code(&self) -> Option<i32> {
        match &self.kind {
            HandleKind::Process { child } => {
                let Ok(mut child) = child.lock() else {
                    return None;
                };
                match child.try_wait() {
                    Ok(Some(status)) => status.code(),
                    _ => None,
                }
            }
            HandleKind::InProcess { exit_code, .. } => {
                exit_code.lock().ok().and_then(|code| *code)
            }
        }
    }

    pub fn has_exited(&self) -> bool {
        !self.is_alive()
    }

    /// Forceful termination, used after the graceful stop window expires.
    pub fn terminate(&self) {
        match &self.kind {
            HandleKind::Process { child } => {
                if let Ok(mut child) = child.lock() {
                    let _ = child.kill();
                    let _ = child.wait();
                }
            }
            HandleKind::InProcess { alive, .. } => {
                alive.store(false, Ordering::Relaxed);
            }
        }
    }
}

/// Supervisor-owned session record (`session/state.json`); read-only for
/// everyone else once the supervisor finalizes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub schema_version: String,
    pub pid: Option<u32>,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_ts: Option<String>,
}

impl SessionState {
    pub fn new(pid: Option<u32>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            pid,
            started_at: utc_timestamp(),
            exit_code: None,
            last_heartbeat_ts: None,
        }
    }

    pub fn store(&self, paths: &RunPaths) -> Result<(), SessionError> {
        let path = paths.session_state_path();
        let body = encode_pretty(&path, self)?;
        atomic_write_file(&path, &body).map_err(|e| io_error(&path, e))
    }

    pub fn load(paths: &RunPaths) -> Result<Self, SessionError> {
        Ok(load_record(&paths.session_state_path())?)
    }
}

/// Resolve the configured launcher by its short name.
pub fn launcher_from_config(
    config: &crate::config::JobConfig,
) -> Result<Box<dyn Launcher>, SessionError> {
    match config.launcher.as_str() {
        crate::config::LAUNCHER_LOCAL => {
            Ok(Box::new(LocalLauncher::new(config.tool_command.clone())))
        }
        crate::config::LAUNCHER_BATCH => Ok(Box::new(BatchLauncher::new(
            config.tool_command.clone(),
            config.batch_command_template.clone().unwrap_or_default(),
        ))),
        crate::config::LAUNCHER_PSEUDO => Ok(Box::new(PseudoLauncher::default())),
        other => Err(SessionError::Spawn {
            reason: format!("unknown launcher `{other}`"),
        }),
    }
}
