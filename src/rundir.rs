use crate::protocol::{Manifest, ProtocolError, TimelineWriter};
use std::fs;
use std::path::{Path, PathBuf};

pub const RUNS_ROOT: &str = ".skillpilot/runs";

#[derive(Debug, thiserror::Error)]
pub enum RunDirError {
    #[error("failed to create run path {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("run directory for job `{job_id}` already exists")]
    AlreadyExists { job_id: String },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// All paths below one job's run directory. Every consumer goes through these
/// accessors; nothing else assembles run-relative paths by hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub root: PathBuf,
}

impl RunPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn for_job(cwd: &Path, job_id: &str) -> Self {
        Self::new(cwd.join(RUNS_ROOT).join(job_id))
    }

    pub fn job_id(&self) -> &str {
        self.root
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("")
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.root.join("scripts")
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.root.join("queue")
    }

    pub fn ack_dir(&self) -> PathBuf {
        self.root.join("ack")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    pub fn session_dir(&self) -> PathBuf {
        self.root.join("session")
    }

    pub fn debug_bundle_dir(&self) -> PathBuf {
        self.root.join("debug_bundle")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(crate::protocol::manifest::MANIFEST_FILE)
    }

    pub fn timeline_path(&self) -> PathBuf {
        self.root.join(crate::protocol::timeline::TIMELINE_FILE)
    }

    pub fn heartbeat_path(&self) -> PathBuf {
        self.session_dir().join("heartbeat")
    }

    pub fn session_state_path(&self) -> PathBuf {
        self.session_dir().join("state.json")
    }

    pub fn ready_path(&self) -> PathBuf {
        self.session_dir().join("ready")
    }

    pub fn stop_path(&self) -> PathBuf {
        self.session_dir().join("stop")
    }

    pub fn supervisor_log_path(&self) -> PathBuf {
        self.session_dir().join("supervisor.log")
    }

    pub fn tool_stdout_log_path(&self) -> PathBuf {
        self.session_dir().join("innovus.stdout.log")
    }

    pub fn tool_stderr_log_path(&self) -> PathBuf {
        self.session_dir().join("innovus.stderr.log")
    }

    pub fn required_directories(&self) -> Vec<PathBuf> {
        vec![
            self.scripts_dir(),
            self.queue_dir(),
            self.ack_dir(),
            self.reports_dir(),
            self.session_dir(),
        ]
    }
}

/// Create the run directory tree exactly once, write the `RUNNING` manifest
/// stub and the opening timeline event. A second job with the same id is
/// refused rather than merged.
pub fn create_run_dir(
    cwd: &Path,
    job_id: &str,
    launcher: &str,
) -> Result<(RunPaths, Manifest, TimelineWriter), RunDirError> {
    let runs_root = cwd.join(RUNS_ROOT);
    fs::create_dir_all(&runs_root).map_err(|source| RunDirError::CreateDir {
        path: runs_root.display().to_string(),
        source,
    })?;

    let paths = RunPaths::for_job(cwd, job_id);
    match fs::create_dir(&paths.root) {
        Ok(()) => {}
        Err(source) if source.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(RunDirError::AlreadyExists {
                job_id: job_id.to_string(),
            })
        }
        Err(source) => {
            return Err(RunDirError::CreateDir {
                path: paths.root.display().to_string(),
                source,
            })
        }
    }
    for dir in paths.required_directories() {
        fs::create_dir_all(&dir).map_err(|source| RunDirError::CreateDir {
            path: dir.display().to_string(),
            source,
        })?;
    }

    let manifest = Manifest::new(job_id, cwd, &paths.root, launcher);
    manifest.store(&paths.root)?;

    let mut timeline = TimelineWriter::open(&paths.root, job_id)?;
    timeline.state_enter("INIT")?;

    Ok((paths, manifest, timeline))
}
