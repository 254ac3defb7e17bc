use super::{encode_pretty, load_record, ProtocolError, SCHEMA_VERSION};
use crate::shared::fs_atomic::atomic_write_new;
use crate::shared::utc_timestamp;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};

/// The single request action: source a Tcl script inside the tool session.
/// Kept as a constant on an open enumeration so the file layout survives
/// future actions.
pub const ACTION_SOURCE_TCL: &str = "SOURCE_TCL";

pub const SCRIPTS_DIR: &str = "scripts";

/// Work order dropped into `queue/`. Write-once: re-submitting an id is a
/// caller bug and is refused at the filesystem level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub schema_version: String,
    pub request_id: String,
    pub job_id: String,
    pub action: String,
    pub script: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<u64>,
    pub created_at: String,
}

impl Request {
    pub fn new(request_id: &str, job_id: &str, script: &str, timeout_s: Option<u64>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            request_id: request_id.to_string(),
            job_id: job_id.to_string(),
            action: ACTION_SOURCE_TCL.to_string(),
            script: script.to_string(),
            timeout_s,
            created_at: utc_timestamp(),
        }
    }

    pub fn store(&self, queue_dir: &Path) -> Result<PathBuf, ProtocolError> {
        let path = queue_dir.join(format!("{}.json", self.request_id));
        let body = encode_pretty(&path, self)?;
        atomic_write_new(&path, &body).map_err(|e| ProtocolError::io(&path, e))?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self, ProtocolError> {
        load_record(path)
    }
}

/// Validate a request's script path against the sandbox rules shared by the
/// controller and the in-session queue processor:
/// relative, rooted at `scripts/`, no `.` / `..` segments, and the resolved
/// real path must stay under `<run_dir>/scripts/`. Returns the absolute
/// script path on success, the violation text on failure.
pub fn validate_script_path(run_dir: &Path, script: &str) -> Result<PathBuf, String> {
    if script.is_empty() {
        return Err("script path is empty".to_string());
    }
    let relative = Path::new(script);
    if relative.is_absolute() {
        return Err(format!("script path `{script}` must be relative"));
    }
    for component in relative.components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir | Component::ParentDir => {
                return Err(format!(
                    "script path `{script}` must not contain `.` or `..` segments"
                ))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("script path `{script}` must be relative"))
            }
        }
    }
    let mut components = relative.components();
    if components.next() != Some(Component::Normal(SCRIPTS_DIR.as_ref())) {
        return Err(format!("script path `{script}` must start with `scripts/`"));
    }
    if components.next().is_none() {
        return Err(format!("script path `{script}` names no file"));
    }

    let scripts_root = fs::canonicalize(run_dir.join(SCRIPTS_DIR))
        .map_err(|e| format!("scripts directory unavailable: {e}"))?;
    let resolved = fs::canonicalize(run_dir.join(relative))
        .map_err(|e| format!("script `{script}` cannot be resolved: {e}"))?;
    if !resolved.starts_with(&scripts_root) {
        return Err(format!(
            "script `{script}` resolves outside the scripts directory"
        ));
    }
    Ok(resolved)
}
