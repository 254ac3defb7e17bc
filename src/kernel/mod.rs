pub mod scripts;

use crate::contract::Contract;
use crate::protocol::{Ack, ProtocolError, Request, TimelineWriter};
use crate::rundir::RunPaths;
use crate::session::supervisor::{HealthWatcher, SessionFault};
use crate::shared::{atomic_write_file, new_request_id};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

pub use scripts::{VariableSurface, BOOTSTRAP_SCRIPT, RESTORE_WRAPPER_SCRIPT};

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("kernel io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("no ack for request {request_id} within {waited_s}s")]
    AckTimeout { request_id: String, waited_s: u64 },
    #[error("session fault while waiting for request {request_id}")]
    SessionFault {
        request_id: String,
        fault: SessionFault,
    },
    #[error("skill package error: {reason}")]
    Skill { reason: String },
}

fn io_error(path: &Path, source: std::io::Error) -> KernelError {
    KernelError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Renders scripts into `scripts/`, submits requests into `queue/` and waits
/// for their acks. Owns the per-job request sequence; never retries a
/// request.
pub struct ExecutionKernel {
    paths: RunPaths,
    job_id: String,
    seq: u64,
}

impl ExecutionKernel {
    pub fn new(paths: RunPaths) -> Self {
        let job_id = paths.job_id().to_string();
        Self {
            paths,
            job_id,
            seq: 0,
        }
    }

    /// Queue-processor bootstrap, handed to the launcher as the tool's init
    /// script.
    pub fn write_bootstrap(&self, surface: &VariableSurface) -> Result<PathBuf, KernelError> {
        self.render_script(BOOTSTRAP_SCRIPT, surface, scripts::BOOTSTRAP_BODY)
    }

    pub fn write_restore_wrapper(
        &self,
        surface: &VariableSurface,
    ) -> Result<PathBuf, KernelError> {
        self.render_script(RESTORE_WRAPPER_SCRIPT, surface, scripts::RESTORE_WRAPPER_BODY)
    }

    /// Render the Skill's entry script: variable prelude plus the body from
    /// the Skill package. Returns the run-relative script path to submit.
    pub fn write_skill_entry(
        &self,
        skill_dir: &Path,
        contract: &Contract,
        surface: &VariableSurface,
    ) -> Result<String, KernelError> {
        let entry = contract.entry_script().ok_or_else(|| KernelError::Skill {
            reason: format!("skill `{}` declares no scripts", contract.name),
        })?;
        let entry_path = skill_dir.join(&entry.entry);
        let body = fs::read_to_string(&entry_path).map_err(|e| io_error(&entry_path, e))?;

        let script_name = format!("run_{}.tcl", contract.name);
        self.render_script(&script_name, surface, &body)?;
        Ok(format!("scripts/{script_name}"))
    }

    fn render_script(
        &self,
        name: &str,
        surface: &VariableSurface,
        body: &str,
    ) -> Result<PathBuf, KernelError> {
        let path = self.paths.scripts_dir().join(name);
        let content = format!("{}{body}", surface.render_prelude());
        atomic_write_file(&path, content.as_bytes()).map_err(|e| io_error(&path, e))?;
        Ok(path)
    }

    /// Write the next request into `queue/` and record the submission on the
    /// timeline. Request ids embed a monotonic sequence so the queue
    /// processor's filename order equals submission order.
    pub fn submit(
        &mut self,
        script: &str,
        timeout_s: u64,
        tag: &str,
        timeline: &mut TimelineWriter,
    ) -> Result<String, KernelError> {
        self.seq += 1;
        let request_id = new_request_id(&self.job_id, self.seq, tag);
        let request = Request::new(&request_id, &self.job_id, script, Some(timeout_s));
        request.store(&self.paths.queue_dir())?;
        timeline.action(
            "submit_request",
            script,
            Some(serde_json::json!({ "request_id": request_id })),
        )?;
        Ok(request_id)
    }

    /// Poll for the ack up to `timeout_s`, observing the health watcher's
    /// fault flag between polls so a dead session aborts the wait early.
    pub fn wait_for_ack(
        &self,
        request_id: &str,
        timeout_s: u64,
        poll_interval: Duration,
        watcher: &HealthWatcher,
        timeline: &mut TimelineWriter,
    ) -> Result<Ack, KernelError> {
        let deadline = Instant::now() + Duration::from_secs(timeout_s);
        loop {
            if let Some(ack) = Ack::try_load(&self.paths.ack_dir(), request_id)? {
                timeline.action(
                    "receive_ack",
                    &ack.message,
                    Some(serde_json::json!({
                        "request_id": request_id,
                        "status": ack.status,
                        "error_type": ack.error_type,
                    })),
                )?;
                return Ok(ack);
            }
            if let Some(fault) = watcher.fault() {
                return Err(KernelError::SessionFault {
                    request_id: request_id.to_string(),
                    fault,
                });
            }
            if Instant::now() >= deadline {
                return Err(KernelError::AckTimeout {
                    request_id: request_id.to_string(),
                    waited_s: timeout_s,
                });
            }
            thread::sleep(poll_interval);
        }
    }
}
