use super::{encode_pretty, load_record, ErrorType, ProtocolError, SCHEMA_VERSION};
use crate::shared::fs_atomic::atomic_write_new;
use crate::shared::utc_timestamp;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AckStatus {
    Pass,
    Fail,
}

/// Outcome record written by the queue processor, one per request id.
/// Appears in `ack/` strictly after its request; write-once and atomic so
/// the waiting controller never sees a partial file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub schema_version: String,
    pub request_id: String,
    pub job_id: String,
    pub status: AckStatus,
    pub error_type: ErrorType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence_paths: Vec<String>,
}

impl Ack {
    pub fn pass(request_id: &str, job_id: &str, message: &str) -> Self {
        Self::build(request_id, job_id, AckStatus::Pass, ErrorType::Ok, message)
    }

    pub fn fail(request_id: &str, job_id: &str, error_type: ErrorType, message: &str) -> Self {
        Self::build(request_id, job_id, AckStatus::Fail, error_type, message)
    }

    fn build(
        request_id: &str,
        job_id: &str,
        status: AckStatus,
        error_type: ErrorType,
        message: &str,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            request_id: request_id.to_string(),
            job_id: job_id.to_string(),
            status,
            error_type,
            message: message.to_string(),
            started_at: Some(utc_timestamp()),
            finished_at: None,
            duration_ms: None,
            evidence_paths: Vec::new(),
        }
    }

    pub fn finish(&mut self) {
        let finished = utc_timestamp();
        if let Some(started) = self
            .started_at
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        {
            if let Ok(end) = chrono::DateTime::parse_from_rfc3339(&finished) {
                let elapsed = end.signed_duration_since(started).num_milliseconds();
                self.duration_ms = Some(elapsed.max(0) as u64);
            }
        }
        self.finished_at = Some(finished);
    }

    pub fn with_evidence(mut self, paths: Vec<String>) -> Self {
        self.evidence_paths = paths;
        self
    }

    pub fn store(&self, ack_dir: &Path) -> Result<PathBuf, ProtocolError> {
        let path = ack_dir.join(format!("{}.json", self.request_id));
        let body = encode_pretty(&path, self)?;
        atomic_write_new(&path, &body).map_err(|e| ProtocolError::io(&path, e))?;
        Ok(path)
    }

    pub fn path_for(ack_dir: &Path, request_id: &str) -> PathBuf {
        ack_dir.join(format!("{request_id}.json"))
    }

    /// `Ok(None)` while the queue processor has not answered yet.
    pub fn try_load(ack_dir: &Path, request_id: &str) -> Result<Option<Self>, ProtocolError> {
        let path = Self::path_for(ack_dir, request_id);
        if !path.exists() {
            return Ok(None);
        }
        load_record(&path).map(Some)
    }
}
