pub mod ack;
pub mod manifest;
pub mod request;
pub mod summary;
pub mod timeline;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub use ack::{Ack, AckStatus};
pub use manifest::{Candidate, LocatorMode, Manifest};
pub use request::{Request, ACTION_SOURCE_TCL};
pub use summary::Summary;
pub use timeline::{Event, EventKind, EventLevel, TimelineWriter};

pub const SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("protocol io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid record in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported schema_version `{found}` in {path}")]
    SchemaVersion { path: String, found: String },
    #[error("record {path} already exists")]
    AlreadyExists { path: String },
}

impl ProtocolError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::AlreadyExists {
            return ProtocolError::AlreadyExists {
                path: path.display().to_string(),
            };
        }
        ProtocolError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub(crate) fn json(path: &Path, source: serde_json::Error) -> Self {
        ProtocolError::Json {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Terminal job status as persisted in the manifest and summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Running,
    Pass,
    Fail,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Pass => write!(f, "PASS"),
            JobStatus::Fail => write!(f, "FAIL"),
        }
    }
}

/// Closed failure taxonomy. A failed job carries exactly one value; when
/// several could apply, [`ErrorType::dominant`] picks by fixed priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    Ok,
    LocatorFail,
    SessionStartFail,
    InnovusCrash,
    HeartbeatLost,
    QueueTimeout,
    RestoreFail,
    CmdFail,
    ContractInvalid,
    OutputMissing,
    OutputEmpty,
    InternalError,
}

impl ErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorType::Ok => "OK",
            ErrorType::LocatorFail => "LOCATOR_FAIL",
            ErrorType::SessionStartFail => "SESSION_START_FAIL",
            ErrorType::InnovusCrash => "INNOVUS_CRASH",
            ErrorType::HeartbeatLost => "HEARTBEAT_LOST",
            ErrorType::QueueTimeout => "QUEUE_TIMEOUT",
            ErrorType::RestoreFail => "RESTORE_FAIL",
            ErrorType::CmdFail => "CMD_FAIL",
            ErrorType::ContractInvalid => "CONTRACT_INVALID",
            ErrorType::OutputMissing => "OUTPUT_MISSING",
            ErrorType::OutputEmpty => "OUTPUT_EMPTY",
            ErrorType::InternalError => "INTERNAL_ERROR",
        }
    }

    fn rank(self) -> u8 {
        match self {
            ErrorType::ContractInvalid => 0,
            ErrorType::LocatorFail => 1,
            ErrorType::SessionStartFail => 2,
            ErrorType::InnovusCrash => 3,
            ErrorType::HeartbeatLost => 4,
            ErrorType::QueueTimeout => 5,
            ErrorType::RestoreFail => 6,
            ErrorType::CmdFail => 7,
            ErrorType::OutputMissing => 8,
            ErrorType::OutputEmpty => 9,
            ErrorType::InternalError => 10,
            ErrorType::Ok => u8::MAX,
        }
    }

    /// Of two candidate classifications, return the one that wins under the
    /// fixed priority order. `OK` never wins over a failure.
    pub fn dominant(a: ErrorType, b: ErrorType) -> ErrorType {
        if a.rank() <= b.rank() {
            a
        } else {
            b
        }
    }

    pub fn is_failure(self) -> bool {
        self != ErrorType::Ok
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a JSON record, verifying its `schema_version` before the typed
/// decode. Unknown versions are surfaced, never migrated.
pub fn load_record<T: DeserializeOwned>(path: &Path) -> Result<T, ProtocolError> {
    let raw = fs::read_to_string(path).map_err(|e| ProtocolError::io(path, e))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| ProtocolError::json(path, e))?;
    let found = value
        .get("schema_version")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    if found != SCHEMA_VERSION {
        return Err(ProtocolError::SchemaVersion {
            path: path.display().to_string(),
            found,
        });
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::json(path, e))
}

pub(crate) fn encode_pretty<T: serde::Serialize>(
    path: &Path,
    record: &T,
) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec_pretty(record).map_err(|e| ProtocolError::json(path, e))
}
