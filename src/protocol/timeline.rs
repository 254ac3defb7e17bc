use super::{ErrorType, ProtocolError, SCHEMA_VERSION};
use crate::shared::utc_timestamp;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub const TIMELINE_FILE: &str = "job_timeline.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    StateEnter,
    StateExit,
    Action,
    Done,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub schema_version: String,
    pub ts: String,
    pub job_id: String,
    pub level: EventLevel,
    pub event: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Event {
    fn new(job_id: &str, level: EventLevel, event: EventKind) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            ts: utc_timestamp(),
            job_id: job_id.to_string(),
            level,
            event,
            state: None,
            message: None,
            data: None,
        }
    }
}

/// Append-only audit log for one job. The writer owns the file handle for the
/// job's lifetime; there is exactly one writer per job, so no cross-process
/// locking is needed.
#[derive(Debug)]
pub struct TimelineWriter {
    job_id: String,
    path: PathBuf,
    file: fs::File,
}

impl TimelineWriter {
    pub fn open(run_dir: &Path, job_id: &str) -> Result<Self, ProtocolError> {
        let path = run_dir.join(TIMELINE_FILE);
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ProtocolError::io(&path, e))?;
        Ok(Self {
            job_id: job_id.to_string(),
            path,
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, event: &Event) -> Result<(), ProtocolError> {
        let line = serde_json::to_string(event).map_err(|e| ProtocolError::json(&self.path, e))?;
        writeln!(self.file, "{line}").map_err(|e| ProtocolError::io(&self.path, e))
    }

    pub fn state_enter(&mut self, state: &str) -> Result<(), ProtocolError> {
        let mut event = Event::new(&self.job_id, EventLevel::Info, EventKind::StateEnter);
        event.state = Some(state.to_string());
        self.append(&event)
    }

    pub fn state_exit(&mut self, state: &str) -> Result<(), ProtocolError> {
        let mut event = Event::new(&self.job_id, EventLevel::Info, EventKind::StateExit);
        event.state = Some(state.to_string());
        self.append(&event)
    }

    pub fn action(
        &mut self,
        action: &str,
        message: &str,
        data: Option<serde_json::Value>,
    ) -> Result<(), ProtocolError> {
        let mut event = Event::new(&self.job_id, EventLevel::Info, EventKind::Action);
        if !message.is_empty() {
            event.message = Some(message.to_string());
        }
        let mut body = serde_json::Map::new();
        body.insert(
            "action".to_string(),
            serde_json::Value::String(action.to_string()),
        );
        if let Some(serde_json::Value::Object(extra)) = data {
            body.extend(extra);
        }
        event.data = Some(serde_json::Value::Object(body));
        self.append(&event)
    }

    pub fn done(&mut self, message: &str) -> Result<(), ProtocolError> {
        let mut event = Event::new(&self.job_id, EventLevel::Info, EventKind::Done);
        if !message.is_empty() {
            event.message = Some(message.to_string());
        }
        self.append(&event)
    }

    pub fn fail(
        &mut self,
        error_type: ErrorType,
        message: &str,
        data: Option<serde_json::Value>,
    ) -> Result<(), ProtocolError> {
        let mut event = Event::new(&self.job_id, EventLevel::Error, EventKind::Fail);
        if !message.is_empty() {
            event.message = Some(message.to_string());
        }
        let mut body = serde_json::Map::new();
        body.insert(
            "error_type".to_string(),
            serde_json::Value::String(error_type.to_string()),
        );
        if let Some(serde_json::Value::Object(extra)) = data {
            body.extend(extra);
        }
        event.data = Some(serde_json::Value::Object(body));
        self.append(&event)
    }
}

/// Read every event line; used by the bundler and by tests asserting on the
/// audit trail.
pub fn read_events(path: &Path) -> Result<Vec<Event>, ProtocolError> {
    let file = fs::File::open(path).map_err(|e| ProtocolError::io(path, e))?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| ProtocolError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        events.push(serde_json::from_str(&line).map_err(|e| ProtocolError::json(path, e))?);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn timeline_appends_complete_json_lines() {
        let tmp = tempdir().expect("tempdir");
        let mut writer = TimelineWriter::open(tmp.path(), "job1").expect("open");
        writer.state_enter("INIT").expect("enter");
        writer
            .action("locate_db", "scanning for top.enc", None)
            .expect("action");
        writer.state_exit("INIT").expect("exit");
        writer.done("").expect("done");

        let events = read_events(&tmp.path().join(TIMELINE_FILE)).expect("read");
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].event, EventKind::StateEnter);
        assert_eq!(events[0].state.as_deref(), Some("INIT"));
        assert_eq!(events[1].event, EventKind::Action);
        assert_eq!(
            events[1]
                .data
                .as_ref()
                .and_then(|d| d.get("action"))
                .and_then(|v| v.as_str()),
            Some("locate_db")
        );
        assert_eq!(events[3].event, EventKind::Done);
    }

    #[test]
    fn fail_event_carries_error_type_at_error_level() {
        let tmp = tempdir().expect("tempdir");
        let mut writer = TimelineWriter::open(tmp.path(), "job1").expect("open");
        writer
            .fail(ErrorType::RestoreFail, "descriptor raised", None)
            .expect("fail");

        let events = read_events(&tmp.path().join(TIMELINE_FILE)).expect("read");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, EventLevel::Error);
        assert_eq!(events[0].event, EventKind::Fail);
        assert_eq!(
            events[0]
                .data
                .as_ref()
                .and_then(|d| d.get("error_type"))
                .and_then(|v| v.as_str()),
            Some("RESTORE_FAIL")
        );
    }

    #[test]
    fn reopening_appends_rather_than_truncates() {
        let tmp = tempdir().expect("tempdir");
        {
            let mut writer = TimelineWriter::open(tmp.path(), "job1").expect("open");
            writer.state_enter("LOCATE_DB").expect("enter");
        }
        {
            let mut writer = TimelineWriter::open(tmp.path(), "job1").expect("reopen");
            writer.state_exit("LOCATE_DB").expect("exit");
        }
        let events = read_events(&tmp.path().join(TIMELINE_FILE)).expect("read");
        assert_eq!(events.len(), 2);
    }
}
