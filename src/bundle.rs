use crate::contract::{Contract, OutputCheck};
use crate::protocol::{ErrorType, ProtocolError, SCHEMA_VERSION};
use crate::rundir::RunPaths;
use crate::shared::{atomic_write_file, tail_lines, utc_timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

pub const BUNDLE_INDEX_FILE: &str = "index.json";

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("bundle io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

fn io_error(path: &Path, source: std::io::Error) -> BundleError {
    BundleError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Catalog of everything the bundle contains. Pointer values are relative to
/// the bundle directory and always resolve to files that exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleIndex {
    pub schema_version: String,
    pub job_id: String,
    pub error_type: ErrorType,
    pub summary: String,
    pub generated_at: String,
    pub pointers: BTreeMap<String, String>,
    pub next_actions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub path: String,
    pub size: u64,
    pub mtime: i64,
}

/// Optional evidence the orchestrator can hand over; every field may be
/// absent and the bundler degrades to whatever is actually on disk.
#[derive(Default)]
pub struct BundleInputs<'a> {
    pub last_fail_ack_id: Option<&'a str>,
    pub contract_path: Option<&'a Path>,
    pub contract: Option<&'a Contract>,
    pub output_checks: Option<&'a [OutputCheck]>,
}

/// Assemble `debug_bundle/` for a failed job: manifest and timeline copies,
/// the last failing ack, bounded session log tails, a reports inventory, the
/// contract, and a suggested-next-actions list. The bundle alone must be
/// enough for off-site diagnosis.
pub fn write_debug_bundle(
    paths: &RunPaths,
    error_type: ErrorType,
    summary: &str,
    inputs: &BundleInputs<'_>,
    tail_limit: usize,
) -> Result<PathBuf, BundleError> {
    let bundle_dir = paths.debug_bundle_dir();
    fs::create_dir_all(&bundle_dir).map_err(|e| io_error(&bundle_dir, e))?;

    let mut pointers = BTreeMap::new();

    if copy_if_exists(&paths.manifest_path(), &bundle_dir.join("job_manifest.json")) {
        pointers.insert("manifest".to_string(), "job_manifest.json".to_string());
    }

    // Timeline tail; the FAIL event sits at the end, so a tail always covers
    // it and its neighborhood.
    if paths.timeline_path().exists() {
        if let Ok(lines) = tail_lines(&paths.timeline_path(), tail_limit) {
            let body = format!("{}\n", lines.join("\n"));
            let dst = bundle_dir.join("job_timeline.jsonl");
            if atomic_write_file(&dst, body.as_bytes()).is_ok() {
                pointers.insert("timeline".to_string(), "job_timeline.jsonl".to_string());
            }
        }
    }

    if let Some(request_id) = inputs.last_fail_ack_id {
        let src = paths.ack_dir().join(format!("{request_id}.json"));
        let dst_dir = bundle_dir.join("ack");
        if src.exists() && fs::create_dir_all(&dst_dir).is_ok() {
            let dst = dst_dir.join(format!("{request_id}.json"));
            if copy_if_exists(&src, &dst) {
                pointers.insert(
                    "last_fail_ack".to_string(),
                    format!("ack/{request_id}.json"),
                );
            }
        }
    }

    if paths.session_dir().is_dir() {
        let session_bundle = bundle_dir.join("session");
        if fs::create_dir_all(&session_bundle).is_ok() {
            let mut copied_any =
                copy_if_exists(&paths.session_state_path(), &session_bundle.join("state.json"));
            for log in [
                paths.supervisor_log_path(),
                paths.tool_stdout_log_path(),
                paths.tool_stderr_log_path(),
            ] {
                copied_any |= write_tail(&log, &session_bundle, tail_limit);
            }
            if copied_any {
                pointers.insert("session_logs".to_string(), "session/".to_string());
            }
        }
    }

    if paths.reports_dir().is_dir() {
        let inventory = reports_inventory(&paths.reports_dir());
        let dst = bundle_dir.join("reports_inventory.json");
        if let Ok(body) = serde_json::to_vec_pretty(&inventory) {
            if atomic_write_file(&dst, &body).is_ok() {
                pointers.insert(
                    "reports_inventory".to_string(),
                    "reports_inventory.json".to_string(),
                );
            }
        }
    }

    if let Some(checks) = inputs.output_checks {
        let dst = bundle_dir.join("validation_results.json");
        if let Ok(body) = serde_json::to_vec_pretty(checks) {
            if atomic_write_file(&dst, &body).is_ok() {
                pointers.insert(
                    "validation_results".to_string(),
                    "validation_results.json".to_string(),
                );
            }
        }
    }

    if let Some(contract_path) = inputs.contract_path {
        if copy_if_exists(contract_path, &bundle_dir.join("contract.yaml")) {
            pointers.insert("contract".to_string(), "contract.yaml".to_string());
        }
    }

    let index = BundleIndex {
        schema_version: SCHEMA_VERSION.to_string(),
        job_id: paths.job_id().to_string(),
        error_type,
        summary: summary.to_string(),
        generated_at: utc_timestamp(),
        pointers,
        next_actions: next_actions(error_type, inputs.contract),
    };
    let index_path = bundle_dir.join(BUNDLE_INDEX_FILE);
    let body = serde_json::to_vec_pretty(&index)
        .map_err(|e| BundleError::Protocol(ProtocolError::json(&index_path, e)))?;
    atomic_write_file(&index_path, &body).map_err(|e| io_error(&index_path, e))?;
    Ok(bundle_dir)
}

fn copy_if_exists(src: &Path, dst: &Path) -> bool {
    src.is_file() && fs::copy(src, dst).is_ok()
}

fn write_tail(log: &Path, dst_dir: &Path, tail_limit: usize) -> bool {
    if !log.is_file() {
        return false;
    }
    let Some(name) = log.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let Ok(lines) = tail_lines(log, tail_limit) else {
        return false;
    };
    let body = format!("{}\n", lines.join("\n"));
    atomic_write_file(&dst_dir.join(format!("{name}.tail")), body.as_bytes()).is_ok()
}

fn reports_inventory(reports_dir: &Path) -> Vec<InventoryEntry> {
    let mut entries = Vec::new();
    collect_inventory(reports_dir, reports_dir, &mut entries);
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries
}

fn collect_inventory(root: &Path, dir: &Path, out: &mut Vec<InventoryEntry>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            collect_inventory(root, &path, out);
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let rel = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .display()
            .to_string();
        out.push(InventoryEntry {
            path: rel,
            size: metadata.len(),
            mtime,
        });
    }
}

/// Fixed per-classification suggestions, extended by the contract's own
/// debug hints when one was loaded.
fn next_actions(error_type: ErrorType, contract: Option<&Contract>) -> Vec<String> {
    let fixed: &[&str] = match error_type {
        ErrorType::LocatorFail => &[
            "Check that the .enc descriptor and its .enc.dat sibling exist and are readable",
            "Try an explicit path query such as ./path/to/design.enc",
        ],
        ErrorType::SessionStartFail => &[
            "Check session/supervisor.log for launcher errors",
            "Verify the tool installation, license and queue availability",
        ],
        ErrorType::InnovusCrash => &[
            "Check session/state.json for the exit code",
            "Review the innovus stdout/stderr tails for the crash signature",
        ],
        ErrorType::HeartbeatLost => &[
            "Check the last heartbeat age in session/",
            "Verify whether the tool process is still running on its host",
        ],
        ErrorType::QueueTimeout => &[
            "Check whether the heartbeat was still updating when the wait expired",
            "Look for long-running commands in the innovus stdout tail",
        ],
        ErrorType::RestoreFail => &[
            "Review the failing ack message and the innovus log tail",
            "Check the descriptor for relative-path dependencies",
        ],
        ErrorType::CmdFail => &[
            "Check the failing ack message for the script error",
            "Review the rendered script under scripts/",
        ],
        ErrorType::ContractInvalid => &[
            "Review contract.yaml: required outputs and path constraints",
        ],
        ErrorType::OutputMissing => &[
            "Check reports_inventory.json against the contract's required outputs",
            "Verify the skill script actually wrote into reports/",
        ],
        ErrorType::OutputEmpty => &[
            "Check report sizes in reports_inventory.json",
            "Verify the skill script produced non-empty outputs",
        ],
        ErrorType::InternalError | ErrorType::Ok => &[
            "Review the timeline tail for the failing step",
        ],
    };
    let mut actions: Vec<String> = fixed.iter().map(|s| s.to_string()).collect();
    if let Some(contract) = contract {
        actions.extend(contract.debug_hints.iter().cloned());
    }
    actions
}
