use crate::protocol::{ErrorType, SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};

pub const CONTRACT_FILE: &str = "contract.yaml";
pub const REPORTS_PREFIX: &str = "reports/";

#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("failed to read contract {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse contract {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid contract: {reason}")]
    Invalid { reason: String },
}

/// Declarative half of a Skill package: identity, script entries, required
/// outputs and diagnosis hints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub schema_version: String,
    pub name: String,
    pub version: String,
    #[serde(default = "default_tool")]
    pub tool: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub scripts: Vec<ScriptEntry>,
    pub outputs: Outputs,
    #[serde(default)]
    pub debug_hints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptEntry {
    pub name: String,
    pub entry: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outputs {
    #[serde(default)]
    pub required: Vec<RequiredOutput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequiredOutput {
    /// Pattern relative to the run directory, rooted at `reports/`. May carry
    /// glob metacharacters itself or via the optional `glob` suffix.
    pub path: String,
    #[serde(default)]
    pub glob: Option<String>,
    #[serde(default = "default_non_empty")]
    pub non_empty: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_tool() -> String {
    "innovus".to_string()
}

fn default_non_empty() -> bool {
    true
}

impl RequiredOutput {
    /// Full pattern, `reports/` prefix included.
    pub fn pattern(&self) -> String {
        match &self.glob {
            Some(glob) => format!("{}/{}", self.path.trim_end_matches('/'), glob),
            None => self.path.clone(),
        }
    }
}

impl Contract {
    pub fn load(path: &Path) -> Result<Self, ContractError> {
        let raw = fs::read_to_string(path).map_err(|source| ContractError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let contract: Contract =
            serde_yaml::from_str(&raw).map_err(|source| ContractError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        if contract.schema_version != SCHEMA_VERSION {
            return Err(ContractError::Invalid {
                reason: format!(
                    "unsupported schema_version `{}` in {}",
                    contract.schema_version,
                    path.display()
                ),
            });
        }
        Ok(contract)
    }

    pub fn path_for_skill(skill_root: &Path, skill_name: &str) -> PathBuf {
        skill_root.join(skill_name).join(CONTRACT_FILE)
    }

    /// The script submitted for `RUN_SKILL`; by convention the first entry.
    pub fn entry_script(&self) -> Option<&ScriptEntry> {
        self.scripts.first()
    }

    /// Static checks applied before any session is started. Violations are
    /// classified `CONTRACT_INVALID`.
    pub fn validate_static(&self) -> Result<(), ContractError> {
        if self.name.trim().is_empty() {
            return Err(invalid("skill name must be non-empty"));
        }
        if self.scripts.is_empty() {
            return Err(invalid("at least one script entry is required"));
        }
        for script in &self.scripts {
            validate_relative_component(&script.entry, "script entry")?;
        }
        if self.outputs.required.is_empty() {
            return Err(invalid("at least one required output must be declared"));
        }
        for output in &self.outputs.required {
            let pattern = output.pattern();
            validate_relative_component(&pattern, "output path")?;
            if !pattern.starts_with(REPORTS_PREFIX) {
                return Err(invalid(&format!(
                    "output path `{pattern}` must start with `{REPORTS_PREFIX}`"
                )));
            }
            let below_reports = &pattern[REPORTS_PREFIX.len()..];
            if below_reports.is_empty() {
                return Err(invalid(&format!("output path `{pattern}` names no file")));
            }
            glob::Pattern::new(below_reports).map_err(|e| {
                invalid(&format!("output pattern `{pattern}` is not a valid glob: {e}"))
            })?;
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> ContractError {
    ContractError::Invalid {
        reason: reason.to_string(),
    }
}

fn validate_relative_component(raw: &str, what: &str) -> Result<(), ContractError> {
    if raw.is_empty() {
        return Err(invalid(&format!("{what} must be non-empty")));
    }
    if raw.starts_with('/') {
        return Err(invalid(&format!("{what} `{raw}` must be relative")));
    }
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir | Component::ParentDir => {
                return Err(invalid(&format!(
                    "{what} `{raw}` must not contain `.` or `..` segments"
                )))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid(&format!("{what} `{raw}` must be relative")))
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutputStatus {
    Ok,
    Missing,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputFile {
    pub path: String,
    pub size: u64,
}

/// Per-entry validation result, retained in full for the debug bundle even
/// though the first failure already classifies the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputCheck {
    pub pattern: String,
    pub status: OutputStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<OutputFile>,
}

/// Expand and check every required output beneath `reports/`. Returns the
/// full check list plus the classification of the first failing entry
/// (`OK` when everything passed). A match escaping the reports directory
/// after canonicalization is a contract violation, not a missing output.
pub fn validate_outputs(
    contract: &Contract,
    reports_dir: &Path,
) -> Result<(Vec<OutputCheck>, ErrorType), ContractError> {
    // A vanished reports directory means nothing was produced: every
    // required entry is missing, not a malformed contract.
    let Ok(reports_root) = fs::canonicalize(reports_dir) else {
        let checks: Vec<OutputCheck> = contract
            .outputs
            .required
            .iter()
            .map(|output| OutputCheck {
                pattern: output.pattern(),
                status: OutputStatus::Missing,
                files: Vec::new(),
            })
            .collect();
        let verdict = if checks.is_empty() {
            ErrorType::Ok
        } else {
            ErrorType::OutputMissing
        };
        return Ok((checks, verdict));
    };

    let mut checks = Vec::new();
    let mut first_failure = ErrorType::Ok;

    for output in &contract.outputs.required {
        let pattern = output.pattern();
        let below_reports = pattern
            .strip_prefix(REPORTS_PREFIX)
            .ok_or_else(|| invalid(&format!("output path `{pattern}` escapes `reports/`")))?;
        let full_pattern = reports_root.join(below_reports).display().to_string();

        let mut files = Vec::new();
        let entries = glob::glob(&full_pattern)
            .map_err(|e| invalid(&format!("output pattern `{pattern}` is not a valid glob: {e}")))?;
        for entry in entries {
            let Ok(path) = entry else { continue };
            if !path.is_file() {
                continue;
            }
            let resolved = fs::canonicalize(&path).map_err(|e| {
                invalid(&format!("matched output {} cannot be resolved: {e}", path.display()))
            })?;
            if !resolved.starts_with(&reports_root) {
                return Err(invalid(&format!(
                    "matched output {} resolves outside the reports directory",
                    path.display()
                )));
            }
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            files.push(OutputFile {
                path: path.display().to_string(),
                size,
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let status = if files.is_empty() {
            OutputStatus::Missing
        } else if output.non_empty && files.iter().any(|f| f.size == 0) {
            OutputStatus::Empty
        } else {
            OutputStatus::Ok
        };
        if first_failure == ErrorType::Ok {
            first_failure = match status {
                OutputStatus::Ok => ErrorType::Ok,
                OutputStatus::Missing => ErrorType::OutputMissing,
                OutputStatus::Empty => ErrorType::OutputEmpty,
            };
        }
        checks.push(OutputCheck {
            pattern,
            status,
            files,
        });
    }

    Ok((checks, first_failure))
}
