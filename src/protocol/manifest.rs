use super::{encode_pretty, load_record, ErrorType, JobStatus, ProtocolError, SCHEMA_VERSION};
use crate::shared::{atomic_write_file, utc_timestamp};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MANIFEST_FILE: &str = "job_manifest.json";

/// Single source of truth for one job: input, locator decision, skill
/// identity, and final state. Created as `RUNNING` when the run directory is
/// built and rewritten atomically as facts become known; the terminal status
/// is written exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: String,
    pub job_id: String,
    pub created_at: String,
    pub status: JobStatus,
    pub error_type: ErrorType,
    pub runtime: RuntimeContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub design: Option<DesignRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<SkillRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactPointers>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeContext {
    pub cwd: String,
    pub run_dir: String,
    pub launcher: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocatorMode {
    ExplicitPath,
    NameScan,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub path: String,
    pub mtime: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignRecord {
    pub query: String,
    pub mode: LocatorMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<SelectedDesign>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub selection_reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedDesign {
    pub enc_path: String,
    pub enc_dat_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillRef {
    pub name: String,
    pub version: String,
    pub contract_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactPointers {
    pub timeline: String,
    pub summary_json: String,
    pub summary_md: String,
    pub reports_dir: String,
    pub session_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_bundle_dir: Option<String>,
}

impl Manifest {
    pub fn new(job_id: &str, cwd: &Path, run_dir: &Path, launcher: &str) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            job_id: job_id.to_string(),
            created_at: utc_timestamp(),
            status: JobStatus::Running,
            error_type: ErrorType::Ok,
            runtime: RuntimeContext {
                cwd: cwd.display().to_string(),
                run_dir: run_dir.display().to_string(),
                launcher: launcher.to_string(),
            },
            design: None,
            skill: None,
            artifacts: None,
        }
    }

    pub fn record_candidates(&mut self, query: &str, mode: LocatorMode, candidates: Vec<Candidate>) {
        self.design = Some(DesignRecord {
            query: query.to_string(),
            mode,
            candidates,
            selected: None,
            selection_reason: String::new(),
        });
    }

    pub fn record_selection(
        &mut self,
        query: &str,
        mode: LocatorMode,
        candidates: Vec<Candidate>,
        selected: SelectedDesign,
        selection_reason: &str,
    ) {
        self.design = Some(DesignRecord {
            query: query.to_string(),
            mode,
            candidates,
            selected: Some(selected),
            selection_reason: selection_reason.to_string(),
        });
    }

    pub fn record_skill(&mut self, name: &str, version: &str, contract_path: &Path) {
        self.skill = Some(SkillRef {
            name: name.to_string(),
            version: version.to_string(),
            contract_path: contract_path.display().to_string(),
        });
    }

    pub fn record_artifacts(&mut self, run_dir: &Path, has_debug_bundle: bool) {
        self.artifacts = Some(ArtifactPointers {
            timeline: run_dir.join("job_timeline.jsonl").display().to_string(),
            summary_json: run_dir.join("summary.json").display().to_string(),
            summary_md: run_dir.join("summary.md").display().to_string(),
            reports_dir: run_dir.join("reports").display().to_string(),
            session_dir: run_dir.join("session").display().to_string(),
            debug_bundle_dir: has_debug_bundle
                .then(|| run_dir.join("debug_bundle").display().to_string()),
        });
    }

    pub fn finalize(&mut self, status: JobStatus, error_type: ErrorType) {
        self.status = status;
        self.error_type = error_type;
    }

    pub fn store(&self, run_dir: &Path) -> Result<(), ProtocolError> {
        let path = run_dir.join(MANIFEST_FILE);
        let body = encode_pretty(&path, self)?;
        atomic_write_file(&path, &body).map_err(|e| ProtocolError::io(&path, e))
    }

    pub fn load(run_dir: &Path) -> Result<Self, ProtocolError> {
        load_record(&run_dir.join(MANIFEST_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn manifest_round_trips_through_store_and_load() {
        let tmp = tempdir().expect("tempdir");
        let run_dir = tmp.path();

        let mut manifest = Manifest::new("20260101_000000_ab12", Path::new("/work"), run_dir, "pseudo");
        manifest.record_selection(
            "a",
            LocatorMode::NameScan,
            vec![Candidate {
                path: "/work/a.enc".to_string(),
                mtime: "2026-01-01T00:00:00Z".to_string(),
                size: 42,
            }],
            SelectedDesign {
                enc_path: "/work/a.enc".to_string(),
                enc_dat_path: "/work/a.enc.dat".to_string(),
            },
            "unique_scan_result",
        );
        manifest.record_skill("summary_health", "1.2", Path::new("/skills/contract.yaml"));
        manifest.store(run_dir).expect("store");

        let loaded = Manifest::load(run_dir).expect("load");
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.status, JobStatus::Running);
        assert_eq!(loaded.error_type, ErrorType::Ok);
    }

    #[test]
    fn terminal_rewrite_preserves_design_block() {
        let tmp = tempdir().expect("tempdir");
        let run_dir = tmp.path();

        let mut manifest = Manifest::new("job1", Path::new("/work"), run_dir, "local");
        manifest.record_candidates(
            "top",
            LocatorMode::NameScan,
            vec![
                Candidate {
                    path: "/work/b1/top.enc".to_string(),
                    mtime: "2026-01-01T00:00:00Z".to_string(),
                    size: 1,
                },
                Candidate {
                    path: "/work/b2/top.enc".to_string(),
                    mtime: "2026-01-01T00:00:00Z".to_string(),
                    size: 2,
                },
            ],
        );
        manifest.store(run_dir).expect("store candidates");

        manifest.finalize(JobStatus::Fail, ErrorType::LocatorFail);
        manifest.store(run_dir).expect("store terminal");

        let loaded = Manifest::load(run_dir).expect("load");
        assert_eq!(loaded.status, JobStatus::Fail);
        assert_eq!(loaded.error_type, ErrorType::LocatorFail);
        assert_eq!(loaded.design.expect("design").candidates.len(), 2);
    }
}
