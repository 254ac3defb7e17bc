use super::manifest::SelectedDesign;
use super::{encode_pretty, ErrorType, JobStatus, ProtocolError, SCHEMA_VERSION};
use crate::shared::atomic_write_file;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const SUMMARY_JSON_FILE: &str = "summary.json";
pub const SUMMARY_MD_FILE: &str = "summary.md";

/// Terminal result in both machine (`summary.json`) and human (`summary.md`)
/// form. Written for PASS and FAIL alike; the markdown names the
/// classification and points at the debug bundle on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub schema_version: String,
    pub job_id: String,
    pub status: JobStatus,
    pub error_type: ErrorType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub design: Option<SelectedDesign>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<SkillSummary>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metrics: serde_json::Map<String, serde_json::Value>,
    pub evidence: Evidence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillSummary {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub run_dir: String,
    pub summary_md: String,
    pub reports_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_bundle_dir: Option<String>,
}

impl Summary {
    pub fn new(job_id: &str, status: JobStatus, error_type: ErrorType, run_dir: &Path) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            job_id: job_id.to_string(),
            status,
            error_type,
            design: None,
            skill: None,
            metrics: serde_json::Map::new(),
            evidence: Evidence {
                run_dir: run_dir.display().to_string(),
                summary_md: run_dir.join(SUMMARY_MD_FILE).display().to_string(),
                reports_dir: run_dir.join("reports").display().to_string(),
                debug_bundle_dir: (status == JobStatus::Fail)
                    .then(|| run_dir.join("debug_bundle").display().to_string()),
            },
        }
    }

    pub fn with_design(mut self, design: SelectedDesign) -> Self {
        self.design = Some(design);
        self
    }

    pub fn with_skill(mut self, name: &str, version: &str) -> Self {
        self.skill = Some(SkillSummary {
            name: name.to_string(),
            version: version.to_string(),
        });
        self
    }

    pub fn set_metric(&mut self, key: &str, value: serde_json::Value) {
        self.metrics.insert(key.to_string(), value);
    }

    pub fn store(&self, run_dir: &Path, findings: &str, risks: &str) -> Result<(), ProtocolError> {
        let json_path = run_dir.join(SUMMARY_JSON_FILE);
        let body = encode_pretty(&json_path, self)?;
        atomic_write_file(&json_path, &body).map_err(|e| ProtocolError::io(&json_path, e))?;

        let md_path = run_dir.join(SUMMARY_MD_FILE);
        atomic_write_file(&md_path, self.render_md(run_dir, findings, risks).as_bytes())
            .map_err(|e| ProtocolError::io(&md_path, e))
    }

    fn render_md(&self, run_dir: &Path, findings: &str, risks: &str) -> String {
        let mut lines = vec![
            "# SkillPilot Summary".to_string(),
            String::new(),
            "## Conclusion".to_string(),
            format!("- **Status**: {}", self.status),
            format!("- **Classification**: {}", self.error_type),
            String::new(),
        ];
        if let Some(skill) = &self.skill {
            lines.push(format!("- **Skill**: {} v{}", skill.name, skill.version));
            lines.push(String::new());
        }
        if !findings.is_empty() {
            lines.push("## Key Findings".to_string());
            lines.push(findings.to_string());
            lines.push(String::new());
        }
        if !risks.is_empty() {
            lines.push("## Risks / Issues".to_string());
            lines.push(risks.to_string());
            lines.push(String::new());
        }
        if !self.metrics.is_empty() {
            lines.push("## Metrics".to_string());
            for (key, value) in &self.metrics {
                lines.push(format!("- **{key}**: {value}"));
            }
            lines.push(String::new());
        }
        lines.push("## Evidence Paths".to_string());
        lines.push(format!("- **run_dir**: `{}`", run_dir.display()));
        lines.push(format!(
            "- **summary.json**: `{}`",
            run_dir.join(SUMMARY_JSON_FILE).display()
        ));
        lines.push(format!(
            "- **reports/**: `{}`",
            run_dir.join("reports").display()
        ));
        lines.push(format!(
            "- **session/**: `{}`",
            run_dir.join("session").display()
        ));
        if self.status == JobStatus::Fail {
            lines.push(format!(
                "- **debug_bundle/**: `{}`",
                run_dir.join("debug_bundle").display()
            ));
        }
        lines.push(String::new());
        lines.join("\n")
    }
}
