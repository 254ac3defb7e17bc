use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const CONFIG_FILE: &str = "skillpilot.yaml";

pub const LAUNCHER_LOCAL: &str = "local";
pub const LAUNCHER_BATCH: &str = "batch";
pub const LAUNCHER_PSEUDO: &str = "pseudo";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

/// Per-job configuration, read once at job start. Mid-job edits of the
/// config file have no effect on a running job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    #[serde(default = "default_launcher")]
    pub launcher: String,
    /// Command used by the `local` launcher to start the tool.
    #[serde(default = "default_tool_command")]
    pub tool_command: String,
    /// Template for the `batch` launcher. Placeholders: `{command}`,
    /// `{workdir}`, `{stdout}`, `{stderr}`.
    #[serde(default)]
    pub batch_command_template: Option<String>,
    #[serde(default = "default_heartbeat_timeout_s")]
    pub heartbeat_timeout_s: u64,
    #[serde(default = "default_ready_timeout_s")]
    pub ready_timeout_s: u64,
    #[serde(default = "default_ack_timeout_s")]
    pub ack_timeout_s: u64,
    #[serde(default = "default_restore_timeout_s")]
    pub restore_timeout_s: u64,
    #[serde(default = "default_scan_depth")]
    pub scan_depth: usize,
    #[serde(default = "default_bundle_tail_lines")]
    pub bundle_tail_lines: usize,
    #[serde(default = "default_health_poll_interval_ms")]
    pub health_poll_interval_ms: u64,
    #[serde(default = "default_ack_poll_interval_ms")]
    pub ack_poll_interval_ms: u64,
    #[serde(default = "default_session_grace_period_s")]
    pub session_grace_period_s: u64,
}

fn default_launcher() -> String {
    LAUNCHER_LOCAL.to_string()
}

fn default_tool_command() -> String {
    "innovus".to_string()
}

fn default_heartbeat_timeout_s() -> u64 {
    30
}

fn default_ready_timeout_s() -> u64 {
    30
}

fn default_ack_timeout_s() -> u64 {
    120
}

fn default_restore_timeout_s() -> u64 {
    120
}

fn default_scan_depth() -> usize {
    3
}

fn default_bundle_tail_lines() -> usize {
    2000
}

fn default_health_poll_interval_ms() -> u64 {
    1000
}

fn default_ack_poll_interval_ms() -> u64 {
    100
}

fn default_session_grace_period_s() -> u64 {
    5
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            launcher: default_launcher(),
            tool_command: default_tool_command(),
            batch_command_template: None,
            heartbeat_timeout_s: default_heartbeat_timeout_s(),
            ready_timeout_s: default_ready_timeout_s(),
            ack_timeout_s: default_ack_timeout_s(),
            restore_timeout_s: default_restore_timeout_s(),
            scan_depth: default_scan_depth(),
            bundle_tail_lines: default_bundle_tail_lines(),
            health_poll_interval_ms: default_health_poll_interval_ms(),
            ack_poll_interval_ms: default_ack_poll_interval_ms(),
            session_grace_period_s: default_session_grace_period_s(),
        }
    }
}

impl JobConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: JobConfig =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// `<cwd>/skillpilot.yaml` when present, built-in defaults otherwise.
    pub fn load_or_default(cwd: &Path) -> Result<Self, ConfigError> {
        let path = cwd.join(CONFIG_FILE);
        if path.exists() {
            Self::from_path(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.launcher.as_str() {
            LAUNCHER_LOCAL | LAUNCHER_BATCH | LAUNCHER_PSEUDO => {}
            other => {
                return Err(ConfigError::Invalid {
                    reason: format!("unknown launcher `{other}`"),
                })
            }
        }
        if self.launcher == LAUNCHER_BATCH {
            let template = self.batch_command_template.as_deref().unwrap_or("");
            if !template.contains("{command}") {
                return Err(ConfigError::Invalid {
                    reason: "batch launcher requires batch_command_template with a {command} placeholder"
                        .to_string(),
                });
            }
        }
        for (name, value) in [
            ("heartbeat_timeout_s", self.heartbeat_timeout_s),
            ("ready_timeout_s", self.ready_timeout_s),
            ("ack_timeout_s", self.ack_timeout_s),
            ("restore_timeout_s", self.restore_timeout_s),
            ("health_poll_interval_ms", self.health_poll_interval_ms),
            ("ack_poll_interval_ms", self.ack_poll_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    reason: format!("{name} must be greater than zero"),
                });
            }
        }
        if self.tool_command.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: "tool_command must be non-empty".to_string(),
            });
        }
        Ok(())
    }
}
