use super::{io_error, Launcher, SessionError, SessionHandle};
use crate::rundir::RunPaths;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};

/// Launches the tool through an interactive cluster submission command. The
/// template is site-specific; the submission stays attached for the session's
/// lifetime, so the submit process IS the session from the supervisor's view.
///
/// Template placeholders: `{command}` (tool invocation), `{workdir}`,
/// `{stdout}`, `{stderr}`.
pub struct BatchLauncher {
    tool_command: String,
    template: String,
}

impl BatchLauncher {
    pub fn new(tool_command: String, template: String) -> Self {
        Self {
            tool_command,
            template,
        }
    }

    fn render(&self, paths: &RunPaths, init_script: &Path) -> String {
        let tool = format!("{} -init {}", self.tool_command, init_script.display());
        self.template
            .replace("{command}", &tool)
            .replace("{workdir}", &paths.root.display().to_string())
            .replace("{stdout}", &paths.tool_stdout_log_path().display().to_string())
            .replace("{stderr}", &paths.tool_stderr_log_path().display().to_string())
    }
}

impl Launcher for BatchLauncher {
    fn name(&self) -> &str {
        crate::config::LAUNCHER_BATCH
    }

    fn launch(
        &self,
        paths: &RunPaths,
        env: &BTreeMap<String, String>,
        init_script: &Path,
    ) -> Result<SessionHandle, SessionError> {
        if !self.template.contains("{command}") {
            return Err(SessionError::Spawn {
                reason: "batch command template lacks a {command} placeholder".to_string(),
            });
        }
        let rendered = self.render(paths, init_script);

        let stdout_log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(paths.tool_stdout_log_path())
            .map_err(|e| io_error(&paths.tool_stdout_log_path(), e))?;
        let stderr_log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(paths.tool_stderr_log_path())
            .map_err(|e| io_error(&paths.tool_stderr_log_path(), e))?;

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&rendered)
            .current_dir(&paths.root)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_log))
            .stderr(Stdio::from(stderr_log));
        for (key, value) in env {
            command.env(key, value);
        }

        match command.spawn() {
            Ok(child) => Ok(SessionHandle::for_process(child)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(SessionError::Spawn {
                reason: "shell unavailable for batch submission".to_string(),
            }),
            Err(err) => Err(io_error(&paths.root, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn template_placeholders_are_substituted() {
        let tmp = tempdir().expect("tempdir");
        let paths = RunPaths::new(tmp.path().join("run"));
        let launcher = BatchLauncher::new(
            "innovus".to_string(),
            "bsub -I -cwd {workdir} -o {stdout} -e {stderr} {command}".to_string(),
        );
        let rendered = launcher.render(&paths, &paths.scripts_dir().join("bootstrap.tcl"));
        assert!(rendered.contains("innovus -init"));
        assert!(rendered.contains("bootstrap.tcl"));
        assert!(rendered.contains(&paths.root.display().to_string()));
        assert!(rendered.contains("innovus.stdout.log"));
        assert!(!rendered.contains('{'), "unexpanded placeholder in: {rendered}");
    }

    #[test]
    fn missing_command_placeholder_is_refused() {
        let tmp = tempdir().expect("tempdir");
        let paths = RunPaths::new(tmp.path().join("run"));
        for dir in paths.required_directories() {
            fs::create_dir_all(dir).expect("dirs");
        }
        let launcher = BatchLauncher::new("innovus".to_string(), "bsub -I".to_string());
        let err = launcher
            .launch(&paths, &BTreeMap::new(), &paths.scripts_dir().join("bootstrap.tcl"))
            .expect_err("must refuse");
        assert!(matches!(err, SessionError::Spawn { .. }));
    }

    #[test]
    fn submission_process_stands_in_for_the_session() {
        let tmp = tempdir().expect("tempdir");
        let paths = RunPaths::new(tmp.path().join("run"));
        for dir in paths.required_directories() {
            fs::create_dir_all(dir).expect("dirs");
        }
        // `true` exits immediately: the handle must observe termination.
        let launcher = BatchLauncher::new("true".to_string(), "{command}".to_string());
        let handle = launcher
            .launch(&paths, &BTreeMap::new(), &paths.scripts_dir().join("bootstrap.tcl"))
            .expect("launch");

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while handle.is_alive() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(!handle.is_alive());
    }
}
