use super::{io_error, Launcher, SessionError, SessionHandle};
use crate::rundir::RunPaths;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;

/// Launches the tool as a direct subprocess of the orchestrating process.
/// Stdout and stderr are streamed into the session log files by dedicated
/// writer threads, one per stream.
pub struct LocalLauncher {
    tool_command: String,
}

impl LocalLauncher {
    pub fn new(tool_command: String) -> Self {
        Self { tool_command }
    }
}

impl Launcher for LocalLauncher {
    fn name(&self) -> &str {
        crate::config::LAUNCHER_LOCAL
    }

    fn launch(
        &self,
        paths: &RunPaths,
        env: &BTreeMap<String, String>,
        init_script: &Path,
    ) -> Result<SessionHandle, SessionError> {
        let mut command = Command::new(&self.tool_command);
        command
            .arg("-init")
            .arg(init_script)
            .current_dir(&paths.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in env {
            command.env(key, value);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(SessionError::Spawn {
                    reason: format!("tool binary `{}` not found", self.tool_command),
                })
            }
            Err(err) => return Err(io_error(&paths.root, err)),
        };

        let stdout = child.stdout.take().ok_or_else(|| SessionError::Spawn {
            reason: "missing stdout pipe".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| SessionError::Spawn {
            reason: "missing stderr pipe".to_string(),
        })?;
        spawn_stream_writer(stdout, paths.tool_stdout_log_path());
        spawn_stream_writer(stderr, paths.tool_stderr_log_path());

        Ok(SessionHandle::for_process(child))
    }
}

fn spawn_stream_writer<R: io::Read + Send + 'static>(
    mut stream: R,
    log_path: std::path::PathBuf,
) {
    thread::spawn(move || {
        let Ok(mut file) = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
        else {
            return;
        };
        let _ = io::copy(&mut stream, &mut file);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn prepared_paths() -> (tempfile::TempDir, RunPaths) {
        let tmp = tempdir().expect("tempdir");
        let paths = RunPaths::new(tmp.path().join("run"));
        for dir in paths.required_directories() {
            fs::create_dir_all(dir).expect("dirs");
        }
        (tmp, paths)
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let (_tmp, paths) = prepared_paths();
        let launcher = LocalLauncher::new("definitely-not-a-real-eda-tool".to_string());
        let err = launcher
            .launch(&paths, &BTreeMap::new(), &paths.scripts_dir().join("bootstrap.tcl"))
            .expect_err("must fail");
        assert!(matches!(err, SessionError::Spawn { .. }));
    }

    #[test]
    fn captures_streams_and_reports_exit() {
        let (_tmp, paths) = prepared_paths();
        // `sh` stands in for the tool: it ignores -init and echoes to both streams.
        fs::write(
            paths.scripts_dir().join("bootstrap.tcl"),
            "echo tool-stdout; echo tool-stderr 1>&2\n",
        )
        .expect("script");

        let launcher = LocalLauncher::new("sh".to_string());
        let handle = launcher
            .launch(&paths, &BTreeMap::new(), &paths.scripts_dir().join("bootstrap.tcl"))
            .expect("launch");

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while handle.is_alive() && std::time::Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(!handle.is_alive(), "sh must exit");

        // sh -init <script> fails option parsing on some shells; accept either
        // a clean echo run or an error landing in the stderr log.
        thread::sleep(std::time::Duration::from_millis(100));
        let stdout = fs::read_to_string(paths.tool_stdout_log_path()).unwrap_or_default();
        let stderr = fs::read_to_string(paths.tool_stderr_log_path()).unwrap_or_default();
        assert!(
            !stdout.is_empty() || !stderr.is_empty(),
            "one of the stream logs must have content"
        );
    }
}
