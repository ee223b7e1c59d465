use crate::error::BuildError;
use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader};
use std::process::{Command, Stdio};
use tracing::debug;

/// Number of trailing stderr lines kept for the error message of a failed tool.
const STDERR_TAIL_LINES: usize = 40;

/// Runs a build tool to completion, passing its output through.
///
/// Stdout is inherited (or redirected to stderr when stdout must stay
/// machine-readable); stderr is echoed line by line and its tail is
/// attached to `BuildError::ToolFailed` on a non-zero exit.
pub(crate) fn run_passthrough(
    tool: &str,
    cmd: &mut Command,
    stdout_to_stderr: bool,
) -> Result<(), BuildError> {
    debug!(tool, command = ?cmd, "running build tool");
    if stdout_to_stderr {
        cmd.stdout(Stdio::from(io::stderr()));
    } else {
        cmd.stdout(Stdio::inherit());
    }
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| spawn_error(tool, e))?;

    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    if let Some(stderr) = child.stderr.take() {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);
            eprintln!("{line}");
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.to_string());
        }
    }

    let status = child.wait()?;
    if !status.success() {
        return Err(BuildError::ToolFailed {
            tool: tool.to_string(),
            code: status.code(),
            stderr: Vec::from(tail).join("\n"),
        });
    }
    Ok(())
}

/// Runs a query command and returns its trimmed stdout.
pub(crate) fn capture(tool: &str, cmd: &mut Command) -> Result<String, BuildError> {
    debug!(tool, command = ?cmd, "querying build tool");
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|e| spawn_error(tool, e))?;
    if !output.status.success() {
        return Err(BuildError::ToolFailed {
            tool: tool.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Runs a command only for its exit status. Output is discarded.
pub(crate) fn succeeds(tool: &str, cmd: &mut Command) -> Result<bool, BuildError> {
    debug!(tool, command = ?cmd, "checking build tool");
    let status = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| spawn_error(tool, e))?;
    Ok(status.success())
}

fn spawn_error(tool: &str, err: io::Error) -> BuildError {
    if err.kind() == io::ErrorKind::NotFound {
        BuildError::ToolMissing {
            tool: tool.to_string(),
            reason: err.to_string(),
        }
    } else {
        BuildError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failing_tool_reports_exit_code_and_stderr_tail() {
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "echo first >&2; echo 'no rule to make target' >&2; exit 2"]);
        match run_passthrough("sh", &mut cmd, true) {
            Err(BuildError::ToolFailed { tool, code, stderr }) => {
                assert_eq!(tool, "sh");
                assert_eq!(code, Some(2));
                assert_eq!(stderr, "first\nno rule to make target");
            }
            other => panic!("Expected ToolFailed, got {other:?}"),
        }
    }

    #[test]
    fn missing_tool_is_reported_as_such() {
        let mut cmd = Command::new("/nonexistent/tool-fuzzrun-12345");
        match run_passthrough("tool", &mut cmd, true) {
            Err(BuildError::ToolMissing { tool, .. }) => assert_eq!(tool, "tool"),
            other => panic!("Expected ToolMissing, got {other:?}"),
        }
    }

    #[test]
    fn capture_trims_stdout_and_succeeds_reports_status() {
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "echo '  /opt/install_base  '"]);
        assert_eq!(capture("sh", &mut cmd).unwrap(), "/opt/install_base");

        let mut ok = Command::new("/bin/sh");
        ok.args(["-c", "exit 0"]);
        assert!(succeeds("sh", &mut ok).unwrap());

        let mut failing = Command::new("/bin/sh");
        failing.args(["-c", "exit 1"]);
        assert!(!succeeds("sh", &mut failing).unwrap());
    }
}
