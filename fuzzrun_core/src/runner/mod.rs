pub mod command;
pub mod sandbox;

use crate::build::BuildResult;
use crate::error::RunError;
use crate::report::ReportHandler;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde::Serialize;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use sandbox::Sandbox;

/// How long past its time budget the engine gets to stop on its own.
pub const TIMEOUT_GRACE: Duration = Duration::from_secs(10);

/// Why a fuzzing run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationCause {
    /// The engine exited with status 0.
    NormalExit,
    /// The run was cancelled and the process killed.
    Signaled,
    /// The deadline passed without the engine stopping itself.
    TimedOut,
    /// The engine exited non-zero after reporting a finding.
    Crashed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub cause: TerminationCause,
    pub exit_code: Option<i32>,
}

pub struct RunnerOptions {
    pub build: Arc<BuildResult>,
    pub dictionary: Option<PathBuf>,
    pub engine_args: Vec<String>,
    pub seed_corpus_dirs: Vec<PathBuf>,
    /// Where libFuzzer writes crashing inputs.
    pub artifacts_dir: PathBuf,
    /// Zero means unlimited.
    pub timeout: Duration,
    pub recover_ubsan: bool,
    /// Keep ANSI colors in sanitizer output.
    pub keep_color: bool,
    pub env_overrides: Vec<(String, String)>,
    /// `Some(minijail path)` runs the fuzz test sandboxed.
    pub sandbox: Option<PathBuf>,
    pub read_only_bindings: Vec<PathBuf>,
    pub read_write_bindings: Vec<PathBuf>,
    /// Scratch space owned by the run, removed by the caller afterwards.
    pub temp_dir: PathBuf,
}

/// Kills the fuzzer's whole process group.
///
/// Shared between the runner, which arms it once the child is spawned, and
/// the coordinator, which fires it when the operator cancels the run.
#[derive(Debug, Clone, Default)]
pub struct Terminator {
    group: Arc<Mutex<Option<Pid>>>,
}

impl Terminator {
    fn arm(&self, pid: u32) {
        if let Ok(mut group) = self.group.lock() {
            *group = Some(Pid::from_raw(pid as i32));
        }
    }

    fn disarm(&self) {
        if let Ok(mut group) = self.group.lock() {
            *group = None;
        }
    }

    /// Sends SIGKILL to the process group. Returns whether a process was signaled.
    pub fn terminate(&self) -> bool {
        let group = match self.group.lock() {
            Ok(group) => *group,
            Err(_) => return false,
        };
        match group {
            Some(pgid) => match killpg(pgid, Signal::SIGKILL) {
                Ok(()) => {
                    debug!(pgid = pgid.as_raw(), "killed fuzzer process group");
                    true
                }
                Err(e) => {
                    debug!(pgid = pgid.as_raw(), "failed to kill fuzzer process group: {e}");
                    false
                }
            },
            None => false,
        }
    }
}

/// Launches a built fuzz test under libFuzzer and streams its output
/// into a [`ReportHandler`].
pub struct Runner {
    options: RunnerOptions,
    terminator: Terminator,
    last_pid: Option<u32>,
}

impl Runner {
    pub fn new(options: RunnerOptions) -> Self {
        Self {
            options,
            terminator: Terminator::default(),
            last_pid: None,
        }
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    pub fn terminator(&self) -> Terminator {
        self.terminator.clone()
    }

    /// PID of the most recently spawned fuzzer process.
    pub fn last_pid(&self) -> Option<u32> {
        self.last_pid
    }

    /// The full argument vector, including the sandbox wrapper if enabled.
    pub fn argv(&self) -> Result<Vec<std::ffi::OsString>, RunError> {
        let argv = command::fuzzer_argv(&self.options);
        let Some(minijail) = &self.options.sandbox else {
            return Ok(argv);
        };

        let mut sandbox = Sandbox::new(minijail, &self.options.temp_dir)?;
        sandbox.bind_read_only(&self.options.build.build_dir)?;
        for path in &self.options.build.runtime_paths {
            sandbox.bind_read_only(path)?;
        }
        if let Some(parent) = self.options.build.executable.parent() {
            sandbox.bind_read_only(parent)?;
        }
        if let Some(dict) = &self.options.dictionary {
            sandbox.bind_read_only(dict)?;
        }
        for dir in &self.options.seed_corpus_dirs {
            sandbox.bind_read_only(dir)?;
        }
        for path in &self.options.read_only_bindings {
            sandbox.bind_read_only(path)?;
        }
        sandbox.bind_read_write(&self.options.build.generated_corpus)?;
        sandbox.bind_read_write(&self.options.artifacts_dir)?;
        for path in &self.options.read_write_bindings {
            sandbox.bind_read_write(path)?;
        }
        sandbox.prepare()?;
        Ok(sandbox.wrap(argv))
    }

    /// Runs the fuzzer until it exits, `scope` is cancelled, or the deadline passes.
    ///
    /// Every output line reaches `handler` before the exit status is looked at,
    /// so a finding reported by the engine always precedes the run's outcome.
    pub async fn run(
        &mut self,
        handler: &mut ReportHandler,
        scope: &CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        if scope.is_cancelled() {
            return Ok(RunOutcome {
                cause: TerminationCause::Signaled,
                exit_code: None,
            });
        }

        let argv = self.argv()?;
        debug!(argv = ?argv, "launching fuzzer");
        let program = PathBuf::from(&argv[0]);

        let mut cmd = Command::new(&program);
        cmd.args(&argv[1..])
            .envs(command::fuzzer_env(&self.options))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| RunError::Launch {
            path: program.clone(),
            source,
        })?;
        if let Some(pid) = child.id() {
            self.last_pid = Some(pid);
            self.terminator.arm(pid);
        }

        let streamed = self.stream_until_exit(&mut child, handler, scope).await;
        let (status, cause) = match streamed {
            Ok(streamed) => streamed,
            Err(err) => {
                self.terminator.terminate();
                self.terminator.disarm();
                return Err(err);
            }
        };
        self.terminator.disarm();
        handler.finish()?;

        let exit_code = status.code();
        if let Some(cause) = cause {
            return Ok(RunOutcome { cause, exit_code });
        }
        if status.success() {
            info!("Fuzzer finished");
            return Ok(RunOutcome {
                cause: TerminationCause::NormalExit,
                exit_code,
            });
        }
        if handler.has_findings() {
            debug!(exit_code = ?exit_code, "fuzzer exited after reporting a finding");
            return Ok(RunOutcome {
                cause: TerminationCause::Crashed,
                exit_code,
            });
        }
        Err(RunError::UnexpectedExit {
            code: exit_code,
            signal: exit_signal(&status),
        })
    }

    /// Feeds output lines to `handler` until the child has exited and both
    /// streams are closed.
    ///
    /// Cancellation and the deadline stay armed the whole time, also after
    /// the streams closed or while leftover processes of the group hold them
    /// open.
    async fn stream_until_exit(
        &self,
        child: &mut Child,
        handler: &mut ReportHandler,
        scope: &CancellationToken,
    ) -> Result<(ExitStatus, Option<TerminationCause>), RunError> {
        let stdout = child.stdout.take().ok_or_else(|| {
            RunError::Io(std::io::Error::other("fuzzer stdout was not captured"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            RunError::Io(std::io::Error::other("fuzzer stderr was not captured"))
        })?;
        let mut stdout = BufReader::new(stdout).split(b'\n');
        let mut stderr = BufReader::new(stderr).split(b'\n');
        let (mut stdout_open, mut stderr_open) = (true, true);

        let unlimited = self.options.timeout.is_zero();
        let deadline = tokio::time::sleep(self.options.timeout.saturating_add(TIMEOUT_GRACE));
        tokio::pin!(deadline);

        let mut cause: Option<TerminationCause> = None;
        let mut status: Option<ExitStatus> = None;
        loop {
            if let (Some(status), false, false) = (status, stdout_open, stderr_open) {
                return Ok((status, cause));
            }
            tokio::select! {
                biased;
                _ = scope.cancelled(), if cause.is_none() => {
                    debug!("run cancelled, terminating fuzzer");
                    self.terminator.terminate();
                    cause = Some(TerminationCause::Signaled);
                }
                _ = &mut deadline, if !unlimited && cause.is_none() => {
                    warn!(
                        "Fuzzer did not stop within {:?} of its {:?} time budget, terminating it",
                        TIMEOUT_GRACE, self.options.timeout
                    );
                    self.terminator.terminate();
                    cause = Some(TerminationCause::TimedOut);
                }
                segment = stderr.next_segment(), if stderr_open => match segment? {
                    Some(bytes) => handler.handle_line(&String::from_utf8_lossy(&bytes))?,
                    None => stderr_open = false,
                },
                segment = stdout.next_segment(), if stdout_open => match segment? {
                    Some(bytes) => handler.handle_line(&String::from_utf8_lossy(&bytes))?,
                    None => stdout_open = false,
                },
                exited = child.wait(), if status.is_none() => {
                    status = Some(exited?);
                    if stdout_open || stderr_open {
                        // Processes left in the group still hold the pipes.
                        debug!("fuzzer exited with its output still open, killing leftovers");
                        self.terminator.terminate();
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}
