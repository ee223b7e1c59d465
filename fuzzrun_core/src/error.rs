use crate::build::BuildSystem;
use crate::coordinator::TerminationSignal;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Process exit codes of the `fuzzrun` binary.
///
/// | code        | meaning                                   |
/// |-------------|-------------------------------------------|
/// | 0           | clean run, no findings                    |
/// | 1           | internal or unclassified error            |
/// | 2           | invalid flag or option combination        |
/// | 3           | the fuzz test could not be built          |
/// | 4           | the fuzz test could not be run            |
/// | 5           | the run completed and produced findings   |
/// | 128 + signo | the operator cancelled the run            |
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const INTERNAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const BUILD_FAILED: i32 = 3;
    pub const RUN_FAILED: i32 = 4;
    pub const FINDINGS: i32 = 5;
    pub const SIGNAL_BASE: i32 = 128;
}

/// Invalid options, detected before anything is built or run.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("seed corpus directory {0:?} does not exist")]
    SeedCorpusMissing(PathBuf),

    #[error("seed corpus path {0:?} is not a directory")]
    SeedCorpusNotADirectory(PathBuf),

    #[error("dictionary {path:?} is not accessible: {source}")]
    DictionaryMissing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("flag \"build-command\" must be set when using build system type \"other\"")]
    MissingBuildCommand,

    #[error(
        "invalid argument {0:?} for \"--timeout\" flag: timeout can't be less than a second"
    )]
    TimeoutTooShort(Duration),

    #[error("invalid duration {input:?}: {reason}")]
    InvalidDuration { input: String, reason: String },

    #[error("unsupported build system {0:?} (expected one of: cmake, bazel, other)")]
    UnknownBuildSystem(String),

    #[error("failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Failures of the build abstraction. A run is never attempted after one of these.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("{tool} not found: {reason}")]
    ToolMissing { tool: String, reason: String },

    #[error("{tool} failed ({}){}", describe_exit(.code, &None), stderr_suffix(.stderr))]
    ToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("unknown fuzz test {0:?}")]
    UnknownTarget(String),

    #[error("{system} is not a supported build system on {platform}, use cmake instead")]
    UnsupportedPlatform {
        system: BuildSystem,
        platform: &'static str,
    },

    #[error("fuzz test executable {0:?} does not exist after a successful build")]
    ExecutableMissing(PathBuf),

    #[error("fuzz test executable {0:?} is not executable")]
    NotExecutable(PathBuf),

    #[error("build system {0} requires a build command")]
    NoBuildCommand(BuildSystem),

    #[error("build I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while launching or supervising the fuzzer process.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("failed to launch {path:?}: {source}")]
    Launch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("fuzzer exited with unexpected {}", describe_exit(.code, .signal))]
    UnexpectedExit {
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("sandbox setup failed: {0}")]
    SandboxSetup(String),

    #[error(
        "{0}\nhint: the sandbox might have prevented the fuzz test from running, try again with --use-sandbox=false"
    )]
    PossiblySandboxed(Box<RunError>),

    #[error("run I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunError {
    /// Wraps process-exit failures of sandboxed runs with a hint; other errors pass through.
    pub fn with_sandbox_hint(self) -> Self {
        match self {
            err @ RunError::UnexpectedExit { .. } => RunError::PossiblySandboxed(Box::new(err)),
            other => other,
        }
    }
}

/// The operator asked for the run to stop.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("fuzzing run cancelled by {signal}")]
pub struct CancellationError {
    pub signal: TerminationSignal,
}

/// Coarse classification consumed once at the top level to pick an
/// exit code and decide how much diagnostic detail to print.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Usage,
    Build,
    Run,
    Cancelled,
    Internal,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Cancelled(#[from] CancellationError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Usage,
            Error::Build(_) => ErrorKind::Build,
            Error::Run(_) => ErrorKind::Run,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Io(_) => ErrorKind::Internal,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => exit_code::USAGE,
            Error::Build(_) => exit_code::BUILD_FAILED,
            Error::Run(_) => exit_code::RUN_FAILED,
            Error::Cancelled(err) => exit_code::SIGNAL_BASE + err.signal.number(),
            Error::Io(_) => exit_code::INTERNAL,
        }
    }

    /// Deliberate operator actions are reported with a single line.
    pub fn wants_diagnostics(&self) -> bool {
        self.kind() != ErrorKind::Cancelled
    }
}

fn describe_exit(code: &Option<i32>, signal: &Option<i32>) -> String {
    match (*code, *signal) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("termination by signal {signal}"),
        (None, None) => "abnormal termination".to_string(),
    }
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(":\n{}", stderr.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_kind() {
        let usage: Error = ConfigError::MissingBuildCommand.into();
        let build: Error = BuildError::UnknownTarget("foo".into()).into();
        let run: Error = RunError::UnexpectedExit {
            code: Some(3),
            signal: None,
        }
        .into();
        let cancelled: Error = CancellationError {
            signal: TerminationSignal::Interrupt,
        }
        .into();

        let codes = [
            usage.exit_code(),
            build.exit_code(),
            run.exit_code(),
            cancelled.exit_code(),
        ];
        assert_eq!(codes, [2, 3, 4, 130]);
        assert!(!cancelled.wants_diagnostics());
        assert!(run.wants_diagnostics());
    }

    #[test]
    fn sandbox_hint_only_wraps_unexpected_exits() {
        let wrapped = RunError::UnexpectedExit {
            code: Some(1),
            signal: None,
        }
        .with_sandbox_hint();
        assert!(matches!(wrapped, RunError::PossiblySandboxed(_)));
        assert!(wrapped.to_string().contains("--use-sandbox=false"));
        assert!(wrapped.to_string().contains("exit code 1"));

        let untouched = RunError::SandboxSetup("no minijail".into()).with_sandbox_hint();
        assert!(matches!(untouched, RunError::SandboxSetup(_)));
    }

    #[test]
    fn tool_failure_message_carries_stderr() {
        let err = BuildError::ToolFailed {
            tool: "cmake".into(),
            code: Some(2),
            stderr: "no rule to make target\n".into(),
        };
        assert_eq!(
            err.to_string(),
            "cmake failed (exit code 2):\nno rule to make target"
        );
    }
}
