use fuzzrun_core::config::parse_timeout;
use fuzzrun_core::{
    BuildSystem, Environment, Error as CoreError, OsSignals, RunOptions, RunSession, exit_code,
};

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Build and run fuzz tests", long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a fuzz test and run it under libFuzzer
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Fuzz test to run, as understood by the project's build system
    fuzz_test: String,

    /// Project root directory
    #[clap(short = 'C', long, default_value = ".")]
    directory: PathBuf,

    /// cmake, bazel or other; detected from the project when unset
    #[clap(long, value_parser = parse_build_system)]
    build_system: Option<BuildSystem>,

    /// Command building the fuzz test, for build system "other"
    #[clap(long)]
    build_command: Option<String>,

    /// Maximum number of concurrent build jobs
    #[clap(short = 'j', long)]
    build_jobs: Option<u32>,

    /// Dictionary file passed to the engine
    #[clap(long)]
    dict: Option<PathBuf>,

    /// Extra argument passed to the engine verbatim (repeatable)
    #[clap(long = "engine-arg", action = ArgAction::Append, allow_hyphen_values = true)]
    engine_args: Vec<String>,

    /// Additional seed corpus directory (repeatable)
    #[clap(short = 's', long = "seed-corpus", action = ArgAction::Append)]
    seed_corpus_dirs: Vec<PathBuf>,

    /// Maximum fuzzing time, e.g. "30s" or "1h"; 0 for no limit
    #[clap(long, value_parser = parse_timeout_arg)]
    timeout: Option<Duration>,

    /// Keep fuzzing after recoverable UndefinedBehaviorSanitizer errors
    #[clap(long)]
    recover_ubsan: bool,

    /// Run the fuzz test inside a minijail sandbox
    #[clap(long, num_args = 0..=1, default_missing_value = "true")]
    use_sandbox: Option<bool>,

    /// Print line-delimited JSON records to stdout
    #[clap(long)]
    json: bool,

    /// Echo engine output and enable debug logging
    #[clap(short, long)]
    verbose: bool,
}

fn parse_build_system(s: &str) -> Result<BuildSystem, String> {
    s.parse().map_err(|e: fuzzrun_core::ConfigError| e.to_string())
}

fn parse_timeout_arg(s: &str) -> Result<Duration, String> {
    parse_timeout(s).map_err(|e| e.to_string())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Paths given on the command line are relative to the working directory.
fn absolute(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

/// File options first, command line flags on top.
fn resolve_options(args: RunArgs) -> Result<RunOptions, anyhow::Error> {
    let cwd = std::env::current_dir().context("Failed to determine the working directory")?;
    let project_dir = absolute(&args.directory, &cwd)
        .canonicalize()
        .with_context(|| format!("Project directory {:?} is not accessible", args.directory))?;

    let mut options =
        RunOptions::find_and_load(&project_dir, args.fuzz_test).map_err(CoreError::from)?;
    if args.build_system.is_some() {
        options.build_system = args.build_system;
    }
    if args.build_command.is_some() {
        options.build_command = args.build_command;
    }
    if args.build_jobs.is_some() {
        options.build_jobs = args.build_jobs;
    }
    if let Some(dict) = args.dict {
        options.dict = Some(absolute(&dict, &cwd));
    }
    options.engine_args.extend(args.engine_args);
    options
        .seed_corpus_dirs
        .extend(args.seed_corpus_dirs.iter().map(|dir| absolute(dir, &cwd)));
    if let Some(timeout) = args.timeout {
        options.timeout = timeout;
    }
    if let Some(use_sandbox) = args.use_sandbox {
        options.use_sandbox = use_sandbox;
    }
    options.recover_ubsan |= args.recover_ubsan;
    options.print_json |= args.json;
    options.verbose |= args.verbose;
    Ok(options)
}

async fn run(args: RunArgs) -> Result<i32, anyhow::Error> {
    let options = resolve_options(args)?;
    debug!("Effective options: {options:#?}");

    let mut session = RunSession::new(options, Environment::detect())?;
    // Handlers are installed once the build is done; until then an
    // interrupt ends fuzzrun together with the build tool.
    let mut signals = OsSignals::new();
    let report = session.run(&mut signals).await?;
    Ok(report.exit_code())
}

/// Maps an error to an exit code, printing it as the error's kind demands.
fn report_error(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<CoreError>() {
        Some(core) if !core.wants_diagnostics() => {
            eprintln!("{core}");
            core.exit_code()
        }
        Some(core) => {
            error!("{err:#}");
            core.exit_code()
        }
        None => {
            error!("{err:#}");
            exit_code::INTERNAL
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let Command::Run(args) = cli.command;
    init_logging(args.verbose);

    let code = match run(args).await {
        Ok(code) => code,
        Err(err) => report_error(&err),
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuzzrun_core::{CancellationError, ConfigError, TerminationSignal};
    use tempfile::tempdir;

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::parse_from([
            "fuzzrun",
            "run",
            "my_fuzz_test",
            "--build-system",
            "other",
            "--build-command",
            "make",
            "--engine-arg=-runs=10",
            "--engine-arg=-seed=1",
            "--timeout",
            "1m",
            "--use-sandbox",
            "--json",
        ]);
        let Command::Run(args) = cli.command;
        assert_eq!(args.fuzz_test, "my_fuzz_test");
        assert_eq!(args.build_system, Some(BuildSystem::Other));
        assert_eq!(args.engine_args, ["-runs=10", "-seed=1"]);
        assert_eq!(args.timeout, Some(Duration::from_secs(60)));
        assert_eq!(args.use_sandbox, Some(true));
        assert!(args.json);
    }

    #[test]
    fn sandbox_can_be_disabled_explicitly() {
        let cli = Cli::parse_from(["fuzzrun", "run", "t", "--use-sandbox=false"]);
        let Command::Run(args) = cli.command;
        assert_eq!(args.use_sandbox, Some(false));
    }

    #[test]
    fn invalid_flag_values_are_usage_errors() {
        assert!(Cli::try_parse_from(["fuzzrun", "run", "t", "--timeout", "soon"]).is_err());
        assert!(Cli::try_parse_from(["fuzzrun", "run", "t", "--build-system", "make"]).is_err());
    }

    #[test]
    fn flags_override_the_options_file() {
        let project = tempdir().unwrap();
        std::fs::write(
            project.path().join("fuzzrun.toml"),
            "build-system = \"other\"\nbuild-command = \"make\"\ntimeout = \"10s\"\nengine-args = [\"-a\"]\n",
        )
        .unwrap();
        let argv: Vec<std::ffi::OsString> = vec![
            "fuzzrun".into(),
            "run".into(),
            "t".into(),
            "-C".into(),
            project.path().into(),
            "--timeout".into(),
            "20s".into(),
            "--engine-arg=-b".into(),
        ];
        let cli = Cli::parse_from(argv);
        let Command::Run(args) = cli.command;

        let options = resolve_options(args).unwrap();
        assert_eq!(options.build_command.as_deref(), Some("make"));
        assert_eq!(options.timeout, Duration::from_secs(20));
        assert_eq!(options.engine_args, ["-a", "-b"]);
        assert_eq!(options.project_dir, project.path().canonicalize().unwrap());
    }

    #[test]
    fn error_kinds_pick_exit_codes() {
        let cancelled = anyhow::Error::from(CoreError::from(CancellationError {
            signal: TerminationSignal::Terminate,
        }));
        assert_eq!(report_error(&cancelled), 143);

        let usage = anyhow::Error::from(CoreError::from(ConfigError::MissingBuildCommand));
        assert_eq!(report_error(&usage), exit_code::USAGE);

        let other = anyhow::anyhow!("something else");
        assert_eq!(report_error(&other), exit_code::INTERNAL);
    }
}
