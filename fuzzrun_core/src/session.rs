use crate::build::{BuildResult, BuildSystem, BuilderOptions, new_builder};
use crate::config::RunOptions;
use crate::coordinator::{self, CancellationSource};
use crate::env::{Environment, Tool};
use crate::error::{BuildError, Error, RunError, exit_code};
use crate::report::{
    FINDINGS_DIR, Finding, ReportHandler, ReportHandlerOptions, Summary, count_seeds,
};
use crate::runner::{RunOutcome, Runner, RunnerOptions, TerminationCause};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Result of a run that reached its end without an error.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub build: Arc<BuildResult>,
    pub outcome: RunOutcome,
    /// In the order the engine reported them.
    pub findings: Vec<Finding>,
    pub summary: Summary,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        if self.findings.is_empty() {
            exit_code::OK
        } else {
            exit_code::FINDINGS
        }
    }
}

/// Builds one fuzz test and runs it once.
pub struct RunSession {
    options: RunOptions,
    env: Environment,
    cause: Option<TerminationCause>,
}

impl RunSession {
    /// Validates `options`; a session never starts with invalid options.
    pub fn new(mut options: RunOptions, env: Environment) -> Result<Self, Error> {
        options.validate()?;
        Ok(Self {
            options,
            env,
            cause: None,
        })
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// How the last run ended, once it has.
    pub fn termination_cause(&self) -> Option<TerminationCause> {
        self.cause
    }

    pub async fn run<S: CancellationSource>(&mut self, source: &mut S) -> Result<RunReport, Error> {
        self.run_with_writer(source, Box::new(std::io::stdout())).await
    }

    /// Like [`RunSession::run`], printing the report to `out`.
    pub async fn run_with_writer<S: CancellationSource>(
        &mut self,
        source: &mut S,
        out: Box<dyn Write + Send>,
    ) -> Result<RunReport, Error> {
        // Removed on every exit path when dropped.
        let temp_dir = tempfile::Builder::new().prefix("fuzzrun-run-").tempdir()?;
        debug!(temp_dir = %temp_dir.path().display(), "created run directory");

        let mut build = self.build(&temp_dir)?;
        std::fs::create_dir_all(&build.generated_corpus)?;
        build.generated_corpus = build.generated_corpus.canonicalize()?;
        let build = Arc::new(build);

        let mut runner = Runner::new(self.runner_options(build.clone(), &temp_dir)?);
        let mut corpus_dirs = runner.options().seed_corpus_dirs.clone();
        corpus_dirs.push(build.generated_corpus.clone());

        let mut handler = ReportHandler::with_writer(
            ReportHandlerOptions {
                findings_dir: self.findings_dir(),
                print_json: self.options.print_json,
                verbose: self.options.verbose,
                ..ReportHandlerOptions::new(&self.options.project_dir)
            },
            out,
        );

        info!("Running {}", self.options.fuzz_test);
        let result = coordinator::supervise(&mut runner, &mut handler, source)
            .await
            .map_err(|err| match err {
                Error::Run(err) if self.options.use_sandbox => Error::Run(err.with_sandbox_hint()),
                other => other,
            });

        match result {
            Ok(outcome) => {
                self.record_cause(outcome.cause);
                let summary = print_report(&mut handler, &corpus_dirs)?;
                Ok(RunReport {
                    build,
                    outcome,
                    findings: handler.findings().to_vec(),
                    summary,
                })
            }
            // A run the operator stopped still reports what it found so far.
            Err(err @ Error::Cancelled(_)) => {
                self.record_cause(TerminationCause::Signaled);
                print_report(&mut handler, &corpus_dirs)?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn record_cause(&mut self, cause: TerminationCause) {
        match self.cause {
            None => self.cause = Some(cause),
            Some(previous) => warn!(?previous, ?cause, "termination cause already recorded"),
        }
    }

    fn findings_dir(&self) -> PathBuf {
        self.options.project_dir.join(FINDINGS_DIR)
    }

    fn build(&self, temp_dir: &TempDir) -> Result<BuildResult, Error> {
        let system = self
            .options
            .build_system
            .unwrap_or_else(|| BuildSystem::detect(&self.options.project_dir));
        let mut builder_options =
            BuilderOptions::new(&self.options.project_dir, temp_dir.path().join("build"));
        builder_options.num_jobs = self.options.build_jobs;
        builder_options.build_command = self.options.build_command.clone();
        builder_options.stdout_to_stderr = self.options.print_json;
        builder_options.verbose = self.options.verbose;

        let mut builder = new_builder(system, builder_options, &self.env)?;
        info!("Building {} with {}", self.options.fuzz_test, builder.name());
        let target = self.options.fuzz_test.clone();
        let mut results = builder.build(std::slice::from_ref(&target))?;
        let build = results
            .remove(&target)
            .ok_or_else(|| BuildError::UnknownTarget(target.clone()))?;
        build.verify_executable()?;
        Ok(build)
    }

    fn runner_options(
        &self,
        build: Arc<BuildResult>,
        temp_dir: &TempDir,
    ) -> Result<RunnerOptions, Error> {
        let findings_dir = self.findings_dir();
        std::fs::create_dir_all(&findings_dir)?;
        let scratch = temp_dir.path().join("scratch");
        std::fs::create_dir_all(&scratch)?;

        let mut seed_corpus_dirs = self.options.seed_corpus_dirs.clone();
        if build.seed_corpus.is_dir() && !seed_corpus_dirs.contains(&build.seed_corpus) {
            seed_corpus_dirs.push(build.seed_corpus.clone());
        }

        let sandbox = if self.options.use_sandbox {
            let minijail = self.env.tool(Tool::Minijail).ok_or_else(|| {
                RunError::SandboxSetup(format!(
                    "{} not found in PATH",
                    Tool::Minijail.binary_name()
                ))
            })?;
            Some(minijail.to_path_buf())
        } else {
            None
        };

        Ok(RunnerOptions {
            dictionary: self.options.dict.clone(),
            engine_args: self.options.engine_args.clone(),
            seed_corpus_dirs,
            artifacts_dir: findings_dir.canonicalize()?,
            timeout: self.options.timeout,
            recover_ubsan: self.options.recover_ubsan,
            keep_color: !self.options.print_json,
            env_overrides: vec![("TMPDIR".to_string(), scratch.display().to_string())],
            sandbox,
            read_only_bindings: Vec::new(),
            read_write_bindings: vec![scratch],
            temp_dir: temp_dir.path().to_path_buf(),
            build,
        })
    }
}

fn print_report(handler: &mut ReportHandler, corpus_dirs: &[PathBuf]) -> Result<Summary, Error> {
    handler.print_crashing_input_note()?;
    Ok(handler.print_final_metrics(count_seeds(corpus_dirs))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::test_support::write_script;
    use crate::coordinator::{NeverCancel, TerminationSignal};
    use crate::error::ConfigError;
    use std::time::Duration;
    use tempfile::tempdir;

    fn shell_env() -> Environment {
        Environment::new().with_tool(Tool::Shell, "/bin/sh")
    }

    #[test]
    fn invalid_options_never_create_a_session() {
        let project = tempdir().unwrap();
        let mut options = RunOptions::new(project.path(), "t");
        options.build_system = Some(BuildSystem::Other);
        options.build_command = Some("true".into());
        options.timeout = Duration::from_millis(10);
        assert!(matches!(
            RunSession::new(options, shell_env()),
            Err(Error::Config(ConfigError::TimeoutTooShort(_)))
        ));
    }

    #[tokio::test]
    async fn build_failure_aborts_before_running() {
        let project = tempdir().unwrap();
        let mut options = RunOptions::new(project.path(), "t");
        options.build_system = Some(BuildSystem::Other);
        options.build_command = Some("exit 2".into());
        let mut session = RunSession::new(options, shell_env()).unwrap();

        let result = session
            .run_with_writer(&mut NeverCancel, Box::new(std::io::sink()))
            .await;
        assert!(matches!(result, Err(Error::Build(BuildError::ToolFailed { .. }))));
        assert_eq!(session.termination_cause(), None);
        assert!(!project.path().join(FINDINGS_DIR).exists());
    }

    #[tokio::test]
    async fn missing_sandbox_helper_is_a_setup_error() {
        let project = tempdir().unwrap();
        write_script(&project.path().join("fuzz_test"), "exit 0");
        let mut options = RunOptions::new(project.path(), "fuzz_test");
        options.build_system = Some(BuildSystem::Other);
        options.build_command = Some("true".into());
        options.use_sandbox = true;
        let mut session = RunSession::new(options, shell_env()).unwrap();

        let result = session
            .run_with_writer(&mut NeverCancel, Box::new(std::io::sink()))
            .await;
        assert!(matches!(
            result,
            Err(Error::Run(RunError::SandboxSetup(_)))
        ));
    }

    #[tokio::test]
    async fn sandboxed_unexpected_exit_carries_a_hint() {
        let project = tempdir().unwrap();
        write_script(&project.path().join("fuzz_test"), "exit 0");
        // Stands in for minijail0: rejects every invocation.
        let minijail = project.path().join("tools").join("minijail0");
        write_script(&minijail, "echo 'libminijail: mount failed' >&2\nexit 1");
        let mut options = RunOptions::new(project.path(), "fuzz_test");
        options.build_system = Some(BuildSystem::Other);
        options.build_command = Some("true".into());
        options.use_sandbox = true;
        let env = shell_env().with_tool(Tool::Minijail, &minijail);
        let mut session = RunSession::new(options, env).unwrap();

        let err = session
            .run_with_writer(&mut NeverCancel, Box::new(std::io::sink()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Run(RunError::PossiblySandboxed(_))));
        assert!(err.to_string().contains("--use-sandbox=false"));
    }

    /// Remembers whether the build output existed when it was armed.
    struct BuildAwareSource {
        marker: PathBuf,
        armed_after_build: Option<bool>,
    }

    impl CancellationSource for BuildAwareSource {
        fn arm(&mut self) -> std::io::Result<()> {
            self.armed_after_build = Some(self.marker.exists());
            Ok(())
        }

        async fn wait(&mut self) -> Option<TerminationSignal> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn cancellation_is_armed_only_once_the_build_is_done() {
        let project = tempdir().unwrap();
        write_script(&project.path().join("fuzz_test"), "exit 0");
        let mut options = RunOptions::new(project.path(), "fuzz_test");
        options.build_system = Some(BuildSystem::Other);
        options.build_command = Some("touch built".into());
        let mut session = RunSession::new(options, shell_env()).unwrap();
        let mut source = BuildAwareSource {
            marker: project.path().join("built"),
            armed_after_build: None,
        };

        session
            .run_with_writer(&mut source, Box::new(std::io::sink()))
            .await
            .unwrap();
        assert_eq!(source.armed_after_build, Some(true));
    }

    #[tokio::test]
    async fn failed_build_never_arms_cancellation() {
        let project = tempdir().unwrap();
        let mut options = RunOptions::new(project.path(), "t");
        options.build_system = Some(BuildSystem::Other);
        options.build_command = Some("exit 2".into());
        let mut session = RunSession::new(options, shell_env()).unwrap();
        let mut source = BuildAwareSource {
            marker: project.path().join("built"),
            armed_after_build: None,
        };

        let result = session
            .run_with_writer(&mut source, Box::new(std::io::sink()))
            .await;
        assert!(matches!(result, Err(Error::Build(_))));
        assert_eq!(source.armed_after_build, None);
    }
}
