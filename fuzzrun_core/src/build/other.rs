use super::{BuildResult, BuildSystem, Builder, BuilderOptions, GENERATED_CORPUS_DIR, tool};
use crate::env::{Environment, Tool};
use crate::error::BuildError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Builds fuzz tests with an arbitrary user-supplied shell command.
///
/// The command sees the requested fuzz test in `FUZZ_TEST` and the sanitizer
/// flags in `CFLAGS`, `CXXFLAGS` and `LDFLAGS`. The fuzz test identifier is
/// either a path to the produced executable or a file name searched for
/// below the project directory.
pub struct OtherBuilder {
    options: BuilderOptions,
    build_command: String,
    shell: PathBuf,
    cc: Option<PathBuf>,
    cxx: Option<PathBuf>,
}

impl OtherBuilder {
    pub fn new(options: BuilderOptions, env: &Environment) -> Result<Self, BuildError> {
        let build_command = options
            .build_command
            .clone()
            .ok_or(BuildError::NoBuildCommand(BuildSystem::Other))?;
        Ok(Self {
            shell: env.require(Tool::Shell)?.to_path_buf(),
            cc: env.tool(Tool::CCompiler).map(Path::to_path_buf),
            cxx: env.tool(Tool::CxxCompiler).map(Path::to_path_buf),
            options,
            build_command,
        })
    }

    fn compile_flags(&self) -> String {
        format!("-g -fsanitize=fuzzer-no-link,{}", self.options.sanitizers.join(","))
    }

    fn link_flags(&self) -> String {
        format!("-fsanitize=fuzzer,{}", self.options.sanitizers.join(","))
    }

    fn run_build_command(&self, target: &str) -> Result<(), BuildError> {
        let mut cmd = Command::new(&self.shell);
        cmd.current_dir(&self.options.project_dir)
            .arg("-c")
            .arg(&self.build_command)
            .env("FUZZ_TEST", target)
            .env("CFLAGS", self.compile_flags())
            .env("CXXFLAGS", self.compile_flags())
            .env("LDFLAGS", self.link_flags());
        if let Some(cc) = &self.cc {
            cmd.env("CC", cc);
        }
        if let Some(cxx) = &self.cxx {
            cmd.env("CXX", cxx);
        }
        tool::run_passthrough("build command", &mut cmd, self.options.stdout_to_stderr)
    }

    /// Resolves the fuzz test identifier to the executable the command produced.
    pub fn find_executable(&self, target: &str) -> Result<PathBuf, BuildError> {
        let direct = self.options.project_dir.join(target);
        if direct.is_file() {
            return Ok(direct.canonicalize()?);
        }

        let file_name = Path::new(target)
            .file_name()
            .ok_or_else(|| BuildError::UnknownTarget(target.to_string()))?;
        let found = WalkDir::new(&self.options.project_dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !is_ignored_dir(entry.file_name()))
            .filter_map(Result::ok)
            .find(|entry| {
                entry.file_type().is_file()
                    && entry.file_name() == file_name
                    && entry
                        .metadata()
                        .map(|m| super::is_executable(&m))
                        .unwrap_or(false)
            });
        match found {
            Some(entry) => Ok(entry.path().canonicalize()?),
            None => Err(BuildError::UnknownTarget(target.to_string())),
        }
    }
}

fn is_ignored_dir(name: &std::ffi::OsStr) -> bool {
    name == ".git" || name == GENERATED_CORPUS_DIR || name == ".fuzzrun-findings"
}

impl Builder for OtherBuilder {
    fn name(&self) -> &'static str {
        "other"
    }

    fn build(&mut self, targets: &[String]) -> Result<HashMap<String, BuildResult>, BuildError> {
        let mut results = HashMap::new();
        for target in targets {
            info!("Building {target}");
            self.run_build_command(target)?;

            let executable = self.find_executable(target)?;
            let name = executable
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| target.clone());
            let seed_corpus = executable
                .parent()
                .unwrap_or(&self.options.project_dir)
                .join(format!("{name}_inputs"));
            debug!(fuzz_test = %target, executable = %executable.display(), "located executable");

            let result = BuildResult {
                generated_corpus: self.options.generated_corpus_for(&name),
                build_dir: self.options.project_dir.clone(),
                seed_corpus,
                executable,
                engine: self.options.engine.clone(),
                sanitizers: self.options.sanitizers.clone(),
                runtime_paths: Vec::new(),
            };
            result.verify_executable()?;
            results.insert(target.clone(), result);
        }
        Ok(results)
    }
}
