use super::{BuildResult, Builder, BuilderOptions, tool};
use crate::env::{Environment, Tool};
use crate::error::BuildError;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Build type used for every configure; fuzzing wants optimized code with symbols.
const BUILD_TYPE: &str = "RelWithDebInfo";

/// Builds fuzz tests declared through the project's CMake integration.
///
/// The integration records, per fuzz test, where the executable and the seed
/// corpus live under `<build dir>/.fuzzrun/fuzz_tests/<name>/`. That is how
/// a logical target name is mapped to the produced binary.
pub struct CMakeBuilder {
    options: BuilderOptions,
    cmake: PathBuf,
    build_dir: PathBuf,
    configured: bool,
}

impl CMakeBuilder {
    pub fn new(options: BuilderOptions, env: &Environment) -> Result<Self, BuildError> {
        let cmake = env.require(Tool::CMake)?.to_path_buf();
        let build_dir = options
            .project_dir
            .join(".fuzzrun-build")
            .join(&options.engine)
            .join(options.sanitizers.join("+"));
        Ok(Self {
            options,
            cmake,
            build_dir,
            configured: false,
        })
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    /// Runs the configure step. Safe to call again, CMake reconfigures in place.
    pub fn configure(&mut self) -> Result<(), BuildError> {
        fs::create_dir_all(&self.build_dir)?;
        let mut cmd = Command::new(&self.cmake);
        cmd.current_dir(&self.options.project_dir)
            .arg("-S")
            .arg(&self.options.project_dir)
            .arg("-B")
            .arg(&self.build_dir)
            .arg(format!("-DCMAKE_BUILD_TYPE={BUILD_TYPE}"))
            .arg(format!("-DFUZZRUN_ENGINE={}", self.options.engine))
            .arg(format!(
                "-DFUZZRUN_SANITIZERS={}",
                self.options.sanitizers.join(";")
            ))
            .arg("-DFUZZRUN_TESTING=ON");
        tool::run_passthrough("cmake", &mut cmd, self.options.stdout_to_stderr)?;
        self.configured = true;
        Ok(())
    }

    fn metadata_dir(&self, name: &str) -> PathBuf {
        self.build_dir.join(".fuzzrun").join("fuzz_tests").join(name)
    }

    fn locate(&self, name: &str) -> Result<BuildResult, BuildError> {
        let meta = self.metadata_dir(name);
        let executable = match read_path(&meta.join("executable"), &self.build_dir)? {
            Some(path) => path,
            None => return Err(BuildError::UnknownTarget(name.to_string())),
        };
        let seed_corpus = read_path(&meta.join("seed_corpus"), &self.build_dir)?
            .unwrap_or_else(|| self.options.project_dir.join(format!("{name}_inputs")));

        debug!(name, executable = %executable.display(), "located cmake fuzz test");
        Ok(BuildResult {
            executable,
            build_dir: self.build_dir.clone(),
            generated_corpus: self.options.generated_corpus_for(name),
            seed_corpus,
            engine: self.options.engine.clone(),
            sanitizers: self.options.sanitizers.clone(),
            runtime_paths: Vec::new(),
        })
    }
}

impl Builder for CMakeBuilder {
    fn name(&self) -> &'static str {
        "cmake"
    }

    fn build(&mut self, targets: &[String]) -> Result<HashMap<String, BuildResult>, BuildError> {
        if !self.configured {
            self.configure()?;
        }

        info!("Building {}", targets.join(", "));
        let mut cmd = Command::new(&self.cmake);
        cmd.current_dir(&self.options.project_dir)
            .arg("--build")
            .arg(&self.build_dir)
            .arg("--config")
            .arg(BUILD_TYPE)
            .arg("--target")
            .args(targets);
        if let Some(jobs) = self.options.num_jobs {
            cmd.arg("--parallel").arg(jobs.to_string());
        }
        tool::run_passthrough("cmake", &mut cmd, self.options.stdout_to_stderr)?;

        let mut results = HashMap::new();
        for target in targets {
            let result = self.locate(target)?;
            result.verify_executable()?;
            results.insert(target.clone(), result);
        }
        Ok(results)
    }
}

/// Reads a path recorded by the CMake integration; relative paths are taken
/// relative to the build directory.
fn read_path(file: &Path, base: &Path) -> Result<Option<PathBuf>, BuildError> {
    match fs::read_to_string(file) {
        Ok(content) => {
            let path = PathBuf::from(content.trim());
            Ok(Some(if path.is_absolute() {
                path
            } else {
                base.join(path)
            }))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::test_support::write_script;
    use tempfile::tempdir;

    /// A stand-in for cmake that "builds" only `my_fuzz_test`, recording
    /// metadata the way the CMake integration does.
    fn fake_cmake(dir: &Path) -> PathBuf {
        let path = dir.join("tools").join("cmake");
        write_script(
            &path,
            r#"
if [ "$1" = "-S" ]; then
  echo "-- Configuring done"
  exit 0
fi
if [ "$1" = "--build" ]; then
  build_dir="$2"
  shift 2
  while [ $# -gt 0 ]; do
    case "$1" in
      --target) target="$2"; shift 2 ;;
      *) shift ;;
    esac
  done
  case "$target" in
    my_fuzz_test) ;;
    silent_target) exit 0 ;;
    *) echo "gmake: *** No rule to make target '$target'.  Stop." >&2; exit 2 ;;
  esac
  mkdir -p "$build_dir/.fuzzrun/fuzz_tests/$target" "$build_dir/bin"
  printf '#!/bin/sh\nexit 0\n' > "$build_dir/bin/$target"
  chmod +x "$build_dir/bin/$target"
  printf 'bin/%s\n' "$target" > "$build_dir/.fuzzrun/fuzz_tests/$target/executable"
  exit 0
fi
exit 1
"#,
        );
        path
    }

    fn builder_in(project: &Path) -> CMakeBuilder {
        let env = Environment::new().with_tool(Tool::CMake, fake_cmake(project));
        let mut options = BuilderOptions::new(project, project.join("tmp"));
        options.stdout_to_stderr = true;
        options.num_jobs = Some(4);
        CMakeBuilder::new(options, &env).unwrap()
    }

    #[test]
    fn cmake_build_locates_executable_through_metadata() {
        let project = tempdir().unwrap();
        let mut builder = builder_in(project.path());

        let results = builder.build(&["my_fuzz_test".to_string()]).unwrap();
        let result = &results["my_fuzz_test"];
        assert_eq!(
            result.executable,
            builder.build_dir().join("bin").join("my_fuzz_test")
        );
        assert!(result.verify_executable().is_ok());
        assert_eq!(
            result.generated_corpus,
            project.path().join(".fuzzrun-corpus").join("my_fuzz_test")
        );
        assert_eq!(
            result.seed_corpus,
            project.path().join("my_fuzz_test_inputs")
        );
        assert!(
            builder
                .build_dir()
                .ends_with(".fuzzrun-build/libfuzzer/address+undefined")
                || builder.build_dir().ends_with(".fuzzrun-build/libfuzzer/address")
        );
        std::fs::create_dir_all(&result.generated_corpus).unwrap();
    }

    #[test]
    fn cmake_build_is_idempotent() {
        let project = tempdir().unwrap();
        let mut builder = builder_in(project.path());
        let first = builder.build(&["my_fuzz_test".to_string()]).unwrap();
        let second = builder.build(&["my_fuzz_test".to_string()]).unwrap();
        assert_eq!(first["my_fuzz_test"], second["my_fuzz_test"]);
    }

    #[test]
    fn cmake_failure_carries_exit_code_and_stderr() {
        let project = tempdir().unwrap();
        let mut builder = builder_in(project.path());
        match builder.build(&["nope".to_string()]) {
            Err(BuildError::ToolFailed { code, stderr, .. }) => {
                assert_eq!(code, Some(2));
                assert!(stderr.contains("No rule to make target 'nope'"));
            }
            other => panic!("Expected ToolFailed, got {other:?}"),
        }
    }

    #[test]
    fn cmake_target_without_metadata_is_unknown() {
        let project = tempdir().unwrap();
        let mut builder = builder_in(project.path());
        match builder.build(&["silent_target".to_string()]) {
            Err(BuildError::UnknownTarget(name)) => assert_eq!(name, "silent_target"),
            other => panic!("Expected UnknownTarget, got {other:?}"),
        }
    }

    #[test]
    fn missing_cmake_is_reported_before_building() {
        let project = tempdir().unwrap();
        let options = BuilderOptions::new(project.path(), project.path().join("tmp"));
        assert!(matches!(
            CMakeBuilder::new(options, &Environment::new()),
            Err(BuildError::ToolMissing { .. })
        ));
    }
}
