pub mod bazel;
pub mod cmake;
pub mod other;
mod tool;

use crate::env::Environment;
use crate::error::{BuildError, ConfigError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub use bazel::BazelBuilder;
pub use cmake::CMakeBuilder;
pub use other::OtherBuilder;

/// The only fuzzing engine builders currently instrument for.
pub const ENGINE_LIBFUZZER: &str = "libfuzzer";

/// Directory (relative to the project) where generated corpora accumulate.
pub const GENERATED_CORPUS_DIR: &str = ".fuzzrun-corpus";

/// Normalized output of every builder.
///
/// A `BuildResult` is created once per built target and never mutated
/// afterwards; run sessions share it instead of owning the artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildResult {
    /// Absolute path of the runnable fuzz test.
    pub executable: PathBuf,
    /// Tree the build produced; exposed read-only inside the sandbox.
    pub build_dir: PathBuf,
    /// Where the engine stores new inputs. Created by the run if absent.
    pub generated_corpus: PathBuf,
    /// Conventional seed corpus location. May not exist.
    pub seed_corpus: PathBuf,
    pub engine: String,
    pub sanitizers: Vec<String>,
    /// Additional directories the executable needs at runtime.
    pub runtime_paths: Vec<PathBuf>,
}

impl BuildResult {
    /// Fails unless the executable exists and has an execute bit set.
    pub fn verify_executable(&self) -> Result<(), BuildError> {
        let metadata = match std::fs::metadata(&self.executable) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BuildError::ExecutableMissing(self.executable.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        if !metadata.is_file() || !is_executable(&metadata) {
            return Err(BuildError::NotExecutable(self.executable.clone()));
        }
        Ok(())
    }
}

#[cfg(unix)]
pub(crate) fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
pub(crate) fn is_executable(metadata: &std::fs::Metadata) -> bool {
    metadata.is_file()
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum BuildSystem {
    #[serde(rename = "cmake")]
    CMake,
    Bazel,
    Other,
}

impl BuildSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildSystem::CMake => "cmake",
            BuildSystem::Bazel => "bazel",
            BuildSystem::Other => "other",
        }
    }

    /// Guesses the build system from marker files in the project root.
    pub fn detect(project_dir: &Path) -> BuildSystem {
        if project_dir.join("CMakeLists.txt").is_file() {
            return BuildSystem::CMake;
        }
        let bazel_markers = ["WORKSPACE", "WORKSPACE.bazel", "MODULE.bazel"];
        if bazel_markers
            .iter()
            .any(|marker| project_dir.join(marker).is_file())
        {
            return BuildSystem::Bazel;
        }
        BuildSystem::Other
    }
}

impl fmt::Display for BuildSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildSystem {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cmake" => Ok(BuildSystem::CMake),
            "bazel" => Ok(BuildSystem::Bazel),
            "other" => Ok(BuildSystem::Other),
            _ => Err(ConfigError::UnknownBuildSystem(s.to_string())),
        }
    }
}

/// Sanitizers every build is instrumented with. Not user-configurable yet.
pub fn default_sanitizers() -> Vec<String> {
    sanitizers_for(std::env::consts::OS)
}

fn sanitizers_for(os: &str) -> Vec<String> {
    let mut sanitizers = vec!["address".to_string()];
    // MSVC has no UBSan runtime.
    if os != "windows" {
        sanitizers.push("undefined".to_string());
    }
    sanitizers
}

/// Rejects build systems that cannot run on the given OS.
pub fn check_platform(system: BuildSystem, os: &'static str) -> Result<(), BuildError> {
    if os == "windows" && system != BuildSystem::CMake {
        return Err(BuildError::UnsupportedPlatform { system, platform: os });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct BuilderOptions {
    pub project_dir: PathBuf,
    pub engine: String,
    pub sanitizers: Vec<String>,
    /// `None` leaves parallelism to the build tool's default.
    pub num_jobs: Option<u32>,
    pub build_command: Option<String>,
    /// Scratch space owned by the current run.
    pub temp_dir: PathBuf,
    /// Send build tool stdout to stderr so stdout stays machine-readable.
    pub stdout_to_stderr: bool,
    pub verbose: bool,
}

impl BuilderOptions {
    pub fn new(project_dir: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            engine: ENGINE_LIBFUZZER.to_string(),
            sanitizers: default_sanitizers(),
            num_jobs: None,
            build_command: None,
            temp_dir: temp_dir.into(),
            stdout_to_stderr: false,
            verbose: false,
        }
    }

    fn generated_corpus_for(&self, name: &str) -> PathBuf {
        self.project_dir.join(GENERATED_CORPUS_DIR).join(name)
    }
}

/// Builds fuzz tests with one particular build system.
pub trait Builder {
    fn name(&self) -> &'static str;

    /// Builds the given targets and returns one result per requested identifier,
    /// keyed by the identifier exactly as it was passed in.
    fn build(&mut self, targets: &[String]) -> Result<HashMap<String, BuildResult>, BuildError>;
}

/// Creates the builder variant for `system`.
pub fn new_builder(
    system: BuildSystem,
    options: BuilderOptions,
    env: &Environment,
) -> Result<Box<dyn Builder>, BuildError> {
    check_platform(system, std::env::consts::OS)?;
    let builder: Box<dyn Builder> = match system {
        BuildSystem::CMake => Box::new(CMakeBuilder::new(options, env)?),
        BuildSystem::Bazel => Box::new(BazelBuilder::new(options, env)?),
        BuildSystem::Other => Box::new(OtherBuilder::new(options, env)?),
    };
    Ok(builder)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::fs;
    use std::path::Path;

    /// Writes an executable shell script.
    pub fn write_script(path: &Path, body: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sanitizer_policy_drops_ubsan_on_windows() {
        assert_eq!(sanitizers_for("linux"), vec!["address", "undefined"]);
        assert_eq!(sanitizers_for("windows"), vec!["address"]);
    }

    #[test]
    fn only_cmake_is_allowed_on_windows() {
        assert!(check_platform(BuildSystem::CMake, "windows").is_ok());
        assert!(check_platform(BuildSystem::Bazel, "linux").is_ok());
        match check_platform(BuildSystem::Bazel, "windows") {
            Err(BuildError::UnsupportedPlatform { system, platform }) => {
                assert_eq!(system, BuildSystem::Bazel);
                assert_eq!(platform, "windows");
            }
            other => panic!("Expected UnsupportedPlatform, got {other:?}"),
        }
        assert!(check_platform(BuildSystem::Other, "windows").is_err());
    }

    #[test]
    fn build_system_detection_uses_marker_files() {
        let dir = tempdir().unwrap();
        assert_eq!(BuildSystem::detect(dir.path()), BuildSystem::Other);

        fs_write(dir.path(), "MODULE.bazel");
        assert_eq!(BuildSystem::detect(dir.path()), BuildSystem::Bazel);

        fs_write(dir.path(), "CMakeLists.txt");
        assert_eq!(BuildSystem::detect(dir.path()), BuildSystem::CMake);
    }

    #[test]
    fn build_system_parses_case_insensitively() {
        assert_eq!("CMake".parse::<BuildSystem>().unwrap(), BuildSystem::CMake);
        assert_eq!("other".parse::<BuildSystem>().unwrap(), BuildSystem::Other);
        assert!(matches!(
            "make".parse::<BuildSystem>(),
            Err(ConfigError::UnknownBuildSystem(_))
        ));
    }

    #[test]
    fn verify_executable_distinguishes_missing_and_non_executable() {
        let dir = tempdir().unwrap();
        let mut result = BuildResult {
            executable: dir.path().join("missing"),
            build_dir: dir.path().to_path_buf(),
            generated_corpus: dir.path().join("corpus"),
            seed_corpus: dir.path().join("seeds"),
            engine: ENGINE_LIBFUZZER.to_string(),
            sanitizers: default_sanitizers(),
            runtime_paths: Vec::new(),
        };
        assert!(matches!(
            result.verify_executable(),
            Err(BuildError::ExecutableMissing(_))
        ));

        let plain = dir.path().join("plain");
        std::fs::write(&plain, "data").unwrap();
        result.executable = plain;
        #[cfg(unix)]
        assert!(matches!(
            result.verify_executable(),
            Err(BuildError::NotExecutable(_))
        ));

        let script = dir.path().join("fuzz_test");
        test_support::write_script(&script, "exit 0");
        result.executable = script;
        assert!(result.verify_executable().is_ok());
    }

    fn fs_write(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), "").unwrap();
    }
}
