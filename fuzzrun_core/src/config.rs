use crate::build::BuildSystem;
use crate::error::ConfigError;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Optional per-project options file, looked up in the project directory.
pub const CONFIG_FILE_NAME: &str = "fuzzrun.toml";

/// Options of one `fuzzrun run` invocation.
///
/// Loaded from [`CONFIG_FILE_NAME`] when present and then overridden by
/// command line flags. Relative paths are resolved against `project_dir`.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RunOptions {
    #[serde(skip)]
    pub project_dir: PathBuf,
    #[serde(skip)]
    pub fuzz_test: String,

    /// Detected from the project layout when unset.
    pub build_system: Option<BuildSystem>,
    /// Shell command building the fuzz test, for `other` projects.
    pub build_command: Option<String>,
    pub build_jobs: Option<u32>,
    pub dict: Option<PathBuf>,
    #[serde(default)]
    pub engine_args: Vec<String>,
    #[serde(default)]
    pub recover_ubsan: bool,
    #[serde(default)]
    pub seed_corpus_dirs: Vec<PathBuf>,
    /// Zero means no limit.
    #[serde(default, deserialize_with = "deserialize_timeout")]
    pub timeout: Duration,
    #[serde(default)]
    pub use_sandbox: bool,
    #[serde(default)]
    pub print_json: bool,
    #[serde(default)]
    pub verbose: bool,
}

impl RunOptions {
    pub fn new(project_dir: impl Into<PathBuf>, fuzz_test: impl Into<String>) -> Self {
        Self {
            project_dir: project_dir.into(),
            fuzz_test: fuzz_test.into(),
            ..Self::default()
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads the project's options file, or defaults when there is none.
    pub fn find_and_load(
        project_dir: &Path,
        fuzz_test: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let path = project_dir.join(CONFIG_FILE_NAME);
        let mut options = if path.is_file() {
            debug!(path = %path.display(), "loading options file");
            Self::load_from_file(&path)?
        } else {
            Self::default()
        };
        options.project_dir = project_dir.to_path_buf();
        options.fuzz_test = fuzz_test.into();
        Ok(options)
    }

    /// Checks the options and fills in the build system.
    ///
    /// Nothing is built or run when this fails.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.seed_corpus_dirs = self
            .seed_corpus_dirs
            .iter()
            .map(|dir| self.project_dir.join(dir))
            .collect();
        for dir in &self.seed_corpus_dirs {
            match std::fs::metadata(dir) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => return Err(ConfigError::SeedCorpusNotADirectory(dir.clone())),
                Err(_) => return Err(ConfigError::SeedCorpusMissing(dir.clone())),
            }
        }

        if let Some(dict) = &self.dict {
            let dict = self.project_dir.join(dict);
            if let Err(source) = std::fs::metadata(&dict) {
                return Err(ConfigError::DictionaryMissing { path: dict, source });
            }
            self.dict = Some(dict);
        }

        let build_system = match self.build_system {
            Some(system) => system,
            None => {
                let detected = BuildSystem::detect(&self.project_dir);
                debug!(build_system = %detected, "detected build system");
                detected
            }
        };
        self.build_system = Some(build_system);
        if build_system == BuildSystem::Other
            && self.build_command.as_deref().is_none_or(|c| c.trim().is_empty())
        {
            return Err(ConfigError::MissingBuildCommand);
        }

        if !self.timeout.is_zero() && self.timeout < Duration::from_secs(1) {
            return Err(ConfigError::TimeoutTooShort(self.timeout));
        }
        Ok(())
    }
}

/// Parses `30s`, `1m 30s`, `500ms` and similar. A bare number means seconds.
pub fn parse_timeout(input: &str) -> Result<Duration, ConfigError> {
    let trimmed = input.trim();
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(trimmed).map_err(|e| ConfigError::InvalidDuration {
        input: input.to_string(),
        reason: e.to_string(),
    })
}

fn deserialize_timeout<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimeout {
        Secs(u64),
        Text(String),
    }

    match RawTimeout::deserialize(deserializer)? {
        RawTimeout::Secs(secs) => Ok(Duration::from_secs(secs)),
        RawTimeout::Text(text) => parse_timeout(&text).map_err(serde::de::Error::custom),
    }
}
