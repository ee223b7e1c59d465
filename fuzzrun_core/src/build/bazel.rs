use super::{BuildResult, Builder, BuilderOptions, tool};
use crate::env::{Environment, Tool};
use crate::error::BuildError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Suffix of the runnable target `cc_fuzz_test` generates next to the logical one.
const BINARY_SUFFIX: &str = "_bin";

const RULES_FUZZING: &str = "@rules_fuzzing//fuzzing";

/// Builds `cc_fuzz_test` targets with Bazel and `rules_fuzzing`.
pub struct BazelBuilder {
    options: BuilderOptions,
    bazel: PathBuf,
}

impl BazelBuilder {
    pub fn new(options: BuilderOptions, env: &Environment) -> Result<Self, BuildError> {
        let bazel = env.require(Tool::Bazel)?.to_path_buf();
        Ok(Self { options, bazel })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.bazel);
        cmd.current_dir(&self.options.project_dir);
        cmd
    }

    /// Maps a logical fuzz test name to the label that must actually be run.
    ///
    /// `cc_fuzz_test(name = "foo")` defines `foo`, `foo_bin` and more; users may
    /// name either, but only `foo_bin` produces the fuzzer binary.
    pub fn resolve_label(&self, target: &str) -> Result<String, BuildError> {
        if !target.ends_with(BINARY_SUFFIX) {
            let candidate = format!("{target}{BINARY_SUFFIX}");
            if tool::succeeds("bazel", self.command().arg("query").arg(&candidate))? {
                return Ok(candidate);
            }
        }
        if tool::succeeds("bazel", self.command().arg("query").arg(target))? {
            return Ok(target.to_string());
        }
        Err(BuildError::UnknownTarget(target.to_string()))
    }

    fn info(&self, key: &str) -> Result<PathBuf, BuildError> {
        let value = tool::capture("bazel", self.command().arg("info").arg(key))?;
        Ok(PathBuf::from(value))
    }

    fn sanitizer_setting(&self) -> String {
        let has = |s: &str| self.options.sanitizers.iter().any(|x| x == s);
        match (has("address"), has("undefined")) {
            (true, true) => "asan-ubsan",
            (true, false) => "asan",
            (false, true) => "ubsan",
            (false, false) => "none",
        }
        .to_string()
    }

    fn build_label(&self, label: &str, script_path: &Path) -> Result<(), BuildError> {
        let engine = &self.options.engine;
        let mut cmd = self.command();
        cmd.arg("build")
            .arg("-c")
            .arg("opt")
            .arg("--copt=-g")
            .arg(format!(
                "--{RULES_FUZZING}:cc_engine={RULES_FUZZING}/engines:{engine}"
            ))
            .arg(format!(
                "--{RULES_FUZZING}:cc_engine_instrumentation={engine}"
            ))
            .arg(format!(
                "--{RULES_FUZZING}:cc_engine_sanitizer={}",
                self.sanitizer_setting()
            ))
            .arg(format!("--script_path={}", script_path.display()));
        if let Some(jobs) = self.options.num_jobs {
            cmd.arg(format!("--jobs={jobs}"));
        }
        if self.options.verbose {
            cmd.arg("--subcommands");
        }
        cmd.arg(label);
        tool::run_passthrough("bazel", &mut cmd, self.options.stdout_to_stderr)
    }
}

impl Builder for BazelBuilder {
    fn name(&self) -> &'static str {
        "bazel"
    }

    fn build(&mut self, targets: &[String]) -> Result<HashMap<String, BuildResult>, BuildError> {
        std::fs::create_dir_all(&self.options.temp_dir)?;

        let mut built = Vec::with_capacity(targets.len());
        for target in targets {
            let label = self.resolve_label(target)?;
            // --script_path only accepts a single target per invocation.
            let script_path = self
                .options
                .temp_dir
                .join(format!("{}.sh", sanitize_label(&label)));
            info!("Building {label}");
            self.build_label(&label, &script_path)?;
            built.push((target, label, script_path));
        }

        let build_dir = self.info("execution_root")?;
        // The script generated via --script_path refers into the install
        // base, so the sandbox has to expose it.
        let install_base = self.info("install_base")?;

        let mut results = HashMap::new();
        for (target, label, script_path) in built {
            let (package, name) = split_label(&label);
            let name = name.strip_suffix(BINARY_SUFFIX).unwrap_or(name);
            let result = BuildResult {
                executable: script_path,
                build_dir: build_dir.clone(),
                generated_corpus: self.options.generated_corpus_for(name),
                seed_corpus: self
                    .options
                    .project_dir
                    .join(package)
                    .join(format!("{name}_inputs")),
                engine: self.options.engine.clone(),
                sanitizers: self.options.sanitizers.clone(),
                runtime_paths: vec![install_base.clone()],
            };
            result.verify_executable()?;
            debug!(fuzz_test = %target, label = %label, "built bazel fuzz test");
            results.insert(target.clone(), result);
        }
        Ok(results)
    }
}

/// Splits `//pkg/sub:name` into (`pkg/sub`, `name`). Labels without a package
/// refer to the root package.
fn split_label(label: &str) -> (&str, &str) {
    let label = label.strip_prefix("//").unwrap_or(label);
    match label.rsplit_once(':') {
        Some((package, name)) => (package, name),
        None => match label.rsplit_once('/') {
            // `//pkg/name` is shorthand for `//pkg/name:name`.
            Some(_) => (label, label.rsplit('/').next().unwrap_or(label)),
            None => ("", label),
        },
    }
}

fn sanitize_label(label: &str) -> String {
    label
        .trim_start_matches(['/', ':'])
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::test_support::write_script;
    use tempfile::tempdir;

    fn fake_bazel(dir: &Path) -> PathBuf {
        let path = dir.join("tools").join("bazel");
        let root = dir.join("bazel-root");
        write_script(
            &path,
            &format!(
                r#"
case "$1" in
  query)
    case "$2" in
      //src:parser_fuzz_test_bin|//src:parser_fuzz_test|//src:plain_bin) exit 0 ;;
      *) echo "ERROR: no such target '$2'" >&2; exit 7 ;;
    esac
    ;;
  build)
    for arg in "$@"; do
      case "$arg" in
        --script_path=*) script="${{arg#--script_path=}}" ;;
      esac
    done
    printf '#!/bin/sh\nexit 0\n' > "$script"
    chmod +x "$script"
    exit 0
    ;;
  info)
    echo "{root}/$2"
    exit 0
    ;;
esac
exit 1
"#,
                root = root.display()
            ),
        );
        path
    }

    fn builder_in(project: &Path) -> BazelBuilder {
        let env = Environment::new().with_tool(Tool::Bazel, fake_bazel(project));
        let mut options = BuilderOptions::new(project, project.join("tmp"));
        options.stdout_to_stderr = true;
        BazelBuilder::new(options, &env).unwrap()
    }

    #[test]
    fn logical_name_resolves_to_bin_target() {
        let project = tempdir().unwrap();
        let builder = builder_in(project.path());
        assert_eq!(
            builder.resolve_label("//src:parser_fuzz_test").unwrap(),
            "//src:parser_fuzz_test_bin"
        );
        assert_eq!(
            builder.resolve_label("//src:plain_bin").unwrap(),
            "//src:plain_bin"
        );
        assert!(matches!(
            builder.resolve_label("//src:missing"),
            Err(BuildError::UnknownTarget(_))
        ));
    }

    #[test]
    fn bazel_build_produces_runnable_script_and_conventions() {
        let project = tempdir().unwrap();
        let mut builder = builder_in(project.path());
        let target = "//src:parser_fuzz_test".to_string();

        let results = builder.build(std::slice::from_ref(&target)).unwrap();
        let result = &results[&target];
        assert!(result.verify_executable().is_ok());
        assert_eq!(
            result.executable,
            project.path().join("tmp").join("src_parser_fuzz_test_bin.sh")
        );
        assert_eq!(
            result.build_dir,
            project.path().join("bazel-root").join("execution_root")
        );
        assert_eq!(
            result.runtime_paths,
            vec![project.path().join("bazel-root").join("install_base")]
        );
        assert_eq!(
            result.seed_corpus,
            project.path().join("src").join("parser_fuzz_test_inputs")
        );
        assert_eq!(
            result.generated_corpus,
            project.path().join(".fuzzrun-corpus").join("parser_fuzz_test")
        );

        let again = builder.build(std::slice::from_ref(&target)).unwrap();
        assert_eq!(results[&target], again[&target]);
    }

    #[test]
    fn labels_split_into_package_and_name() {
        assert_eq!(split_label("//src/fuzz:parser"), ("src/fuzz", "parser"));
        assert_eq!(split_label(":parser"), ("", "parser"));
        assert_eq!(split_label("parser"), ("", "parser"));
        assert_eq!(split_label("//src/parser"), ("src/parser", "parser"));
        assert_eq!(sanitize_label("//src/fuzz:parser_bin"), "src_fuzz_parser_bin");
    }
}
