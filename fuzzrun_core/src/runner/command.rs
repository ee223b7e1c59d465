//! Argument vector and environment of a libFuzzer invocation.
//!
//! The order of arguments is fixed so that invocations are reproducible:
//! `[executable, <engine args>, -dict=<path>, -artifact_prefix=<dir>/,
//! <generated corpus>, <seed corpus dirs...>]`.

use super::RunnerOptions;
use std::ffi::OsString;

/// Set in the fuzz test's environment so it can tell it runs under fuzzrun.
pub const MARKER_ENV: &str = "NO_FUZZRUN";

/// Engine flags that precede the user's own.
pub fn engine_args(options: &RunnerOptions) -> Vec<String> {
    let mut args = vec!["-print_final_stats=1".to_string()];
    if !options.timeout.is_zero() {
        // libFuzzer only accepts whole seconds; round up so it never stops early.
        let secs = options
            .timeout
            .as_secs()
            .saturating_add(u64::from(options.timeout.subsec_nanos() > 0));
        args.push(format!("-max_total_time={secs}"));
    }
    args.extend(options.engine_args.iter().cloned());
    args
}

pub fn fuzzer_argv(options: &RunnerOptions) -> Vec<OsString> {
    let mut argv: Vec<OsString> = vec![options.build.executable.clone().into_os_string()];
    argv.extend(engine_args(options).into_iter().map(OsString::from));

    if let Some(dict) = &options.dictionary {
        let mut arg = OsString::from("-dict=");
        arg.push(dict);
        argv.push(arg);
    }

    let mut prefix = OsString::from("-artifact_prefix=");
    prefix.push(&options.artifacts_dir);
    prefix.push(std::path::MAIN_SEPARATOR_STR);
    argv.push(prefix);

    argv.push(options.build.generated_corpus.clone().into_os_string());
    argv.extend(
        options
            .seed_corpus_dirs
            .iter()
            .map(|dir| dir.clone().into_os_string()),
    );
    argv
}

/// Environment overrides on top of the inherited environment.
pub fn fuzzer_env(options: &RunnerOptions) -> Vec<(String, String)> {
    let color = if options.keep_color { "always" } else { "never" };
    let halt_on_error = if options.recover_ubsan { 0 } else { 1 };

    let mut env = vec![
        (MARKER_ENV.to_string(), "1".to_string()),
        (
            "ASAN_OPTIONS".to_string(),
            append_sanitizer_options(
                std::env::var("ASAN_OPTIONS").ok(),
                &format!("color={color}:detect_leaks=1"),
            ),
        ),
        (
            "UBSAN_OPTIONS".to_string(),
            append_sanitizer_options(
                std::env::var("UBSAN_OPTIONS").ok(),
                &format!("color={color}:print_stacktrace=1:halt_on_error={halt_on_error}"),
            ),
        ),
    ];
    env.extend(options.env_overrides.iter().cloned());
    env
}

/// Our options go last so they win over any inherited value of the same key.
fn append_sanitizer_options(inherited: Option<String>, ours: &str) -> String {
    match inherited {
        Some(existing) if !existing.is_empty() => format!("{existing}:{ours}"),
        _ => ours.to_string(),
    }
}
