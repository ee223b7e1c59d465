//! Line-by-line classification of engine output into findings.
//!
//! The classifier is a single-pass state machine. A line matching a
//! [`Signature`] start pattern opens a finding and every following line is
//! captured into it. The signature's terminator (usually the sanitizer's
//! `SUMMARY:` line) closes the report, after which the classifier lingers in
//! an epilogue so the engine's `Test unit written to` line can still be
//! attached to the finding.

use super::finding::{Finding, FindingKind};
use regex::{Captures, Regex};
use std::path::PathBuf;
use std::sync::LazyLock;
use tracing::debug;

/// Captured lines per finding beyond which output is dropped.
const MAX_CAPTURED_LINES: usize = 1000;

/// Lines after the terminator that are still attributed to the finding.
const MAX_EPILOGUE_LINES: usize = 32;

/// A family of crash reports recognized in the engine output.
pub struct Signature {
    pub name: &'static str,
    pub start: Regex,
    pub terminator: Regex,
    pub classify: fn(&Captures<'_>) -> FindingKind,
}

impl Signature {
    fn new(
        name: &'static str,
        start: &str,
        terminator: &str,
        classify: fn(&Captures<'_>) -> FindingKind,
    ) -> Self {
        Self {
            name,
            start: Regex::new(start).unwrap(),
            terminator: Regex::new(terminator).unwrap(),
            classify,
        }
    }
}

/// Known signatures, tried in order. Specific entries must precede the
/// generic libFuzzer and sanitizer fallbacks at the end.
pub static SIGNATURES: LazyLock<Vec<Signature>> = LazyLock::new(|| {
    vec![
        Signature::new(
            "address-sanitizer",
            r"==\d+==\s*ERROR: AddressSanitizer: ([\w-]+)",
            r"^SUMMARY: AddressSanitizer:",
            |caps| FindingKind::from_asan_bug_type(&caps[1]),
        ),
        Signature::new(
            "leak-sanitizer",
            r"==\d+==\s*ERROR: LeakSanitizer: detected memory leaks",
            r"^SUMMARY: (?:Address|Leak)Sanitizer: \d+ byte",
            |_| FindingKind::Leak,
        ),
        Signature::new(
            "undefined-behavior-sanitizer",
            r"^\S+:\d+(?::\d+)?: runtime error: ",
            r"^SUMMARY: UndefinedBehaviorSanitizer:",
            |_| FindingKind::UndefinedBehavior,
        ),
        Signature::new(
            "libfuzzer-timeout",
            r"==\d+==\s*ERROR: libFuzzer: timeout after",
            r"^SUMMARY: libFuzzer: timeout",
            |_| FindingKind::Timeout,
        ),
        Signature::new(
            "libfuzzer-out-of-memory",
            r"==\d+==\s*ERROR: libFuzzer: out-of-memory",
            r"^SUMMARY: libFuzzer: out-of-memory",
            |_| FindingKind::OutOfMemory,
        ),
        Signature::new(
            "libfuzzer-deadly-signal",
            r"==\d+==\s*ERROR: libFuzzer: deadly signal",
            r"^SUMMARY: libFuzzer: deadly signal",
            |_| FindingKind::DeadlySignal,
        ),
        Signature::new(
            "libfuzzer-target-exited",
            r"==\d+==\s*ERROR: libFuzzer: fuzz target exited",
            r"^SUMMARY: libFuzzer: fuzz target exited",
            |_| FindingKind::UnknownCrash,
        ),
        Signature::new(
            "libfuzzer",
            r"==\d+==\s*ERROR: libFuzzer: ",
            r"^SUMMARY: libFuzzer:",
            |_| FindingKind::UnknownCrash,
        ),
        Signature::new(
            "sanitizer",
            r"==\d+==\s*ERROR: \w+Sanitizer: ",
            r"^SUMMARY: \w+Sanitizer:",
            |_| FindingKind::UnknownCrash,
        ),
    ]
});

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap());

static TEST_UNIT_WRITTEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Test unit written to (\S+)").unwrap());

/// A libFuzzer status line such as `#1024	NEW    cov: 12 ...`.
static STATUS_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#\d+\s").unwrap());

/// Removes terminal color sequences sanitizers emit when color is forced.
pub fn strip_ansi(line: &str) -> std::borrow::Cow<'_, str> {
    ANSI_ESCAPE.replace_all(line, "")
}

#[derive(Debug)]
struct Block {
    signature: &'static str,
    terminator: &'static Regex,
    kind: FindingKind,
    lines: Vec<String>,
    epilogue_lines: usize,
}

impl Block {
    fn push(&mut self, line: &str) {
        if self.lines.len() < MAX_CAPTURED_LINES {
            self.lines.push(line.to_string());
        }
    }

    fn complete(self, input_path: Option<PathBuf>) -> Finding {
        debug!(signature = self.signature, kind = %self.kind, "finding complete");
        Finding::new(self.kind, self.lines.join("\n"), input_path)
    }
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Scanning,
    /// Inside a crash report, before its terminator.
    Capturing(Block),
    /// After the terminator, waiting for the reproducer path.
    Epilogue(Block),
}

#[derive(Debug, Default)]
pub struct Classifier {
    state: State,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a crash report is currently being captured.
    pub fn in_finding(&self) -> bool {
        !matches!(self.state, State::Scanning)
    }

    /// Feeds one output line. Returns the finding this line completed, if any.
    pub fn feed(&mut self, line: &str) -> Option<Finding> {
        let line = strip_ansi(line);
        let line = line.trim_end_matches('\r');

        // A new report always closes the one in progress.
        if let Some(block) = start_block(line) {
            let completed = self.take_block().map(|b| b.complete(None));
            self.state = State::Capturing(block);
            return completed;
        }

        match std::mem::take(&mut self.state) {
            State::Scanning => orphan_reproducer(line),
            State::Capturing(mut block) => {
                block.push(line);
                if let Some(path) = test_unit_path(line) {
                    return Some(block.complete(Some(path)));
                }
                if block.terminator.is_match(line) {
                    self.state = State::Epilogue(block);
                } else {
                    self.state = State::Capturing(block);
                }
                None
            }
            State::Epilogue(mut block) => {
                if STATUS_LINE.is_match(line) {
                    return Some(block.complete(None));
                }
                block.push(line);
                if let Some(path) = test_unit_path(line) {
                    return Some(block.complete(Some(path)));
                }
                block.epilogue_lines += 1;
                if block.epilogue_lines >= MAX_EPILOGUE_LINES {
                    return Some(block.complete(None));
                }
                self.state = State::Epilogue(block);
                None
            }
        }
    }

    /// Flushes a finding whose report was cut off by the end of the stream.
    pub fn finish(&mut self) -> Option<Finding> {
        self.take_block().map(|b| b.complete(None))
    }

    fn take_block(&mut self) -> Option<Block> {
        match std::mem::take(&mut self.state) {
            State::Scanning => None,
            State::Capturing(block) | State::Epilogue(block) => Some(block),
        }
    }
}

fn start_block(line: &str) -> Option<Block> {
    SIGNATURES.iter().find_map(|signature| {
        signature.start.captures(line).map(|caps| Block {
            signature: signature.name,
            terminator: &signature.terminator,
            kind: (signature.classify)(&caps),
            lines: vec![line.to_string()],
            epilogue_lines: 0,
        })
    })
}

fn test_unit_path(line: &str) -> Option<PathBuf> {
    TEST_UNIT_WRITTEN
        .captures(line)
        .map(|caps| PathBuf::from(&caps[1]))
}

/// A reproducer the engine wrote without a report we recognized.
///
/// Only crash artifacts count; slow units and minimized inputs use other
/// file name prefixes.
fn orphan_reproducer(line: &str) -> Option<Finding> {
    let path = test_unit_path(line)?;
    let file_name = path.file_name()?.to_string_lossy().into_owned();
    let kind = [
        ("crash-", FindingKind::UnknownCrash),
        ("leak-", FindingKind::Leak),
        ("timeout-", FindingKind::Timeout),
        ("oom-", FindingKind::OutOfMemory),
    ]
    .into_iter()
    .find_map(|(prefix, kind)| file_name.starts_with(prefix).then_some(kind))?;
    debug!(input = %path.display(), %kind, "reproducer without a recognized report");
    Some(Finding::new(kind, line.to_string(), Some(path)))
}
