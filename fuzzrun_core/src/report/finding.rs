use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;

/// Fault categories a finding can be classified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FindingKind {
    HeapBufferOverflow,
    StackBufferOverflow,
    GlobalBufferOverflow,
    UseAfterFree,
    DoubleFree,
    Segfault,
    UndefinedBehavior,
    OutOfMemory,
    Timeout,
    Leak,
    DeadlySignal,
    UnknownCrash,
}

impl FindingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingKind::HeapBufferOverflow => "heap-buffer-overflow",
            FindingKind::StackBufferOverflow => "stack-buffer-overflow",
            FindingKind::GlobalBufferOverflow => "global-buffer-overflow",
            FindingKind::UseAfterFree => "use-after-free",
            FindingKind::DoubleFree => "double-free",
            FindingKind::Segfault => "segfault",
            FindingKind::UndefinedBehavior => "undefined-behavior",
            FindingKind::OutOfMemory => "out-of-memory",
            FindingKind::Timeout => "timeout",
            FindingKind::Leak => "leak",
            FindingKind::DeadlySignal => "deadly-signal",
            FindingKind::UnknownCrash => "unknown-crash",
        }
    }

    /// Maps the bug type AddressSanitizer prints after `ERROR: AddressSanitizer:`.
    pub fn from_asan_bug_type(bug_type: &str) -> FindingKind {
        match bug_type {
            "heap-buffer-overflow" => FindingKind::HeapBufferOverflow,
            "stack-buffer-overflow" | "stack-buffer-underflow" => FindingKind::StackBufferOverflow,
            "global-buffer-overflow" => FindingKind::GlobalBufferOverflow,
            "heap-use-after-free" | "stack-use-after-return" | "stack-use-after-scope" => {
                FindingKind::UseAfterFree
            }
            "attempting" | "double-free" => FindingKind::DoubleFree,
            "SEGV" => FindingKind::Segfault,
            "allocation-size-too-big" | "out-of-memory" => FindingKind::OutOfMemory,
            _ => FindingKind::UnknownCrash,
        }
    }
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static STACK_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*#\d+\s+0x[0-9a-fA-F]+\s+in\s+(\S+)").unwrap()
});

/// One observed fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    /// Engine output from the signature line up to the end of the report.
    pub raw_output: String,
    /// Reproducing input, if the engine wrote one.
    pub input_path: Option<PathBuf>,
    /// Hex md5 over the kind and the stack frames.
    pub fingerprint: String,
}

impl Finding {
    pub fn new(kind: FindingKind, raw_output: String, input_path: Option<PathBuf>) -> Self {
        let fingerprint = fingerprint(kind, &raw_output);
        Self {
            kind,
            raw_output,
            input_path,
            fingerprint,
        }
    }

    /// Stable short name, e.g. `heap-buffer-overflow-1f3870be27`.
    pub fn name(&self) -> String {
        let short = self.fingerprint.get(..10).unwrap_or(&self.fingerprint);
        format!("{}-{short}", self.kind)
    }
}

/// Frames are hashed without their addresses so that the same bug found
/// again under ASLR yields the same fingerprint.
fn fingerprint(kind: FindingKind, raw_output: &str) -> String {
    let mut context = md5::Context::new();
    context.consume(kind.as_str().as_bytes());
    for line in raw_output.lines() {
        if let Some(caps) = STACK_FRAME.captures(line) {
            context.consume(b"\n");
            context.consume(caps[1].as_bytes());
        }
    }
    format!("{:x}", context.compute())
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "==42==ERROR: AddressSanitizer: heap-buffer-overflow on address 0x602000000011
    #0 0x55d1e6 in parse_header /src/parser.c:41:12
    #1 0x55d2a0 in LLVMFuzzerTestOneInput /src/fuzz.c:10:3 (fuzz_test+0x1234)
SUMMARY: AddressSanitizer: heap-buffer-overflow /src/parser.c:41:12 in parse_header";

    #[test]
    fn fingerprint_ignores_addresses() {
        let a = Finding::new(FindingKind::HeapBufferOverflow, REPORT.to_string(), None);
        let moved = REPORT.replace("0x55d1e6", "0x7f0011").replace("==42==", "==7==");
        let b = Finding::new(FindingKind::HeapBufferOverflow, moved, None);
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.fingerprint.len(), 32);

        let other_kind = Finding::new(FindingKind::UseAfterFree, REPORT.to_string(), None);
        assert_ne!(a.fingerprint, other_kind.fingerprint);
    }

    #[test]
    fn name_combines_kind_and_fingerprint_prefix() {
        let finding = Finding::new(FindingKind::Leak, REPORT.to_string(), None);
        let name = finding.name();
        assert!(name.starts_with("leak-"));
        assert_eq!(name.len(), "leak-".len() + 10);
    }

    #[test]
    fn asan_bug_types_map_to_kinds() {
        assert_eq!(
            FindingKind::from_asan_bug_type("heap-use-after-free"),
            FindingKind::UseAfterFree
        );
        assert_eq!(FindingKind::from_asan_bug_type("SEGV"), FindingKind::Segfault);
        assert_eq!(
            FindingKind::from_asan_bug_type("container-overflow"),
            FindingKind::UnknownCrash
        );
    }

    #[test]
    fn kinds_serialize_in_kebab_case() {
        assert_eq!(
            serde_json::to_string(&FindingKind::UndefinedBehavior).unwrap(),
            "\"undefined-behavior\""
        );
    }
}
