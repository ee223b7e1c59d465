use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

/// `#<n>\t<EVENT> ... corp: <c>/<size> ... exec/s: <r>`
static STATUS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#(\d+)\s+\w+").unwrap());
static CORPUS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bcorp: (\d+)/").unwrap());
static RATE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bexec/s: (\d+)").unwrap());

static FINAL_STAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^stat::(\w+):\s+(\d+)").unwrap());

/// Run counters at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Metrics {
    pub executions: u64,
    /// As reported by the engine, or derived from executions over elapsed time.
    pub execs_per_sec: u64,
    /// Corpus entries the engine currently keeps in memory.
    pub corpus_entries: u64,
    #[serde(serialize_with = "secs_f64::serialize")]
    pub elapsed: Duration,
}

/// Accumulates [`Metrics`] from libFuzzer status and final-stat lines.
#[derive(Debug)]
pub struct MetricsParser {
    started: Instant,
    current: Metrics,
    reported_rate: Option<u64>,
}

impl Default for MetricsParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsParser {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            current: Metrics::default(),
            reported_rate: None,
        }
    }

    /// Updates the counters from `line`. Returns true if it was a status line.
    pub fn parse_line(&mut self, line: &str) -> bool {
        if let Some(caps) = FINAL_STAT.captures(line) {
            let value = caps[2].parse().unwrap_or(0);
            match &caps[1] {
                "number_of_executed_units" => self.current.executions = value,
                "average_exec_per_sec" => self.reported_rate = Some(value),
                _ => return false,
            }
            return true;
        }

        let Some(caps) = STATUS.captures(line) else {
            return false;
        };
        if let Ok(executions) = caps[1].parse() {
            self.current.executions = executions;
        }
        if let Some(corpus) = capture_number(&CORPUS, line) {
            self.current.corpus_entries = corpus;
        }
        if let Some(rate) = capture_number(&RATE, line) {
            self.reported_rate = Some(rate);
        }
        true
    }

    pub fn snapshot(&self) -> Metrics {
        self.snapshot_at(self.started.elapsed())
    }

    fn snapshot_at(&self, elapsed: Duration) -> Metrics {
        let derived = match elapsed.as_secs_f64() {
            secs if secs > 0.0 => (self.current.executions as f64 / secs) as u64,
            _ => 0,
        };
        Metrics {
            execs_per_sec: self.reported_rate.filter(|r| *r > 0).unwrap_or(derived),
            elapsed,
            ..self.current
        }
    }
}

fn capture_number(pattern: &Regex, line: &str) -> Option<u64> {
    pattern.captures(line)?[1].parse().ok()
}

/// Serializes durations as fractional seconds.
mod secs_f64 {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}
