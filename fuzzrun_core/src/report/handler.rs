use super::finding::Finding;
use super::metrics::Metrics;
use super::observer::{FindingObserver, MetricsObserver, Observer, ReportEvent};
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Directory (relative to the project) holding persisted findings.
pub const FINDINGS_DIR: &str = ".fuzzrun-findings";

/// Minimum time between two human-readable progress lines.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ReportHandlerOptions {
    /// Every finding is written below this directory.
    pub findings_dir: PathBuf,
    /// Line-delimited JSON records instead of human-readable output.
    pub print_json: bool,
    /// Echo every engine output line.
    pub verbose: bool,
    pub progress_interval: Duration,
}

impl ReportHandlerOptions {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            findings_dir: project_dir.join(FINDINGS_DIR),
            print_json: false,
            verbose: false,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

/// Final numbers of a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub executions: u64,
    pub execs_per_sec: u64,
    /// Non-empty inputs in the seed and generated corpora.
    pub corpus_size: u64,
    pub elapsed_secs: u64,
    pub findings: usize,
}

#[derive(Serialize)]
struct FindingRecord<'a> {
    #[serde(rename = "type")]
    record_type: &'static str,
    name: String,
    #[serde(flatten)]
    finding: &'a Finding,
}

#[derive(Serialize)]
struct SummaryRecord<'a> {
    #[serde(rename = "type")]
    record_type: &'static str,
    #[serde(flatten)]
    summary: &'a Summary,
}

/// Consumes the engine output of one run.
///
/// Lines are fanned out to the observers in order; the events they produce
/// are printed (human or JSON) and findings are persisted as they arrive.
pub struct ReportHandler {
    options: ReportHandlerOptions,
    out: Box<dyn Write + Send>,
    metrics: MetricsObserver,
    observers: Vec<Box<dyn Observer>>,
    findings: Vec<Finding>,
    last_progress: Option<Instant>,
}

impl ReportHandler {
    /// A handler printing to stdout.
    pub fn new(options: ReportHandlerOptions) -> Self {
        Self::with_writer(options, Box::new(io::stdout()))
    }

    pub fn with_writer(options: ReportHandlerOptions, out: Box<dyn Write + Send>) -> Self {
        Self {
            options,
            out,
            metrics: MetricsObserver::new(),
            observers: vec![Box::new(FindingObserver::new())],
            findings: Vec::new(),
            last_progress: None,
        }
    }

    pub fn add_observer(&mut self, observer: Box<dyn Observer>) {
        debug!(observer = observer.name(), "registered observer");
        self.observers.push(observer);
    }

    pub fn options(&self) -> &ReportHandlerOptions {
        &self.options
    }

    /// Findings in the order they were reported.
    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn has_findings(&self) -> bool {
        !self.findings.is_empty()
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.snapshot()
    }

    /// Handles one engine output line.
    pub fn handle_line(&mut self, line: &str) -> io::Result<()> {
        if self.options.verbose && !self.options.print_json {
            writeln!(self.out, "{line}")?;
        } else {
            debug!(target: "fuzzer", "{line}");
        }

        if let Some(event) = self.metrics.observe_line(line) {
            self.handle_event(event)?;
        }
        for i in 0..self.observers.len() {
            if let Some(event) = self.observers[i].observe_line(line) {
                self.handle_event(event)?;
            }
        }
        Ok(())
    }

    /// Flushes events observers were still holding when the output ended.
    pub fn finish(&mut self) -> io::Result<()> {
        if let Some(event) = self.metrics.finish() {
            self.handle_event(event)?;
        }
        for i in 0..self.observers.len() {
            if let Some(event) = self.observers[i].finish() {
                self.handle_event(event)?;
            }
        }
        self.out.flush()
    }

    fn handle_event(&mut self, event: ReportEvent) -> io::Result<()> {
        match event {
            ReportEvent::Finding(finding) => self.handle_finding(finding),
            ReportEvent::Metrics(metrics) => self.print_progress(&metrics),
        }
    }

    fn handle_finding(&mut self, finding: Finding) -> io::Result<()> {
        let name = finding.name();
        info!(finding = %name, kind = %finding.kind, "new finding");
        if let Err(e) = self.persist(&name, &finding) {
            warn!("Failed to store finding {name}: {e}");
        }

        if self.options.print_json {
            let record = FindingRecord {
                record_type: "finding",
                name,
                finding: &finding,
            };
            serde_json::to_writer(&mut self.out, &record)?;
            writeln!(self.out)?;
        } else {
            writeln!(self.out, "Finding {name} ({})", finding.kind)?;
            for line in finding.raw_output.lines() {
                writeln!(self.out, "    {line}")?;
            }
        }
        self.out.flush()?;
        self.findings.push(finding);
        Ok(())
    }

    fn persist(&self, name: &str, finding: &Finding) -> io::Result<()> {
        let dir = self.options.findings_dir.join(name);
        fs::create_dir_all(&dir)?;
        let json = serde_json::to_vec_pretty(finding)?;
        fs::write(dir.join("finding.json"), json)?;
        if let Some(input) = &finding.input_path {
            if input.is_file() {
                fs::copy(input, dir.join("crashing-input"))?;
            } else {
                debug!(input = %input.display(), "crashing input not found, not copied");
            }
        }
        Ok(())
    }

    fn print_progress(&mut self, metrics: &Metrics) -> io::Result<()> {
        if self.options.print_json {
            return Ok(());
        }
        let due = self
            .last_progress
            .is_none_or(|at| at.elapsed() >= self.options.progress_interval);
        if !due {
            return Ok(());
        }
        self.last_progress = Some(Instant::now());
        writeln!(
            self.out,
            "#{} exec/s: {} corpus: {}",
            metrics.executions, metrics.execs_per_sec, metrics.corpus_entries
        )
    }

    /// Where reproducers of this run's findings were stored, if any were.
    pub fn crashing_input_note(&self) -> Option<String> {
        let stored = self
            .findings
            .iter()
            .filter(|f| f.input_path.as_ref().is_some_and(|p| p.is_file()))
            .count();
        if stored == 0 {
            return None;
        }
        Some(format!(
            "Stored {stored} crashing input(s) in {}",
            self.options.findings_dir.display()
        ))
    }

    /// Prints the crashing input note in human mode.
    pub fn print_crashing_input_note(&mut self) -> io::Result<()> {
        if self.options.print_json {
            return Ok(());
        }
        if let Some(note) = self.crashing_input_note() {
            writeln!(self.out, "{note}")?;
        }
        Ok(())
    }

    /// Prints the final summary and returns it.
    pub fn print_final_metrics(&mut self, corpus_size: u64) -> io::Result<Summary> {
        let metrics = self.metrics();
        let summary = Summary {
            executions: metrics.executions,
            execs_per_sec: metrics.execs_per_sec,
            corpus_size,
            elapsed_secs: metrics.elapsed.as_secs(),
            findings: self.findings.len(),
        };

        if self.options.print_json {
            let record = SummaryRecord {
                record_type: "summary",
                summary: &summary,
            };
            serde_json::to_writer(&mut self.out, &record)?;
            writeln!(self.out)?;
        } else {
            let elapsed = humantime::format_duration(Duration::from_secs(summary.elapsed_secs));
            writeln!(self.out, "Executions: {}", summary.executions)?;
            writeln!(self.out, "Executions/s: {}", summary.execs_per_sec)?;
            writeln!(self.out, "Corpus: {} entries", summary.corpus_size)?;
            writeln!(self.out, "Elapsed: {elapsed}")?;
            writeln!(self.out, "Findings: {}", summary.findings)?;
        }
        self.out.flush()?;
        Ok(summary)
    }
}
