use super::classifier::Classifier;
use super::finding::Finding;
use super::metrics::{Metrics, MetricsParser};

/// Something an observer noticed in the engine output.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportEvent {
    Finding(Finding),
    /// A status line updated the run counters.
    Metrics(Metrics),
}

/// An `Observer` watches the engine's output stream line by line.
///
/// Every observer sees every line, in order; none of them consumes lines
/// on behalf of the others. This lets the crash classifier and the metrics
/// parser interpret the same status lines independently.
pub trait Observer: Send {
    /// Returns a static string name identifying the observer.
    fn name(&self) -> &'static str;

    /// Called once for each output line, with the trailing newline removed.
    fn observe_line(&mut self, line: &str) -> Option<ReportEvent>;

    /// Called once after the stream ended. Observers holding a partially
    /// parsed event emit it here.
    fn finish(&mut self) -> Option<ReportEvent> {
        None
    }
}

/// Turns crash reports into [`ReportEvent::Finding`]s.
#[derive(Debug, Default)]
pub struct FindingObserver {
    classifier: Classifier,
}

impl FindingObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Observer for FindingObserver {
    fn name(&self) -> &'static str {
        "FindingObserver"
    }

    fn observe_line(&mut self, line: &str) -> Option<ReportEvent> {
        self.classifier.feed(line).map(ReportEvent::Finding)
    }

    fn finish(&mut self) -> Option<ReportEvent> {
        self.classifier.finish().map(ReportEvent::Finding)
    }
}

/// Tracks engine status lines.
#[derive(Debug, Default)]
pub struct MetricsObserver {
    parser: MetricsParser,
}

impl MetricsObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Metrics {
        self.parser.snapshot()
    }
}

impl Observer for MetricsObserver {
    fn name(&self) -> &'static str {
        "MetricsObserver"
    }

    fn observe_line(&mut self, line: &str) -> Option<ReportEvent> {
        self.parser
            .parse_line(line)
            .then(|| ReportEvent::Metrics(self.parser.snapshot()))
    }
}
