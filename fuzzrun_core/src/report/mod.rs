//! Interpretation of the fuzzing engine's output.

pub mod classifier;
pub mod finding;
pub mod handler;
pub mod metrics;
pub mod observer;
pub mod seeds;

pub use classifier::{Classifier, SIGNATURES, Signature};
pub use finding::{Finding, FindingKind};
pub use handler::{FINDINGS_DIR, ReportHandler, ReportHandlerOptions, Summary};
pub use metrics::{Metrics, MetricsParser};
pub use observer::{FindingObserver, MetricsObserver, Observer, ReportEvent};
pub use seeds::count_seeds;
