pub mod build;
pub mod config;
pub mod coordinator;
pub mod env;
pub mod error;
pub mod report;
pub mod runner;
pub mod session;

pub use build::{BuildResult, BuildSystem, Builder, BuilderOptions, new_builder};
pub use config::RunOptions;
pub use coordinator::{
    CancelHandle, CancellationSource, ManualCancellation, NeverCancel, OsSignals,
    TerminationSignal, supervise,
};
pub use env::{Environment, Tool};
pub use error::{
    BuildError, CancellationError, ConfigError, Error, ErrorKind, RunError, exit_code,
};
pub use report::{Finding, FindingKind, Metrics, ReportHandler, ReportHandlerOptions, Summary};
pub use runner::{RunOutcome, Runner, RunnerOptions, TerminationCause};
pub use session::{RunReport, RunSession};
