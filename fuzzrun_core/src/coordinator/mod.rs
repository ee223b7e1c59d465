//! Supervision of one fuzzing run against operator cancellation.
//!
//! Two units of work share a cancellation scope: the run itself and a
//! wait on the [`CancellationSource`]. Whichever finishes first cancels the
//! scope so the other stops at its next blocking wait. A received signal is
//! always the reported outcome, even when the run finished with an error of
//! its own in the meantime.

pub mod source;

use crate::error::{CancellationError, Error};
use crate::report::ReportHandler;
use crate::runner::{RunOutcome, Runner};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use source::{
    CancelHandle, CancellationSource, ManualCancellation, NeverCancel, OsSignals,
    TerminationSignal,
};

/// Runs `runner` to completion unless `source` cancels it first.
///
/// `source` is armed here, so cancellation covers the run only.
pub async fn supervise<S: CancellationSource>(
    runner: &mut Runner,
    handler: &mut ReportHandler,
    source: &mut S,
) -> Result<RunOutcome, Error> {
    source.arm()?;
    let scope = CancellationToken::new();
    let terminator = runner.terminator();

    let signal_unit = async {
        let received = tokio::select! {
            biased;
            received = source.wait() => received,
            _ = scope.cancelled() => None,
        };
        if let Some(signal) = received {
            info!("Received {signal}, stopping the fuzzer");
            terminator.terminate();
            scope.cancel();
        }
        received
    };

    let run_unit = async {
        let result = runner.run(handler, &scope).await;
        scope.cancel();
        result
    };

    let (received, result) = tokio::join!(signal_unit, run_unit);
    if let Some(signal) = received {
        if let Err(err) = &result {
            debug!("discarding run error after cancellation: {err}");
        }
        return Err(CancellationError { signal }.into());
    }
    Ok(result?)
}
