use nix::sys::signal::Signal;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::oneshot;
use tracing::debug;

/// Operator signals that end a fuzzing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TerminationSignal {
    Interrupt,
    Terminate,
    Quit,
}

impl TerminationSignal {
    fn as_nix(self) -> Signal {
        match self {
            TerminationSignal::Interrupt => Signal::SIGINT,
            TerminationSignal::Terminate => Signal::SIGTERM,
            TerminationSignal::Quit => Signal::SIGQUIT,
        }
    }

    pub fn number(self) -> i32 {
        self.as_nix() as i32
    }
}

impl fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_nix().as_str())
    }
}

/// Delivers at most one cancellation request.
///
/// `wait` resolves to `Some(signal)` the first time a cancellation arrives.
/// Once it has resolved, or when the source can never fire, it resolves to
/// `None` or stays pending forever; the coordinator treats both as "no
/// cancellation" and relies on its own scope to stop waiting.
pub trait CancellationSource: Send {
    /// Called right before the fuzzer is launched, after the build.
    fn arm(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn wait(&mut self) -> impl Future<Output = Option<TerminationSignal>> + Send;
}

struct SignalStreams {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
}

/// SIGINT, SIGTERM and SIGQUIT delivered to this process.
///
/// The handlers are installed by [`CancellationSource::arm`]. Until then the
/// signals keep their default action, so an interrupted build ends the
/// process like any other interrupted command.
#[derive(Default)]
pub struct OsSignals {
    streams: Option<SignalStreams>,
    fired: bool,
}

impl OsSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self) -> bool {
        self.streams.is_some()
    }
}

impl CancellationSource for OsSignals {
    /// Installs the handlers. Must be called from within a tokio runtime.
    fn arm(&mut self) -> std::io::Result<()> {
        if self.streams.is_none() {
            self.streams = Some(SignalStreams {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
                quit: signal(SignalKind::quit())?,
            });
            debug!("installed termination signal handlers");
        }
        Ok(())
    }

    async fn wait(&mut self) -> Option<TerminationSignal> {
        let streams = match &mut self.streams {
            Some(streams) if !self.fired => streams,
            _ => return std::future::pending().await,
        };
        let received = tokio::select! {
            _ = streams.interrupt.recv() => TerminationSignal::Interrupt,
            _ = streams.terminate.recv() => TerminationSignal::Terminate,
            _ = streams.quit.recv() => TerminationSignal::Quit,
        };
        debug!(signal = %received, "received termination signal");
        self.fired = true;
        Some(received)
    }
}

/// A cancellation source triggered programmatically through a [`CancelHandle`].
pub struct ManualCancellation {
    receiver: oneshot::Receiver<TerminationSignal>,
    done: bool,
}

/// Fires the paired [`ManualCancellation`]. Consumed on use.
#[derive(Debug)]
pub struct CancelHandle {
    sender: oneshot::Sender<TerminationSignal>,
}

impl ManualCancellation {
    pub fn new() -> (Self, CancelHandle) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                receiver,
                done: false,
            },
            CancelHandle { sender },
        )
    }
}

impl CancelHandle {
    /// Returns false if the source was already dropped.
    pub fn cancel(self, signal: TerminationSignal) -> bool {
        self.sender.send(signal).is_ok()
    }
}

impl CancellationSource for ManualCancellation {
    async fn wait(&mut self) -> Option<TerminationSignal> {
        if self.done {
            return std::future::pending().await;
        }
        let result = (&mut self.receiver).await;
        self.done = true;
        match result {
            Ok(signal) => Some(signal),
            // Handle dropped without firing: this source can never cancel.
            Err(_) => std::future::pending().await,
        }
    }
}

/// A source that never cancels.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverCancel;

impl CancellationSource for NeverCancel {
    async fn wait(&mut self) -> Option<TerminationSignal> {
        std::future::pending().await
    }
}
