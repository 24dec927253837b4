use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Which source ended a [`wait_for`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    /// A value arrived on the channel
    Received(T),
    /// Every sender is gone
    Closed,
    /// The cancellation token fired
    Cancelled,
    /// The timeout elapsed first
    Elapsed,
}

/// Waits for the next value on `rx`, racing it against `cancel` and `timeout`.
///
/// No source has priority: if several are ready at once, any of them may win.
pub async fn wait_for<T>(
    rx: &mut mpsc::Receiver<T>,
    cancel: &CancellationToken,
    timeout: Duration,
) -> WaitOutcome<T> {
    tokio::select! {
        received = rx.recv() => received.map_or(WaitOutcome::Closed, WaitOutcome::Received),
        () = cancel.cancelled() => WaitOutcome::Cancelled,
        () = tokio::time::sleep(timeout) => WaitOutcome::Elapsed,
    }
}
