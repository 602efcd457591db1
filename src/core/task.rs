//! Purpose: Run blocking work on a helper thread with a deadline and cooperative cancel.
//! Exports: `TaskOutcome`, `run_with_deadline`.
//! Role: Bounds the tunnel handshake without async I/O.
//! Invariants: The caller always learns whether the helper finished, was cancelled, or was
//! left running; a still-running helper is reported as `Detached`, never as success.
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::core::error::{Error, ErrorKind};

#[derive(Debug, PartialEq, Eq)]
pub enum TaskOutcome<T> {
    /// Finished before the deadline.
    Completed(T),
    /// Missed the deadline, then finished after `cancel` ran.
    Cancelled(T),
    /// Missed the deadline and ignored `cancel` for the whole grace period.
    Detached,
}

/// Runs `work` on a named thread. After `deadline`, calls `cancel` and waits up to
/// `grace` for the thread to return before detaching it.
pub fn run_with_deadline<T, F, C>(
    name: &str,
    deadline: Duration,
    grace: Duration,
    work: F,
    cancel: C,
) -> Result<TaskOutcome<T>, Error>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
    C: FnOnce(),
{
    let (tx, rx) = mpsc::channel();
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _ = tx.send(work());
        })
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message(format!("failed to spawn {name} thread"))
                .with_source(err)
        })?;

    let panicked = || {
        Error::new(ErrorKind::Internal).with_message(format!("{name} thread panicked"))
    };

    match rx.recv_timeout(deadline) {
        Ok(value) => {
            let _ = handle.join();
            return Ok(TaskOutcome::Completed(value));
        }
        Err(RecvTimeoutError::Disconnected) => {
            let _ = handle.join();
            return Err(panicked());
        }
        Err(RecvTimeoutError::Timeout) => {}
    }

    cancel();
    match rx.recv_timeout(grace) {
        Ok(value) => {
            let _ = handle.join();
            Ok(TaskOutcome::Cancelled(value))
        }
        Err(RecvTimeoutError::Disconnected) => {
            let _ = handle.join();
            Err(panicked())
        }
        Err(RecvTimeoutError::Timeout) => {
            warn!(task = name, "helper thread ignored cancellation; detaching");
            Ok(TaskOutcome::Detached)
        }
    }
}
