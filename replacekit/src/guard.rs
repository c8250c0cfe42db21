//! Bounded-time execution guard.
//!
//! Runs a closure on a dedicated thread and waits for its result for at most
//! a fixed duration. A worker that overruns is detached, not killed: the
//! `regex` crate matches in linear time, so an abandoned worker always
//! finishes on its own, but the caller never waits for it.
//!
//! The budget starts once the worker thread is running, so a slow thread
//! spawn on a loaded host is not charged to the work.

use crossbeam_channel::{bounded, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::GuardError;

/// Result of a guarded run together with how long the caller waited
#[derive(Debug)]
pub struct Guarded<T> {
    pub value: T,
    pub elapsed: Duration,
}

/// Run `work` with a wall-clock budget of `limit`
pub fn run_with_timeout<T, F>(limit: Duration, work: F) -> Result<Guarded<T>, GuardError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = bounded(1);
    let (ready_tx, ready_rx) = bounded::<Instant>(1);

    thread::Builder::new()
        .name("replacekit-guard".to_string())
        .spawn(move || {
            if ready_tx.send(Instant::now()).is_err() {
                return;
            }
            // Receiver may be gone after a timeout
            let _ = tx.send(work());
        })
        .map_err(|e| GuardError::Spawn(e.to_string()))?;

    let started = ready_rx.recv().map_err(|_| GuardError::WorkerLost)?;
    let remaining = limit.saturating_sub(started.elapsed());

    match rx.recv_timeout(remaining) {
        Ok(value) => Ok(Guarded {
            value,
            elapsed: started.elapsed(),
        }),
        Err(RecvTimeoutError::Timeout) => Err(GuardError::TimedOut(limit)),
        Err(RecvTimeoutError::Disconnected) => Err(GuardError::WorkerLost),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_work_returns_value() {
        let guarded = run_with_timeout(Duration::from_secs(1), || 21 * 2).unwrap();
        assert_eq!(guarded.value, 42);
        assert!(guarded.elapsed < Duration::from_secs(1));
    }

    #[test]
    fn test_slow_work_times_out_without_blocking() {
        let started = Instant::now();
        let result = run_with_timeout(Duration::from_millis(20), || {
            thread::sleep(Duration::from_millis(500));
            1
        });

        assert_eq!(result.unwrap_err(), GuardError::TimedOut(Duration::from_millis(20)));
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn test_budget_counts_from_worker_start() {
        let limit = Duration::from_millis(200);
        let guarded = run_with_timeout(limit, || {
            thread::sleep(Duration::from_millis(20));
            7
        })
        .unwrap();
        assert_eq!(guarded.value, 7);
        assert!(guarded.elapsed >= Duration::from_millis(20));
        assert!(guarded.elapsed < limit);
    }

    #[test]
    fn test_panicking_work_is_reported() {
        let result: Result<Guarded<()>, _> =
            run_with_timeout(Duration::from_secs(1), || panic!("boom"));
        assert_eq!(result.unwrap_err(), GuardError::WorkerLost);
    }
}
