use crate::error::{Error, Result};
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::thread;
use std::time::Duration;

/// Runs `job` on its own thread and waits at most `timeout` for it.
///
/// Inference cannot be interrupted, so on timeout the worker keeps running until it
/// finishes and its result is dropped.
pub fn run_with_timeout<T, F>(timeout: Duration, job: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = bounded(1);
    thread::Builder::new()
        .name("hybrid-tagger-worker".into())
        .spawn(move || {
            // receiver is gone after a timeout
            let _ = tx.send(job());
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            log::warn!("Classification timed out after {timeout:?}; abandoning worker");
            Err(Error::Timeout(timeout))
        }
        Err(RecvTimeoutError::Disconnected) => {
            Err(Error::Inference("worker exited without a result".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn returns_job_result() {
        let value = run_with_timeout(Duration::from_secs(5), || Ok(42)).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn propagates_job_error() {
        let result: Result<()> = run_with_timeout(Duration::from_secs(5), || {
            Err(Error::Inference("boom".into()))
        });
        assert!(matches!(result, Err(Error::Inference(_))));
    }

    #[test]
    fn slow_job_times_out_and_still_completes() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let result = run_with_timeout(Duration::from_millis(20), move || {
            thread::sleep(Duration::from_millis(200));
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(!finished.load(Ordering::SeqCst));
        thread::sleep(Duration::from_millis(500));
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn panicking_job_is_an_error() {
        let result: Result<()> = run_with_timeout(Duration::from_secs(5), || panic!("model crashed"));
        assert!(matches!(result, Err(Error::Inference(_))));
    }
}
