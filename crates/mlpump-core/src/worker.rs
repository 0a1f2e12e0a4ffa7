//! Background jobs with completion notification
//!
//! The driver only offers blocking calls. Callers that must stay responsive
//! (a UI loop, a CLI watching for input) run long calls such as
//! [`PumpDriver::wait_until_target`](crate::pump::PumpDriver::wait_until_target)
//! here: the job runs on a dedicated OS thread, panics are caught, and the
//! outcome is handed to an optional callback and to the [`WorkerHandle`].

use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::PumpError;

/// Why a background job produced no value
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Pump(#[from] PumpError),

    #[error("worker '{0}' panicked: {1}")]
    Panicked(String, String),

    #[error("worker '{0}' exited without reporting")]
    Disconnected(String),
}

/// Report delivered when a job ends
#[derive(Debug)]
pub struct Completion<T> {
    /// Worker name
    pub name: String,
    /// When the job started
    pub started_at: DateTime<Local>,
    /// When the job ended
    pub finished_at: DateTime<Local>,
    /// What the job returned
    pub outcome: Result<T, WorkerError>,
}

impl<T> Completion<T> {
    /// Wall-clock time the job took
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Callback invoked on the worker thread once the job ends
pub type OnFinished<T> = Box<dyn FnOnce(&Completion<T>) + Send + 'static>;

/// Handle to a running job
pub struct WorkerHandle<T> {
    name: String,
    rx: mpsc::Receiver<Completion<T>>,
    thread: Option<JoinHandle<()>>,
    finished: Arc<AtomicBool>,
}

impl<T> std::fmt::Debug for WorkerHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Run `job` on a new thread named `name`
pub fn spawn<T, F>(
    name: &str,
    job: F,
    on_finished: Option<OnFinished<T>>,
) -> Result<WorkerHandle<T>, PumpError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PumpError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);
    let worker_name = name.to_string();

    let thread = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let started_at = Local::now();
            let outcome = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
                Ok(result) => result.map_err(WorkerError::from),
                Err(panic_info) => {
                    let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic_info.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "unknown panic".to_string()
                    };
                    Err(WorkerError::Panicked(worker_name.clone(), msg))
                }
            };
            let completion = Completion {
                name: worker_name,
                started_at,
                finished_at: Local::now(),
                outcome,
            };

            match &completion.outcome {
                Ok(_) => tracing::debug!("worker '{}' finished", completion.name),
                Err(e) => tracing::warn!("worker '{}' failed: {}", completion.name, e),
            }
            if let Some(callback) = on_finished {
                callback(&completion);
            }
            flag.store(true, Ordering::SeqCst);
            let _ = tx.send(completion);
        })?;

    Ok(WorkerHandle {
        name: name.to_string(),
        rx,
        thread: Some(thread),
        finished,
    })
}

impl<T> WorkerHandle<T> {
    /// Worker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the job and its callback have run
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Block until the job ends
    pub fn join(mut self) -> Completion<T> {
        let completion = self.rx.recv().unwrap_or_else(|_| self.disconnected());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        completion
    }

    /// Block for at most `timeout`; `None` if the job is still running
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Completion<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(completion) => {
                if let Some(thread) = self.thread.take() {
                    let _ = thread.join();
                }
                Some(completion)
            }
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => Some(self.disconnected()),
        }
    }

    fn disconnected(&self) -> Completion<T> {
        let now = Local::now();
        Completion {
            name: self.name.clone(),
            started_at: now,
            finished_at: now,
            outcome: Err(WorkerError::Disconnected(self.name.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_join_returns_job_value() {
        let handle = spawn("answer", || Ok(42), None).unwrap();
        let completion = handle.join();
        assert_eq!(*completion.outcome.as_ref().unwrap(), 42);
        assert!(completion.elapsed() >= chrono::Duration::zero());
    }

    #[test]
    fn test_callback_sees_error() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let handle = spawn::<(), _>(
            "failing",
            || Err(PumpError::Protocol("pump did not stop".into())),
            Some(Box::new(move |c: &Completion<()>| {
                *sink.lock().unwrap() = Some(c.outcome.is_err());
            })),
        )
        .unwrap();
        let completion = handle.join();
        assert!(matches!(completion.outcome, Err(WorkerError::Pump(PumpError::Protocol(_)))));
        assert_eq!(*seen.lock().unwrap(), Some(true));
    }

    #[test]
    fn test_panic_is_reported() {
        let handle = spawn::<(), _>("boom", || panic!("lost the plunger"), None).unwrap();
        match handle.join().outcome {
            Err(WorkerError::Panicked(name, msg)) => {
                assert_eq!(name, "boom");
                assert!(msg.contains("lost the plunger"));
            }
            other => panic!("expected panic report, got {:?}", other),
        }
    }

    #[test]
    fn test_wait_timeout_while_running() {
        let (release, gate) = mpsc::channel::<()>();
        let mut handle = spawn(
            "gated",
            move || {
                let _ = gate.recv();
                Ok(())
            },
            None,
        )
        .unwrap();
        assert!(handle.wait_timeout(Duration::from_millis(20)).is_none());
        assert!(!handle.is_finished());
        release.send(()).unwrap();
        let completion = handle.wait_timeout(Duration::from_secs(5)).unwrap();
        assert!(completion.outcome.is_ok());
    }
}
