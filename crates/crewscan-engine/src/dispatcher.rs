//! Bounded-parallelism job dispatcher.
//!
//! Units are dispatched in input order; each waits for a free slot before it
//! starts and runs on the blocking thread pool, holding the slot until its
//! thread returns. The call returns once every unit has finished. Failures
//! are collected on a shared channel and handed back together after join,
//! never interleaved with the run.

use crate::error::ScanError;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

type Work<T> = Box<dyn FnOnce(&ErrorSink) -> Result<T, ScanError> + Send + 'static>;

/// One unit of work with a label used in failure reports.
pub struct Job<T> {
    label: String,
    work: Work<T>,
}

impl<T> Job<T> {
    pub fn new<F>(label: impl Into<String>, work: F) -> Self
    where
        F: FnOnce(&ErrorSink) -> Result<T, ScanError> + Send + 'static,
    {
        Self {
            label: label.into(),
            work: Box::new(work),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// A failure recorded for one unit.
#[derive(Debug)]
pub struct UnitFailure {
    pub unit: String,
    pub error: ScanError,
}

/// Cloneable handle onto the shared error channel.
///
/// Units report recoverable conditions here without failing; the dispatcher
/// also reports every unit that returns an error, panics or times out.
#[derive(Clone)]
pub struct ErrorSink {
    tx: mpsc::UnboundedSender<UnitFailure>,
}

impl ErrorSink {
    pub fn report(&self, unit: impl Into<String>, error: ScanError) {
        let _ = self.tx.send(UnitFailure {
            unit: unit.into(),
            error,
        });
    }
}

/// Successful outputs (in completion order) and every collected failure.
#[derive(Debug)]
pub struct DispatchReport<T> {
    pub outputs: Vec<T>,
    pub failures: Vec<UnitFailure>,
}

pub struct JobDispatcher {
    concurrency: usize,
    unit_timeout: Option<Duration>,
}

impl JobDispatcher {
    /// At most `concurrency` units run at once; zero is treated as one.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency
                .clamp(1, Semaphore::MAX_PERMITS)
                .min(u32::MAX as usize),
            unit_timeout: None,
        }
    }

    /// Give up on units that run longer than `timeout`.
    ///
    /// A timed-out unit is reported as [`ScanError::TimedOut`] at the
    /// deadline and its output is discarded. Blocking threads cannot be
    /// killed, so the unit keeps its slot until the thread returns, and
    /// [`run`](Self::run) still waits for it before draining failures.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.unit_timeout = timeout;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub async fn run<T: Send + 'static>(&self, jobs: Vec<Job<T>>) -> DispatchReport<T> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ErrorSink { tx };
        let slots = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let total = jobs.len();

        tracing::debug!(units = total, concurrency = self.concurrency, "dispatching");

        for job in jobs {
            // Blocks dispatch until a running unit releases its slot.
            let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
                break;
            };
            let sink = sink.clone();
            let timeout = self.unit_timeout;

            tasks.spawn(async move {
                let Job { label, work } = job;

                let unit_sink = sink.clone();
                let handle = tokio::task::spawn_blocking(move || {
                    // Released when the thread returns or unwinds, not at
                    // the deadline.
                    let _permit = permit;
                    work(&unit_sink)
                });

                let joined = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, handle).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            sink.report(
                                label.clone(),
                                ScanError::TimedOut {
                                    unit: label,
                                    after: limit,
                                },
                            );
                            return None;
                        }
                    },
                    None => handle.await,
                };

                match joined {
                    Ok(Ok(output)) => Some(output),
                    Ok(Err(error)) => {
                        sink.report(label, error);
                        None
                    }
                    Err(join_error) => {
                        let message = if join_error.is_panic() {
                            panic_message(join_error.into_panic())
                        } else {
                            join_error.to_string()
                        };
                        sink.report(
                            label.clone(),
                            ScanError::WorkerFailure {
                                unit: label,
                                message,
                            },
                        );
                        None
                    }
                }
            });
        }

        let mut outputs = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(output)) => outputs.push(output),
                Ok(None) => {}
                Err(join_error) => sink.report(
                    "dispatcher",
                    ScanError::WorkerFailure {
                        unit: "dispatcher".into(),
                        message: join_error.to_string(),
                    },
                ),
            }
        }

        // Timed-out units may still be running. Taking every slot waits for
        // their threads, so their late reports land before the drain.
        if let Ok(all) = slots.acquire_many(self.concurrency as u32).await {
            drop(all);
        }

        // Senders cloned into finished units are already dropped; drain what
        // is buffered rather than waiting for the channel to close.
        drop(sink);
        let mut failures = Vec::new();
        while let Ok(failure) = rx.try_recv() {
            failures.push(failure);
        }

        tracing::debug!(
            units = total,
            succeeded = outputs.len(),
            failures = failures.len(),
            "dispatch joined"
        );
        DispatchReport { outputs, failures }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked".to_string()
    }
}

/// Log the collected failures once, after the batch has finished.
pub fn log_failure_summary(context: &str, failures: &[UnitFailure]) {
    if failures.is_empty() {
        return;
    }
    tracing::warn!(count = failures.len(), "{context}");
    for failure in failures {
        tracing::warn!(unit = %failure.unit, error = %failure.error, "unit failed");
    }
}
