//! Worker loop: fetch, process, route, repeat

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::Once;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::queue::{Queue, QueueError};

/// Payload that asks a worker to shut down
pub const STOP_SENTINEL: &str = "STOP";

/// Caller-supplied processing logic
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Process one decoded payload.
    ///
    /// `Ok(true)` acknowledges the job, `Ok(false)` sends it to the failed
    /// destination, and an error sends it to the error destination.
    async fn process(&self, body: &Value) -> anyhow::Result<bool>;

    /// Whether `body` is the shutdown instruction
    fn is_stop_job(&self, body: &Value) -> bool {
        body.as_str() == Some(STOP_SENTINEL)
    }

    /// Runs once before the first fetch
    async fn starting(&self) {}

    /// Runs once after the loop exits
    async fn finished(&self) {}
}

/// Result of running the handler on one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Fault(String),
}

/// Why the loop exited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// `max_iterations` fetch attempts were made
    IterationBudget,
    /// A stop payload was received
    StopSentinel,
    /// The cancellation token fired
    Cancelled,
}

/// Counters for one `run`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub iterations: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub errored: u64,
    pub idle: u64,
    pub fetch_faults: u64,
    pub exit: ExitReason,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl WorkerReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            iterations: 0,
            succeeded: 0,
            failed: 0,
            errored: 0,
            idle: 0,
            fetch_faults: 0,
            exit: ExitReason::IterationBudget,
            started_at,
            finished_at: started_at,
        }
    }

    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Success => self.succeeded += 1,
            Outcome::Failure => self.failed += 1,
            Outcome::Fault(_) => self.errored += 1,
        }
    }
}

/// Single-task worker driving one queue with one handler.
///
/// Cancellation is observed only between iterations; a job that has been
/// fetched always runs to completion and is routed before the loop checks
/// again.
pub struct Worker<Q, H> {
    queue: Q,
    handler: H,
    config: WorkerConfig,
    cancel: CancellationToken,
}

impl<Q: Queue, H: JobHandler> Worker<Q, H> {
    pub fn new(queue: Q, handler: H, config: WorkerConfig) -> Self {
        Self {
            queue,
            handler,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops the loop at the next iteration boundary
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn into_parts(self) -> (Q, H) {
        (self.queue, self.handler)
    }

    pub async fn run(&self) -> WorkerReport {
        debug!("Starting Queue Worker!");
        let mut report = WorkerReport::new(Utc::now());
        self.handler.starting().await;

        loop {
            if let Some(reason) = self.termination(&report).await {
                report.exit = reason;
                break;
            }
            report.iterations += 1;

            let job = match self.queue.get_next().await {
                Ok(job) => job,
                Err(e) => {
                    let cause = e.to_string();
                    error!(iteration = report.iterations, error = %cause, "Error getting data");
                    report.fetch_faults += 1;
                    self.report_routing("error", self.queue.error(None, &cause).await);
                    continue;
                }
            };

            let Some(job) = job else {
                debug!(iteration = report.iterations, "Nothing to do.");
                report.idle += 1;
                self.queue.nothing_to_do().await;
                continue;
            };

            let description = self.queue.describe(&job);
            debug!(iteration = report.iterations, job = %description, "get next");

            let body = match self.queue.decode(&job) {
                Ok(body) => body,
                Err(e) => {
                    let cause = e.to_string();
                    error!(job = %description, error = %cause, "Error decoding job");
                    report.errored += 1;
                    self.report_routing("error", self.queue.error(Some(job), &cause).await);
                    continue;
                }
            };

            if self.handler.is_stop_job(&body) {
                self.report_routing("stopped", self.queue.stopped(job).await);
                debug!(job = %description, "STOP instruction received.");
                report.exit = ExitReason::StopSentinel;
                break;
            }

            let outcome = self.process(&body).await;
            report.record(&outcome);
            self.route(job, &description, outcome).await;
        }

        report.finished_at = Utc::now();
        debug!(
            iterations = report.iterations,
            succeeded = report.succeeded,
            failed = report.failed,
            errored = report.errored,
            exit = ?report.exit,
            "Queue Worker finished."
        );
        self.handler.finished().await;
        report
    }

    /// Check cancellation, then the iteration budget
    async fn termination(&self, report: &WorkerReport) -> Option<ExitReason> {
        if self.cancel.is_cancelled() {
            let cooldown = self.config.shutdown_cooldown;
            info!(cooldown_secs = cooldown.as_secs(), "Worker terminated, cooling down");
            if !cooldown.is_zero() {
                tokio::time::sleep(cooldown).await;
            }
            return Some(ExitReason::Cancelled);
        }

        if self.config.is_bounded() && report.iterations >= self.config.max_iterations {
            return Some(ExitReason::IterationBudget);
        }

        None
    }

    /// Run the handler, converting errors and panics into a fault
    async fn process(&self, body: &Value) -> Outcome {
        install_panic_hook();
        PANIC_LOCATION.with(|cell| *cell.borrow_mut() = None);

        match AssertUnwindSafe(self.handler.process(body)).catch_unwind().await {
            Ok(Ok(true)) => Outcome::Success,
            Ok(Ok(false)) => Outcome::Failure,
            Ok(Err(e)) => Outcome::Fault(format!("{e:#}")),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                match PANIC_LOCATION.with(|cell| cell.borrow_mut().take()) {
                    Some(location) => {
                        Outcome::Fault(format!("handler panicked: {message} (at {location})"))
                    }
                    None => Outcome::Fault(format!("handler panicked: {message}")),
                }
            }
        }
    }

    async fn route(&self, job: Q::Envelope, description: &str, outcome: Outcome) {
        match outcome {
            Outcome::Success => {
                debug!(job = %description, "Successful Job");
                self.report_routing("successful", self.queue.successful(job).await);
            }
            Outcome::Failure => {
                debug!(job = %description, "Failed Job");
                self.report_routing("failed", self.queue.failed(job).await);
            }
            Outcome::Fault(cause) => {
                error!(job = %description, error = %cause, "Error managing job");
                self.report_routing("error", self.queue.error(Some(job), &cause).await);
            }
        }
    }

    fn report_routing(&self, route: &str, result: Result<(), QueueError>) {
        if let Err(e) = result {
            warn!(route = route, error = %e, "Queue routing call failed");
        }
    }
}

thread_local! {
    /// Location of the most recent panic on this thread
    static PANIC_LOCATION: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a hook that remembers where a panic happened. The previous hook
/// still runs, so panic output is unchanged.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if let Some(location) = info.location() {
                PANIC_LOCATION.with(|cell| *cell.borrow_mut() = Some(location.to_string()));
            }
            previous(info);
        }));
    });
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn process(&self, _body: &Value) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    #[test]
    fn test_default_stop_job() {
        assert!(Noop.is_stop_job(&json!("STOP")));
        assert!(!Noop.is_stop_job(&json!("stop")));
        assert!(!Noop.is_stop_job(&json!({"cmd": "STOP"})));
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(5_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic payload");
    }

    #[test]
    fn test_report_counts() {
        let mut report = WorkerReport::new(Utc::now());
        report.record(&Outcome::Success);
        report.record(&Outcome::Failure);
        report.record(&Outcome::Fault("x".into()));
        report.record(&Outcome::Success);
        assert_eq!((report.succeeded, report.failed, report.errored), (2, 1, 1));
    }
}
