//! Worker loop tests against a scripted queue

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use drover_queue::queue::{Queue, QueueError};
use drover_queue::worker::{ExitReason, JobHandler, Worker};
use drover_queue::WorkerConfig;

#[derive(Debug, Clone, PartialEq)]
enum Call {
    GetNext,
    NothingToDo,
    Successful(u32),
    Failed(u32),
    Error(Option<u32>, String),
    Stopped(u32),
}

enum Fetch {
    Job(u32, String),
    Fault(&'static str),
}

#[derive(Debug)]
struct TestJob {
    id: u32,
    raw: String,
}

/// Queue that replays a fixed fetch script, then reports empty forever
#[derive(Default)]
struct ScriptedQueue {
    script: Mutex<VecDeque<Fetch>>,
    calls: Arc<Mutex<Vec<Call>>>,
    fail_routing: bool,
}

impl ScriptedQueue {
    fn new(script: Vec<Fetch>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    fn job(id: u32, body: Value) -> Fetch {
        Fetch::Job(id, body.to_string())
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn routed(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, Call::GetNext | Call::NothingToDo))
            .collect()
    }

    fn routing_result(&self) -> Result<(), QueueError> {
        if self.fail_routing {
            Err(QueueError::Backend("ack rejected".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Queue for ScriptedQueue {
    type Envelope = TestJob;

    async fn get_next(&self) -> Result<Option<TestJob>, QueueError> {
        self.record(Call::GetNext);
        match self.script.lock().unwrap().pop_front() {
            Some(Fetch::Job(id, raw)) => Ok(Some(TestJob { id, raw })),
            Some(Fetch::Fault(msg)) => Err(QueueError::Backend(msg.to_string())),
            None => Ok(None),
        }
    }

    async fn successful(&self, job: TestJob) -> Result<(), QueueError> {
        self.record(Call::Successful(job.id));
        self.routing_result()
    }

    async fn failed(&self, job: TestJob) -> Result<(), QueueError> {
        self.record(Call::Failed(job.id));
        self.routing_result()
    }

    async fn error(&self, job: Option<TestJob>, cause: &str) -> Result<(), QueueError> {
        self.record(Call::Error(job.map(|j| j.id), cause.to_string()));
        self.routing_result()
    }

    async fn stopped(&self, job: TestJob) -> Result<(), QueueError> {
        self.record(Call::Stopped(job.id));
        Ok(())
    }

    async fn nothing_to_do(&self) {
        self.record(Call::NothingToDo);
    }

    fn decode(&self, job: &TestJob) -> Result<Value, QueueError> {
        serde_json::from_str(&job.raw).map_err(|e| QueueError::Decode(e.to_string()))
    }

    fn describe(&self, job: &TestJob) -> String {
        format!("#{} {}", job.id, job.raw)
    }

    async fn send(&self, _body: &Value) -> Result<String, QueueError> {
        Ok("0".into())
    }
}

/// Handler driven by the payload: `{"ok": bool}`, `{"fail": msg}` or `{"panic": msg}`
#[derive(Default)]
struct PayloadHandler {
    calls: AtomicU32,
    lifecycle: Mutex<Vec<&'static str>>,
    cancel_on_call: Option<CancellationToken>,
}

#[async_trait]
impl JobHandler for PayloadHandler {
    async fn process(&self, body: &Value) -> anyhow::Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = &self.cancel_on_call {
            token.cancel();
        }

        if let Some(msg) = body.get("fail").and_then(Value::as_str) {
            anyhow::bail!("{msg}");
        }
        if let Some(msg) = body.get("panic").and_then(Value::as_str) {
            panic!("{msg}");
        }
        Ok(body.get("ok").and_then(Value::as_bool).unwrap_or(true))
    }

    async fn starting(&self) {
        self.lifecycle.lock().unwrap().push("starting");
    }

    async fn finished(&self) {
        self.lifecycle.lock().unwrap().push("finished");
    }
}

fn config(max_iterations: u64) -> WorkerConfig {
    WorkerConfig {
        max_iterations,
        shutdown_cooldown: Duration::ZERO,
    }
}

#[tokio::test]
async fn test_success_routes_to_successful_once() {
    let queue = ScriptedQueue::new(vec![ScriptedQueue::job(1, json!({"id": 1, "ok": true}))]);
    let worker = Worker::new(queue, PayloadHandler::default(), config(1));

    let report = worker.run().await;

    assert_eq!(worker.queue().routed(), vec![Call::Successful(1)]);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.exit, ExitReason::IterationBudget);
}

#[tokio::test]
async fn test_false_routes_to_failed_once() {
    let queue = ScriptedQueue::new(vec![ScriptedQueue::job(7, json!({"ok": false}))]);
    let worker = Worker::new(queue, PayloadHandler::default(), config(1));

    let report = worker.run().await;

    assert_eq!(worker.queue().routed(), vec![Call::Failed(7)]);
    assert_eq!(report.failed, 1);
}

#[tokio::test]
async fn test_fault_routes_to_error_with_cause() {
    let queue = ScriptedQueue::new(vec![ScriptedQueue::job(2, json!({"id": 2, "fail": "boom"}))]);
    let worker = Worker::new(queue, PayloadHandler::default(), config(3));

    let report = worker.run().await;

    let routed = worker.queue().routed();
    assert_eq!(routed.len(), 1);
    match &routed[0] {
        Call::Error(Some(2), cause) => assert!(cause.contains("boom"), "cause was {cause}"),
        other => panic!("unexpected routing: {other:?}"),
    }
    // The loop kept going after the fault.
    assert_eq!(report.iterations, 3);
    assert_eq!(report.errored, 1);
}

#[tokio::test]
async fn test_panicking_handler_is_contained() {
    let queue = ScriptedQueue::new(vec![
        ScriptedQueue::job(1, json!({"panic": "kaboom"})),
        ScriptedQueue::job(2, json!({"ok": true})),
    ]);
    let worker = Worker::new(queue, PayloadHandler::default(), config(2));

    let report = worker.run().await;

    let routed = worker.queue().routed();
    assert!(matches!(
        &routed[0],
        Call::Error(Some(1), cause) if cause.contains("handler panicked") && cause.contains("kaboom")
    ));
    // The cause names where the panic was raised.
    assert!(matches!(&routed[0], Call::Error(_, cause) if cause.contains("worker_tests.rs:")));
    assert_eq!(routed[1], Call::Successful(2));
    assert_eq!((report.errored, report.succeeded), (1, 1));
}

#[tokio::test]
async fn test_stop_sentinel_stops_without_processing() {
    let queue = ScriptedQueue::new(vec![
        ScriptedQueue::job(1, json!("STOP")),
        ScriptedQueue::job(2, json!({"ok": true})),
    ]);
    let worker = Worker::new(queue, PayloadHandler::default(), config(0));

    let report = worker.run().await;

    assert_eq!(report.exit, ExitReason::StopSentinel);
    assert_eq!(worker.queue().calls(), vec![Call::GetNext, Call::Stopped(1)]);
    assert_eq!(worker.handler().calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_iteration_budget_counts_fetch_attempts() {
    let queue = ScriptedQueue::new(vec![
        ScriptedQueue::job(1, json!({"ok": true})),
        ScriptedQueue::job(2, json!({"ok": false})),
        Fetch::Fault("connection reset"),
    ]);
    let worker = Worker::new(queue, PayloadHandler::default(), config(5));

    let report = worker.run().await;

    let fetches = worker
        .queue()
        .calls()
        .into_iter()
        .filter(|c| *c == Call::GetNext)
        .count();
    assert_eq!(fetches, 5);
    assert_eq!(report.iterations, 5);
    assert_eq!(report.idle, 2);
    assert_eq!(report.fetch_faults, 1);
}

#[tokio::test]
async fn test_fetch_faults_never_stop_the_loop() {
    let mut script: Vec<Fetch> = (0..4).map(|_| Fetch::Fault("timeout")).collect();
    script.push(ScriptedQueue::job(9, json!({"ok": true})));
    let worker = Worker::new(ScriptedQueue::new(script), PayloadHandler::default(), config(5));

    let report = worker.run().await;

    let routed = worker.queue().routed();
    assert_eq!(routed.len(), 5);
    for call in &routed[..4] {
        assert_eq!(*call, Call::Error(None, "Backend error: timeout".to_string()));
    }
    assert_eq!(routed[4], Call::Successful(9));
    assert_eq!(report.fetch_faults, 4);
    assert_eq!(report.succeeded, 1);
}

#[tokio::test]
async fn test_each_envelope_routed_before_next_fetch() {
    let queue = ScriptedQueue::new(vec![
        ScriptedQueue::job(1, json!({"ok": true})),
        ScriptedQueue::job(2, json!({"ok": false})),
        ScriptedQueue::job(3, json!({"fail": "bad input"})),
    ]);
    let worker = Worker::new(queue, PayloadHandler::default(), config(3));

    worker.run().await;

    let calls = worker.queue().calls();
    assert_eq!(calls.len(), 6);
    for pair in calls.chunks(2) {
        assert_eq!(pair[0], Call::GetNext);
        assert_ne!(pair[1], Call::GetNext);
    }
}

#[tokio::test]
async fn test_empty_fetch_fires_idle_hook() {
    let worker = Worker::new(ScriptedQueue::default(), PayloadHandler::default(), config(2));

    let report = worker.run().await;

    assert_eq!(
        worker.queue().calls(),
        vec![Call::GetNext, Call::NothingToDo, Call::GetNext, Call::NothingToDo]
    );
    assert_eq!(report.idle, 2);
}

#[tokio::test]
async fn test_undecodable_body_routes_to_error() {
    let queue = ScriptedQueue::new(vec![Fetch::Job(4, "{not json".to_string())]);
    let worker = Worker::new(queue, PayloadHandler::default(), config(1));

    let report = worker.run().await;

    assert!(matches!(&worker.queue().routed()[0], Call::Error(Some(4), cause) if cause.starts_with("Decode error")));
    assert_eq!(worker.handler().calls.load(Ordering::SeqCst), 0);
    assert_eq!(report.errored, 1);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let token = CancellationToken::new();
    token.cancel();
    let worker = Worker::new(ScriptedQueue::default(), PayloadHandler::default(), config(0))
        .with_cancellation(token);

    let report = worker.run().await;

    assert_eq!(report.exit, ExitReason::Cancelled);
    assert_eq!(report.iterations, 0);
    assert!(worker.queue().calls().is_empty());
}

#[tokio::test]
async fn test_cancellation_lets_in_flight_job_finish() {
    let token = CancellationToken::new();
    let handler = PayloadHandler {
        cancel_on_call: Some(token.clone()),
        ..Default::default()
    };
    let queue = ScriptedQueue::new(vec![
        ScriptedQueue::job(1, json!({"ok": true})),
        ScriptedQueue::job(2, json!({"ok": true})),
    ]);
    let worker = Worker::new(queue, handler, config(0)).with_cancellation(token);

    let report = worker.run().await;

    assert_eq!(report.exit, ExitReason::Cancelled);
    assert_eq!(worker.queue().calls(), vec![Call::GetNext, Call::Successful(1)]);
}

#[tokio::test]
async fn test_cancellation_waits_for_cooldown() {
    let token = CancellationToken::new();
    token.cancel();
    let config = WorkerConfig {
        max_iterations: 0,
        shutdown_cooldown: Duration::from_millis(50),
    };
    let worker = Worker::new(ScriptedQueue::default(), PayloadHandler::default(), config)
        .with_cancellation(token);

    let started = std::time::Instant::now();
    worker.run().await;

    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[tokio::test]
async fn test_routing_failures_are_contained() {
    let queue = ScriptedQueue {
        fail_routing: true,
        ..ScriptedQueue::new(vec![
            ScriptedQueue::job(1, json!({"ok": true})),
            ScriptedQueue::job(2, json!({"ok": false})),
        ])
    };
    let worker = Worker::new(queue, PayloadHandler::default(), config(3));

    let report = worker.run().await;

    assert_eq!(report.iterations, 3);
    assert_eq!(worker.queue().routed(), vec![Call::Successful(1), Call::Failed(2)]);
}

#[tokio::test]
async fn test_lifecycle_hooks() {
    let worker = Worker::new(ScriptedQueue::default(), PayloadHandler::default(), config(1));

    worker.run().await;

    let (_, handler) = worker.into_parts();
    assert_eq!(*handler.lifecycle.lock().unwrap(), vec!["starting", "finished"]);
}
