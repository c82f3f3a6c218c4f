//! Turning admission decisions into job executions and delayed re-dispatches.
//!
//! A [`Job`] attempt is consumed by [`Scheduler::process`]: it either runs, is
//! re-dispatched as a new attempt for its allocated slot, or is handed to the
//! [`FailureReporter`]. Because the attempt is moved into `process`, a
//! superseded attempt cannot resume alongside its re-dispatched successor.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::admission::{AdmissionEngine, AdmitReason, Admission};
use crate::clock::Clock;
use crate::metrics::Metrics;
use crate::settings::QueueConfig;
use crate::slot::SlotKey;

/// One attempt at running a job. The payload never changes across attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub payload: Bytes,
    /// Deferrals this job has been through so far.
    pub defer_cycles: u32,
    /// Slot holding a unit of capacity for this job, set by the last deferral.
    pub reserved_slot: Option<SlotKey>,
    pub enqueued_at_ms: i64,
}

impl Job {
    pub fn new(queue: &str, payload: Bytes, now_ms: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: queue.to_string(),
            payload,
            defer_cycles: 0,
            reserved_slot: None,
            enqueued_at_ms: now_ms,
        }
    }

    /// The next attempt after a deferral to `slot`.
    fn deferred(self, slot: SlotKey, reserved: bool) -> Self {
        let rewake = reserved && self.reserved_slot == Some(slot);
        Self {
            defer_cycles: if rewake {
                self.defer_cycles
            } else {
                self.defer_cycles + 1
            },
            reserved_slot: reserved.then_some(slot),
            ..self
        }
    }

    /// Whether the job is past the point where it may be deferred again.
    fn past_deadline(&self, limits: &QueueConfig, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.enqueued_at_ms) >= limits.retry_until().as_millis() as i64
    }
}

/// Acknowledgment returned to producers once a job is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptHandle {
    pub job_id: Uuid,
    pub queue: String,
}

/// Terminal failure reasons handed to the [`FailureReporter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    RetryBudgetExceeded { cycles: u32 },
    /// Still not admitted `retry_until_secs` after it was first accepted.
    DeadlineExceeded { age_ms: i64 },
    ResubmitFailed(String),
    HandlerFailed(String),
    /// The counter store handle was lost; the job was not run.
    StoreLost(String),
    /// Accepted but dropped at shutdown before it could run.
    Abandoned,
}

impl FailureReason {
    /// Stable label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::RetryBudgetExceeded { .. } => "retry_budget_exceeded",
            FailureReason::DeadlineExceeded { .. } => "deadline_exceeded",
            FailureReason::ResubmitFailed(_) => "resubmit_failed",
            FailureReason::HandlerFailed(_) => "handler_failed",
            FailureReason::StoreLost(_) => "store_lost",
            FailureReason::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::RetryBudgetExceeded { cycles } => {
                write!(f, "deferred {} times without being admitted", cycles)
            }
            FailureReason::DeadlineExceeded { age_ms } => {
                write!(f, "not admitted within {} ms of being accepted", age_ms)
            }
            FailureReason::ResubmitFailed(e) => write!(f, "could not re-dispatch: {}", e),
            FailureReason::HandlerFailed(e) => write!(f, "handler failed: {}", e),
            FailureReason::StoreLost(e) => write!(f, "counter store lost: {}", e),
            FailureReason::Abandoned => write!(f, "abandoned at shutdown"),
        }
    }
}

/// What happened to one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Executed { reason: AdmitReason },
    Deferred { slot: SlotKey, delay: Duration },
    Failed { reason: FailureReason },
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatcher is shut down")]
    Closed,
    #[error("dispatch rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to accept job for queue {queue}: {source}")]
    Submit {
        queue: String,
        #[source]
        source: DispatchError,
    },
    #[error("counter store lost: {0}")]
    StoreLost(String),
}

/// The host's delayed-execution facility.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Arrange for `job` to be processed after `delay`.
    async fn schedule_after(&self, delay: Duration, job: &Job) -> Result<(), DispatchError>;
}

/// Receives jobs that reached a terminal failure.
#[async_trait]
pub trait FailureReporter: Send + Sync {
    async fn report_failure(&self, queue: &str, payload: &Bytes, reason: &FailureReason);
}

/// Executes an admitted job's business payload.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &Job) -> anyhow::Result<()>;
}

/// Failure reporter that only logs.
pub struct LoggingFailureReporter;

#[async_trait]
impl FailureReporter for LoggingFailureReporter {
    async fn report_failure(&self, queue: &str, payload: &Bytes, reason: &FailureReason) {
        error!(queue, payload_len = payload.len(), %reason, "job failed permanently");
    }
}

/// Delay before a deferred job should be re-checked: until `slot` starts plus
/// `jitter_ms`, and never less than one second.
pub fn defer_delay(slot: SlotKey, now_ms: i64, jitter_ms: u64) -> Duration {
    let until_start = slot.start_ms().saturating_sub(now_ms);
    let delay_ms = until_start.saturating_add(jitter_ms as i64).max(1_000);
    Duration::from_millis(delay_ms as u64)
}

pub struct Scheduler {
    engine: Arc<AdmissionEngine>,
    dispatcher: Arc<dyn Dispatcher>,
    reporter: Arc<dyn FailureReporter>,
    handler: Arc<dyn JobHandler>,
    clock: Arc<dyn Clock>,
    metrics: Option<Metrics>,
}

impl Scheduler {
    pub fn new(
        engine: Arc<AdmissionEngine>,
        dispatcher: Arc<dyn Dispatcher>,
        reporter: Arc<dyn FailureReporter>,
        handler: Arc<dyn JobHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engine,
            dispatcher,
            reporter,
            handler,
            clock,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Accept a job for processing. The handle is returned regardless of when
    /// the job will actually run.
    pub async fn submit(&self, queue: &str, payload: Bytes) -> Result<AttemptHandle, SchedulerError> {
        let job = Job::new(queue, payload, self.clock.now_ms());
        self.dispatcher
            .schedule_after(Duration::ZERO, &job)
            .await
            .map_err(|source| SchedulerError::Submit {
                queue: queue.to_string(),
                source,
            })?;
        debug!(queue, job_id = %job.id, "job accepted");
        Ok(AttemptHandle {
            job_id: job.id,
            queue: job.queue,
        })
    }

    /// Run one attempt through admission and act on the decision.
    pub async fn process(&self, job: Job) -> Outcome {
        let now_ms = self.clock.now_ms();
        let limits = self.engine.queues().limits_for(&job.queue);
        // A job that cannot be deferred again must not hold a future slot
        let may_reserve =
            job.defer_cycles < limits.max_defer_cycles && !job.past_deadline(limits, now_ms);
        let admission = match self
            .engine
            .try_admit_with(&job.queue, now_ms, job.reserved_slot, may_reserve)
            .await
        {
            Ok(admission) => admission,
            Err(e) => return self.fail(job, FailureReason::StoreLost(e.to_string())).await,
        };
        match admission {
            Admission::Admitted { reason } => {
                let timeout = limits.handler_timeout();
                match tokio::time::timeout(timeout, self.handler.run(&job)).await {
                    Ok(Ok(())) => {
                        debug!(queue = %job.queue, job_id = %job.id, ?reason, "job executed");
                        Outcome::Executed { reason }
                    }
                    Ok(Err(e)) => {
                        self.fail(job, FailureReason::HandlerFailed(format!("{:#}", e)))
                            .await
                    }
                    Err(_) => {
                        let message = format!("timed out after {:?}", timeout);
                        self.fail(job, FailureReason::HandlerFailed(message)).await
                    }
                }
            }
            Admission::Deferred { slot, reserved } => self.on_deferred(job, slot, reserved).await,
        }
    }

    /// Report an accepted job that will never run because the process is stopping.
    pub async fn abandon(&self, job: Job) -> Outcome {
        self.fail(job, FailureReason::Abandoned).await
    }

    /// Re-dispatch `job` to run once `slot` starts, or report it failed if its
    /// deferral budget is spent or the dispatcher keeps refusing it.
    pub async fn on_deferred(&self, job: Job, slot: SlotKey, reserved: bool) -> Outcome {
        let limits = self.engine.queues().limits_for(&job.queue);
        let rewake = reserved && job.reserved_slot == Some(slot);
        if !rewake {
            if job.defer_cycles >= limits.max_defer_cycles {
                let cycles = job.defer_cycles;
                return self
                    .fail(job, FailureReason::RetryBudgetExceeded { cycles })
                    .await;
            }
            let now_ms = self.clock.now_ms();
            if job.past_deadline(limits, now_ms) {
                let age_ms = now_ms - job.enqueued_at_ms;
                return self
                    .fail(job, FailureReason::DeadlineExceeded { age_ms })
                    .await;
            }
        }

        let jitter_ms = if limits.jitter_max_seconds > 0 {
            rand::rng().random_range(0..=limits.jitter_max_seconds * 1_000)
        } else {
            0
        };
        let delay = defer_delay(slot, self.clock.now_ms(), jitter_ms);
        let attempts = limits.resubmit_attempts.max(1);
        let next = job.deferred(slot, reserved);

        let mut last_error = None;
        for attempt in 0..attempts {
            match self.dispatcher.schedule_after(delay, &next).await {
                Ok(()) => {
                    info!(
                        queue = %next.queue,
                        job_id = %next.id,
                        slot = %slot,
                        reserved,
                        delay_ms = delay.as_millis() as u64,
                        defer_cycles = next.defer_cycles,
                        "job deferred"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_defer_delay(&next.queue, delay.as_secs_f64());
                    }
                    return Outcome::Deferred { slot, delay };
                }
                Err(e) => {
                    warn!(
                        queue = %next.queue,
                        job_id = %next.id,
                        attempt = attempt + 1,
                        error = %e,
                        "re-dispatch failed"
                    );
                    last_error = Some(e);
                    if attempt + 1 < attempts {
                        let backoff_ms = 10 * (1u64 << attempt.min(10));
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    }
                }
            }
        }

        let reason = last_error.map_or_else(|| "no attempts made".to_string(), |e| e.to_string());
        self.fail(next, FailureReason::ResubmitFailed(reason)).await
    }

    async fn fail(&self, job: Job, reason: FailureReason) -> Outcome {
        error!(
            queue = %job.queue,
            job_id = %job.id,
            defer_cycles = job.defer_cycles,
            %reason,
            "job failed"
        );
        self.reporter
            .report_failure(&job.queue, &job.payload, &reason)
            .await;
        if let Some(metrics) = &self.metrics {
            metrics.record_job_failed(&job.queue, reason.label());
        }
        Outcome::Failed { reason }
    }
}

/// In-process dispatcher: delayed jobs wait on tokio timers and are then fed
/// to a [`Worker`] through a channel. Shutting down cancels pending timers;
/// every job a timer was holding is handed to the failure reporter.
pub struct TokioDispatcher {
    tx: mpsc::Sender<Job>,
    shutdown: broadcast::Sender<()>,
    closed: AtomicBool,
    pending: Arc<AtomicUsize>,
    reporter: Arc<dyn FailureReporter>,
}

impl TokioDispatcher {
    pub fn new(
        capacity: usize,
        reporter: Arc<dyn FailureReporter>,
    ) -> (Arc<Self>, mpsc::Receiver<Job>) {
        let (tx, rx) = mpsc::channel(capacity);
        let (shutdown, _) = broadcast::channel(1);
        let dispatcher = Arc::new(Self {
            tx,
            shutdown,
            closed: AtomicBool::new(false),
            pending: Arc::new(AtomicUsize::new(0)),
            reporter,
        });
        (dispatcher, rx)
    }

    /// Number of jobs waiting on a timer.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Refuse new jobs, cancel all pending timers and stop workers subscribed to
    /// this dispatcher.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(());
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dispatcher for TokioDispatcher {
    async fn schedule_after(&self, delay: Duration, job: &Job) -> Result<(), DispatchError> {
        if self.is_shut_down() || self.tx.is_closed() {
            return Err(DispatchError::Closed);
        }
        if delay.is_zero() {
            return self
                .tx
                .send(job.clone())
                .await
                .map_err(|_| DispatchError::Closed);
        }

        let tx = self.tx.clone();
        let job = job.clone();
        let pending = Arc::clone(&self.pending);
        let reporter = Arc::clone(&self.reporter);
        let mut shutdown = self.shutdown.subscribe();
        pending.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let undelivered = tokio::select! {
                _ = tokio::time::sleep(delay) => tx.send(job).await.err().map(|e| e.0),
                _ = shutdown.recv() => Some(job),
            };
            if let Some(job) = undelivered {
                warn!(queue = %job.queue, job_id = %job.id, "deferred job abandoned at shutdown");
                reporter
                    .report_failure(&job.queue, &job.payload, &FailureReason::Abandoned)
                    .await;
            }
            pending.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(())
    }
}

/// Drains dispatched jobs and processes each on its own task.
pub struct Worker {
    scheduler: Arc<Scheduler>,
    rx: mpsc::Receiver<Job>,
}

impl Worker {
    pub fn new(scheduler: Arc<Scheduler>, rx: mpsc::Receiver<Job>) -> Self {
        Self { scheduler, rx }
    }

    /// Run until the channel closes, `shutdown` fires or the counter store is
    /// lost. Jobs still queued when the loop ends are reported as abandoned, and
    /// in-flight attempts are awaited.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), SchedulerError> {
        let mut inflight = JoinSet::new();
        let mut lost = None;
        loop {
            tokio::select! {
                job = self.rx.recv() => {
                    let Some(job) = job else { break };
                    let scheduler = Arc::clone(&self.scheduler);
                    inflight.spawn(async move { scheduler.process(job).await });
                }
                Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                    lost = store_lost(joined);
                    if lost.is_some() {
                        break;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        self.rx.close();
        let mut abandoned = 0usize;
        while let Some(job) = self.rx.recv().await {
            self.scheduler.abandon(job).await;
            abandoned += 1;
        }
        while let Some(joined) = inflight.join_next().await {
            if let Some(e) = store_lost(joined) {
                lost.get_or_insert(e);
            }
        }
        debug!(abandoned, "worker stopped");
        match lost {
            Some(e) => Err(SchedulerError::StoreLost(e)),
            None => Ok(()),
        }
    }
}

fn store_lost(joined: Result<Outcome, tokio::task::JoinError>) -> Option<String> {
    match joined {
        Ok(Outcome::Failed {
            reason: FailureReason::StoreLost(e),
        }) => Some(e),
        Ok(_) => None,
        Err(e) => {
            error!(error = %e, "job attempt task panicked");
            None
        }
    }
}
