//! Worker pool: one pull loop per registered queue.
//!
//! Each loop claims jobs under a concurrency cap (semaphore permits) and an
//! optional sliding-window start limit, runs them on spawned tasks, and
//! reports the outcome back to the store. Retry scheduling follows the
//! job's own `max_attempts` / `backoff`.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use futures::future::join_all;
use rand::Rng;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::clock::Clock;
use crate::error::QueueError;
use crate::queue::Job;
use crate::store::Database;
use crate::worker::JobProcessor;
use crate::worker::rate_limit::{RateLimit, RateLimiter};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// Per-queue execution settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Jobs of this queue allowed to run at once.
    pub concurrency: usize,
    pub rate_limit: Option<RateLimit>,
    /// Sleep between claims when the queue is empty.
    pub poll_interval: Duration,
    /// Random extra idle sleep, up to this much.
    pub jitter: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            rate_limit: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl WorkerOptions {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            ..Self::default()
        }
    }

    pub fn with_rate_limit(mut self, max: usize, per: Duration) -> Self {
        self.rate_limit = Some(RateLimit::new(max, per));
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    fn idle_sleep(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }
        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }
}

struct Registration {
    handle: JoinHandle<()>,
    permits: Arc<Semaphore>,
    concurrency: usize,
}

/// Owns every queue's pull loop.
pub struct WorkerPool {
    store: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    shutdown_tx: watch::Sender<bool>,
    registrations: Mutex<HashMap<String, Registration>>,
}

impl WorkerPool {
    pub fn new(store: Arc<dyn Database>, clock: Arc<dyn Clock>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            clock,
            shutdown_tx,
            registrations: Mutex::new(HashMap::new()),
        }
    }

    /// Start pulling `queue` with `processor`. One processor per queue.
    pub fn register(
        &self,
        queue: &str,
        processor: Arc<dyn JobProcessor>,
        options: WorkerOptions,
    ) -> Result<(), QueueError> {
        let mut registrations = self
            .registrations
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if registrations.contains_key(queue) {
            return Err(QueueError::AlreadyRegistered {
                queue: queue.to_string(),
            });
        }

        let concurrency = options.concurrency.max(1);
        let permits = Arc::new(Semaphore::new(concurrency));
        let pull = PullLoop {
            queue: queue.to_string(),
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            processor,
            options,
            permits: Arc::clone(&permits),
            limiter: options.rate_limit.map(|l| Mutex::new(RateLimiter::new(l))),
            shutdown: self.shutdown_tx.subscribe(),
        };

        info!(
            queue = %queue,
            concurrency,
            rate_limit = ?options.rate_limit,
            "Starting worker"
        );
        let span = info_span!("worker", queue = %queue);
        let handle = tokio::spawn(pull.run().instrument(span));

        registrations.insert(
            queue.to_string(),
            Registration {
                handle,
                permits,
                concurrency,
            },
        );
        Ok(())
    }

    /// Registered queue names.
    pub fn queues(&self) -> Vec<String> {
        let registrations = self
            .registrations
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        registrations.keys().cloned().collect()
    }

    /// Stop claiming new jobs and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let drained: Vec<(String, Registration)> = {
            let mut registrations = self
                .registrations
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            registrations.drain().collect()
        };

        let mut loops = Vec::with_capacity(drained.len());
        let mut in_flight = Vec::with_capacity(drained.len());
        for (queue, registration) in drained {
            loops.push(registration.handle);
            in_flight.push((queue, registration.permits, registration.concurrency));
        }

        join_all(loops).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Worker loop panicked");
            }
        });

        for (queue, permits, concurrency) in in_flight {
            let wanted = u32::try_from(concurrency).unwrap_or(u32::MAX);
            if permits.acquire_many(wanted).await.is_ok() {
                debug!(queue = %queue, "Worker drained");
            }
        }
        info!("Worker pool stopped");
    }
}

struct PullLoop {
    queue: String,
    store: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    processor: Arc<dyn JobProcessor>,
    options: WorkerOptions,
    permits: Arc<Semaphore>,
    limiter: Option<Mutex<RateLimiter>>,
    shutdown: watch::Receiver<bool>,
}

impl PullLoop {
    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Wait on `fut` unless shutdown is signalled first.
    async fn or_shutdown<T>(&mut self, fut: impl std::future::Future<Output = T>) -> Option<T> {
        if self.stopping() {
            return None;
        }
        tokio::select! {
            out = fut => Some(out),
            _ = self.shutdown.changed() => None,
        }
    }

    async fn run(mut self) {
        loop {
            if self.stopping() {
                break;
            }

            let permits = Arc::clone(&self.permits);
            let permit = match self.or_shutdown(permits.acquire_owned()).await {
                Some(Ok(permit)) => permit,
                _ => break,
            };

            if !self.wait_for_rate_limit().await {
                break;
            }

            match self.store.claim_next_job(&self.queue, Utc::now()).await {
                Ok(Some(job)) => {
                    if let Some(limiter) = &self.limiter {
                        limiter
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .record(self.clock.now());
                    }
                    self.dispatch(job, permit);
                }
                Ok(None) => {
                    drop(permit);
                    let idle = self.options.idle_sleep();
                    trace!("No waiting jobs, polling again in {idle:?}");
                    if self.or_shutdown(tokio::time::sleep(idle)).await.is_none() {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!("Failed to claim job: {e}");
                    let idle = self.options.idle_sleep();
                    if self.or_shutdown(tokio::time::sleep(idle)).await.is_none() {
                        break;
                    }
                }
            }
        }
        debug!("Worker loop exited");
    }

    /// Sleep until the limiter admits one more start. False on shutdown.
    async fn wait_for_rate_limit(&mut self) -> bool {
        loop {
            let wait = match &self.limiter {
                Some(limiter) => limiter
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .time_until_available(self.clock.now()),
                None => return true,
            };
            if wait.is_zero() {
                return true;
            }
            debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
            let clock = Arc::clone(&self.clock);
            if self.or_shutdown(clock.sleep(wait)).await.is_none() {
                return false;
            }
        }
    }

    fn dispatch(&self, job: Job, permit: tokio::sync::OwnedSemaphorePermit) {
        let store = Arc::clone(&self.store);
        let processor = Arc::clone(&self.processor);
        let span = info_span!(
            "job",
            job.id = %job.id,
            job.name = %job.name,
            attempt = job.attempts,
        );

        tokio::spawn(
            async move {
                let _permit = permit;
                debug!("Running job");

                let outcome = AssertUnwindSafe(processor.process(&job))
                    .catch_unwind()
                    .await
                    .map_err(|panic| panic_message(&*panic))
                    .and_then(|result| result.map_err(|e| e.to_string()));

                finish(store.as_ref(), &job, outcome).await;
            }
            .instrument(span),
        );
    }
}

async fn finish(store: &dyn Database, job: &Job, outcome: Result<(), String>) {
    match outcome {
        Ok(()) => match store.complete_job(job.id).await {
            Ok(()) => info!("Job completed"),
            Err(e) => error!("Failed to mark job completed: {e}"),
        },
        Err(reason) => {
            let retry_in = job.retry_delay();
            let retry_at = retry_in
                .map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or_default());

            if let Err(e) = store.fail_job(job.id, &reason, retry_at).await {
                error!("Failed to record job failure: {e}");
                return;
            }
            match retry_in {
                Some(delay) => warn!(
                    error = %reason,
                    retry_in_ms = delay.as_millis() as u64,
                    "Job failed, will retry"
                ),
                None => error!(
                    error = %reason,
                    attempts = job.attempts,
                    "Job failed permanently"
                ),
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("job panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("job panicked: {s}")
    } else {
        "job panicked".to_string()
    }
}
