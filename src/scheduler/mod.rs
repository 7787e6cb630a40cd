//! Bounded-concurrency batch scheduler.
//!
//! [`BatchScheduler::run_batch`] runs every job in its own tokio task, with a
//! semaphore capping how many run at once. Each job may get a [`PortLease`]
//! from the scheduler's [`PortAllocator`] and is bounded by an optional
//! per-job timeout. Outcomes are handed to a callback in completion order
//! (for intermediate snapshots) and returned tagged with their job id.
//!
//! A job that already has a persisted outcome (`Job::resumed`) is recorded as
//! completed without running the worker.

pub mod jobs;
pub mod ports;
pub mod server;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub use jobs::{JobRecord, JobStatus, JobTable};
pub use ports::{PortAllocator, PortError, PortLease};
pub use server::{DEFAULT_SERVER_COMMAND, ServerError, StaticServer};

/// Outcome type produced by a worker for payload `T`.
///
/// The scheduler needs to synthesize outcomes for jobs that never produced
/// one themselves.
pub trait JobOutcome<T>: Send + 'static {
    fn status(&self) -> JobStatus;
    fn timed_out(payload: &T, after: Duration) -> Self;
    fn crashed(payload: &T, detail: String) -> Self;
}

/// One unit of work.
#[derive(Debug, Clone)]
pub struct Job<T, R> {
    pub label: String,
    pub payload: T,
    /// Outcome persisted by an earlier run
    pub resumed: Option<R>,
}

impl<T, R> Job<T, R> {
    pub fn new(label: impl Into<String>, payload: T) -> Self {
        Self {
            label: label.into(),
            payload,
            resumed: None,
        }
    }

    pub fn resumed(mut self, outcome: Option<R>) -> Self {
        self.resumed = outcome;
        self
    }
}

/// What a worker receives besides its payload.
#[derive(Debug)]
pub struct JobContext {
    pub job_id: usize,
    pub port: Option<PortLease>,
}

pub struct BatchScheduler {
    concurrency: usize,
    job_timeout: Option<Duration>,
    ports: Option<Arc<PortAllocator>>,
    jobs: Arc<JobTable>,
}

impl BatchScheduler {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            job_timeout: None,
            ports: None,
            jobs: Arc::new(JobTable::new()),
        }
    }

    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    /// Lease one port per running job from `allocator`.
    pub fn ports(mut self, allocator: Arc<PortAllocator>) -> Self {
        self.ports = Some(allocator);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Live job table, shared with workers and observers.
    pub fn jobs(&self) -> Arc<JobTable> {
        Arc::clone(&self.jobs)
    }

    /// Run `jobs` with at most `concurrency` workers at a time.
    ///
    /// Returns exactly one `(job_id, outcome)` per job, in completion order.
    pub async fn run_batch<T, R, W, Fut, C>(
        &self,
        jobs: Vec<Job<T, R>>,
        worker: W,
        mut on_complete: C,
    ) -> Vec<(usize, R)>
    where
        T: Clone + Send + 'static,
        R: JobOutcome<T>,
        W: Fn(JobContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        C: FnMut(usize, &R),
    {
        self.jobs.reset(jobs.iter().map(|j| j.label.clone()));
        let total = jobs.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let worker = Arc::new(worker);
        let mut payloads: Vec<Option<T>> = Vec::with_capacity(total);
        let mut results: Vec<(usize, R)> = Vec::with_capacity(total);
        let mut set = JoinSet::new();

        info!(total, concurrency = self.concurrency, "batch started");
        for (job_id, job) in jobs.into_iter().enumerate() {
            if let Some(done) = job.resumed {
                info!(job_id, label = %job.label, "already completed, skipping");
                self.jobs.mark_resumed(job_id, done.status());
                on_complete(job_id, &done);
                results.push((job_id, done));
                payloads.push(None);
                continue;
            }
            payloads.push(Some(job.payload.clone()));

            let semaphore = Arc::clone(&semaphore);
            let worker = Arc::clone(&worker);
            let table = Arc::clone(&self.jobs);
            let ports = self.ports.clone();
            let job_timeout = self.job_timeout;
            let payload = job.payload;
            set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        table.finish(job_id, JobStatus::Error);
                        return (job_id, R::crashed(&payload, "scheduler closed".to_string()));
                    }
                };
                let port = match ports.as_ref().map(|p| p.acquire()).transpose() {
                    Ok(port) => port,
                    Err(e) => {
                        table.finish(job_id, JobStatus::Error);
                        return (job_id, R::crashed(&payload, e.to_string()));
                    }
                };
                table.mark_running(job_id, port.as_ref().map(PortLease::port));

                let fallback = payload.clone();
                let run = AssertUnwindSafe(worker(JobContext { job_id, port }, payload)).catch_unwind();
                let caught = match job_timeout {
                    Some(limit) => match tokio::time::timeout(limit, run).await {
                        Ok(caught) => caught,
                        Err(_) => {
                            warn!(job_id, timeout_secs = limit.as_secs(), "job timed out");
                            table.finish(job_id, JobStatus::Timeout);
                            return (job_id, R::timed_out(&fallback, limit));
                        }
                    },
                    None => run.await,
                };
                let outcome = caught.unwrap_or_else(|panic| {
                    let detail = panic_message(panic.as_ref());
                    error!(job_id, %detail, "job panicked");
                    R::crashed(&fallback, format!("worker panicked: {}", detail))
                });
                table.finish(job_id, outcome.status());
                (job_id, outcome)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((job_id, outcome)) => {
                    on_complete(job_id, &outcome);
                    results.push((job_id, outcome));
                }
                Err(e) => error!(error = %e, "worker task failed"),
            }
        }

        // A task that died outside the panic guard still owes an outcome.
        if results.len() < total {
            let mut seen = vec![false; total];
            for (job_id, _) in &results {
                seen[*job_id] = true;
            }
            for (job_id, payload) in payloads.into_iter().enumerate() {
                if let (false, Some(payload)) = (seen[job_id], payload) {
                    let outcome = R::crashed(&payload, "worker task aborted".to_string());
                    self.jobs.finish(job_id, JobStatus::Error);
                    on_complete(job_id, &outcome);
                    results.push((job_id, outcome));
                }
            }
        }

        info!(total, "batch finished");
        results
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    enum Out {
        Done(u32),
        TimedOut(u32),
        Crashed(u32, String),
    }

    impl JobOutcome<u32> for Out {
        fn status(&self) -> JobStatus {
            match self {
                Out::Done(_) => JobStatus::Completed,
                Out::TimedOut(_) => JobStatus::Timeout,
                Out::Crashed(..) => JobStatus::Error,
            }
        }

        fn timed_out(payload: &u32, _after: Duration) -> Self {
            Out::TimedOut(*payload)
        }

        fn crashed(payload: &u32, detail: String) -> Self {
            Out::Crashed(*payload, detail)
        }
    }

    fn jobs(n: u32) -> Vec<Job<u32, Out>> {
        (0..n).map(|i| Job::new(format!("job {}", i), i)).collect()
    }

    #[tokio::test]
    async fn test_concurrency_bound_respected() {
        let scheduler = BatchScheduler::new(2);
        let table = scheduler.jobs();
        let observed = Arc::new(AtomicUsize::new(0));
        let watcher = Arc::clone(&observed);

        let results = scheduler
            .run_batch(
                jobs(6),
                move |_ctx, n| {
                    let table = Arc::clone(&table);
                    let watcher = Arc::clone(&watcher);
                    async move {
                        watcher.fetch_max(table.running_count(), Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Out::Done(n)
                    }
                },
                |_, _| {},
            )
            .await;

        assert_eq!(results.len(), 6);
        assert!(observed.load(Ordering::SeqCst) <= 2);
        assert!(scheduler.jobs().peak_running() <= 2);
        assert!(scheduler.jobs().snapshot().iter().all(|r| r.status == JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_panic_becomes_crashed_outcome() {
        let scheduler = BatchScheduler::new(3);
        let results = scheduler
            .run_batch(
                jobs(3),
                |_ctx, n| async move {
                    if n == 1 {
                        panic!("boom");
                    }
                    Out::Done(n)
                },
                |_, _| {},
            )
            .await;
        let crashed: Vec<_> = results.iter().filter(|(_, o)| matches!(o, Out::Crashed(..))).collect();
        assert_eq!(crashed.len(), 1);
        assert_eq!(crashed[0].0, 1);
        assert!(matches!(&crashed[0].1, Out::Crashed(1, d) if d.contains("boom")));
        assert_eq!(scheduler.jobs().snapshot()[1].status, JobStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_timeout() {
        let scheduler = BatchScheduler::new(2).job_timeout(Duration::from_secs(5));
        let results = scheduler
            .run_batch(
                jobs(2),
                |_ctx, n| async move {
                    if n == 0 {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                    Out::Done(n)
                },
                |_, _| {},
            )
            .await;
        assert!(results.contains(&(0, Out::TimedOut(0))));
        assert!(results.contains(&(1, Out::Done(1))));
        assert_eq!(scheduler.jobs().snapshot()[0].status, JobStatus::Timeout);
    }

    #[tokio::test]
    async fn test_resumed_jobs_not_executed() {
        let scheduler = BatchScheduler::new(2);
        let executed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&executed);
        let batch: Vec<Job<u32, Out>> = (0..4)
            .map(|i| Job::new(format!("job {}", i), i).resumed((i < 3).then_some(Out::Done(i))))
            .collect();

        let mut completions = Vec::new();
        let results = scheduler
            .run_batch(
                batch,
                move |_ctx, n| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move { Out::Done(n) }
                },
                |id, _| completions.push(id),
            )
            .await;

        assert_eq!(executed.load(Ordering::SeqCst), 1);
        assert_eq!(results.len(), 4);
        assert_eq!(completions.len(), 4);
        assert!(scheduler.jobs().snapshot()[0].resumed);
    }

    #[tokio::test]
    async fn test_ports_leased_and_returned() {
        let base = std::net::TcpListener::bind(("127.0.0.1", 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let allocator = PortAllocator::new(base, 100);
        let scheduler = BatchScheduler::new(2).ports(Arc::clone(&allocator));
        let results = scheduler
            .run_batch(
                jobs(4),
                |ctx, n| async move {
                    assert!(ctx.port.is_some());
                    Out::Done(n)
                },
                |_, _| {},
            )
            .await;
        assert_eq!(results.len(), 4);
        assert_eq!(allocator.leased_count(), 0);
        assert!(scheduler.jobs().snapshot().iter().all(|r| r.assigned_port.is_some()));
    }
}
