//! Background job lifecycle
//!
//! Every background activity is a [`Job`]: `start` spawns the job's own task
//! and returns at once, `stop` signals it and waits for it to finish. The
//! [`JobManager`] starts jobs in registration order and stops them all
//! concurrently under one shared deadline.
//!
//! Failure policy: a monitoring job that fails to start is logged and the rest
//! keep starting; a critical job (the admin listener) aborts startup.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    /// Spawn the job's task. Must not block.
    fn start(&self) -> anyhow::Result<()>;

    /// Signal the task and wait for it to exit
    async fn stop(&self);
}

struct Registered {
    job: Arc<dyn Job>,
    critical: bool,
}

/// Outcome of [`JobManager::stop_all`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub stopped: Vec<String>,
    pub timed_out: Vec<String>,
}

#[derive(Default)]
pub struct JobManager {
    jobs: Vec<Registered>,
}

impl JobManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an independent monitoring job
    pub fn register(&mut self, job: Arc<dyn Job>) {
        self.jobs.push(Registered {
            job,
            critical: false,
        });
    }

    /// Register a job whose start failure aborts [`JobManager::start_all`]
    pub fn register_critical(&mut self, job: Arc<dyn Job>) {
        self.jobs.push(Registered {
            job,
            critical: true,
        });
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.jobs.iter().map(|r| r.job.name().to_string()).collect()
    }

    pub fn start_all(&self) -> anyhow::Result<()> {
        for registered in &self.jobs {
            let name = registered.job.name();
            match registered.job.start() {
                Ok(()) => info!(job = name, "Job started"),
                Err(e) if registered.critical => {
                    error!(job = name, error = %e, "Critical job failed to start");
                    return Err(e.context(format!("critical job '{}' failed to start", name)));
                }
                Err(e) => {
                    error!(job = name, error = %e, "Job failed to start, continuing");
                }
            }
        }
        Ok(())
    }

    /// Stop every job concurrently; jobs still running at the deadline are
    /// reported and abandoned.
    pub async fn stop_all(&self, timeout: Duration) -> StopReport {
        let deadline = Instant::now() + timeout;

        let results = join_all(self.jobs.iter().map(|registered| {
            let job = Arc::clone(&registered.job);
            async move {
                let name = job.name().to_string();
                let stopped = tokio::time::timeout_at(deadline, job.stop()).await.is_ok();
                (name, stopped)
            }
        }))
        .await;

        let mut report = StopReport::default();
        for (name, stopped) in results {
            if stopped {
                debug!(job = %name, "Job stopped");
                report.stopped.push(name);
            } else {
                warn!(
                    job = %name,
                    timeout_secs = timeout.as_secs_f64(),
                    "Job did not stop before the deadline"
                );
                report.timed_out.push(name);
            }
        }

        info!(
            stopped = report.stopped.len(),
            timed_out = report.timed_out.len(),
            "All jobs stopped"
        );
        report
    }
}

/// Body of a fixed-interval job
#[async_trait]
pub trait Tick: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn tick(&self);
}

/// Runs a [`Tick`] every `interval`, or early when `wake` is notified
pub struct PeriodicJob<T: Tick> {
    task: Arc<T>,
    interval: Duration,
    wake: Option<Arc<Notify>>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Tick> PeriodicJob<T> {
    pub fn new(task: Arc<T>, interval: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            task,
            interval,
            wake: None,
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = Some(wake);
        self
    }

    pub fn task(&self) -> &Arc<T> {
        &self.task
    }
}

#[async_trait]
impl<T: Tick> Job for PeriodicJob<T> {
    fn name(&self) -> &str {
        self.task.name()
    }

    fn start(&self) -> anyhow::Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            anyhow::bail!("job '{}' is already started", self.task.name());
        }

        let task = Arc::clone(&self.task);
        let interval = self.interval;
        let wake = self.wake.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        *handle = Some(tokio::spawn(async move {
            debug!(job = task.name(), interval_ms = interval.as_millis() as u64, "Job loop running");
            loop {
                let woken = async {
                    match &wake {
                        Some(notify) => notify.notified().await,
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    _ = tokio::time::sleep(interval) => task.tick().await,
                    _ = woken => {
                        debug!(job = task.name(), "Job woken early");
                        task.tick().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(job = task.name(), "Job loop exited");
        }));

        Ok(())
    }

    async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(job = self.task.name(), error = %e, "Job task ended abnormally");
            }
        }
    }
}
