//! Periodic job runner.
//!
//! The coordinators never own timers themselves; they expose plain async
//! operations (sweep, retry, stale check, discovery ping) and the daemon
//! registers those with a [`Scheduler`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::BoxFuture;
use log::debug;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Job body; called once per tick.
pub type Job = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure into a [`Job`].
pub fn job<F, Fut>(f: F) -> Job
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move || Box::pin(f()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle(u64);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid period for job `{0}`: must be non-zero")]
    ZeroPeriod(String),
    #[error("scheduler is shut down")]
    ShutDown,
}

pub trait Scheduler: Send + Sync {
    fn add_periodic(&self, name: &str, every: Duration, job: Job) -> Result<JobHandle, SchedulerError>;

    fn remove(&self, handle: JobHandle);
}

/// [`Scheduler`] backed by one tokio task per job.
pub struct TokioScheduler {
    next_id: AtomicU64,
    jobs: Mutex<Option<HashMap<JobHandle, JoinHandle<()>>>>,
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            jobs: Mutex::new(Some(HashMap::new())),
        }
    }

    /// Cancels every job; later registrations fail.
    pub fn shutdown(&self) {
        let jobs = match self.jobs.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        for (_, task) in jobs.into_iter().flatten() {
            task.abort();
        }
    }
}

impl Scheduler for TokioScheduler {
    fn add_periodic(&self, name: &str, every: Duration, job: Job) -> Result<JobHandle, SchedulerError> {
        if every.is_zero() {
            return Err(SchedulerError::ZeroPeriod(name.to_string()));
        }
        let mut guard = self.jobs.lock().map_err(|_| SchedulerError::ShutDown)?;
        let jobs = guard.as_mut().ok_or(SchedulerError::ShutDown)?;

        let handle = JobHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let name = name.to_string();
        let task = tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                debug!("Running periodic job {}", name);
                job().await;
            }
        });
        jobs.insert(handle, task);
        Ok(handle)
    }

    fn remove(&self, handle: JobHandle) {
        if let Ok(mut guard) = self.jobs.lock() {
            if let Some(task) = guard.as_mut().and_then(|jobs| jobs.remove(&handle)) {
                task.abort();
            }
        }
    }
}
