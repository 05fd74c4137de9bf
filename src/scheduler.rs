//! Interval Job Scheduler
//!
//! Jobs are identified by id; registering an id that already exists replaces
//! the earlier job and cancels its timer, so timers never pile up. Each tick
//! spawns one run of the job as a tracked task.
//!
//! `stop` cancels the timers and returns at once, leaving in-flight runs to
//! finish on their own. `shutdown` also waits, up to a grace period, for those
//! runs to drain.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Shortest accepted interval; tokio intervals cannot be zero.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

struct Job {
    interval: Duration,
    task: JobFn,
    timer: Option<JoinHandle<()>>,
}

pub struct Scheduler {
    jobs: HashMap<String, Job>,
    running: bool,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            running: false,
            tracker: TaskTracker::new(),
        }
    }

    /// Install a periodic job. The first run happens one full `interval`
    /// after the timer starts. Re-registering `job_id` replaces the old job.
    pub fn register<F, Fut>(&mut self, job_id: impl Into<String>, interval: Duration, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let job_id = job_id.into();
        let interval = interval.max(MIN_INTERVAL);
        let task: JobFn = Arc::new(move || Box::pin(task()) as JobFuture);

        if let Some(previous) = self.jobs.remove(&job_id) {
            if let Some(timer) = previous.timer {
                timer.abort();
            }
            info!(job_id = %job_id, "replacing existing job");
        }

        let timer = self
            .running
            .then(|| self.spawn_timer(&job_id, interval, task.clone()));
        self.jobs.insert(
            job_id,
            Job {
                interval,
                task,
                timer,
            },
        );
    }

    /// Remove a job. In-flight runs are not interrupted.
    pub fn unregister(&mut self, job_id: &str) -> bool {
        match self.jobs.remove(job_id) {
            Some(job) => {
                if let Some(timer) = job.timer {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    pub fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        self.tracker.reopen();

        let timers: Vec<(String, JoinHandle<()>)> = self
            .jobs
            .iter()
            .map(|(id, job)| (id.clone(), self.spawn_timer(id, job.interval, job.task.clone())))
            .collect();
        for (id, timer) in timers {
            if let Some(job) = self.jobs.get_mut(&id) {
                job.timer = Some(timer);
            }
        }
        info!(jobs = self.jobs.len(), "scheduler started");
    }

    /// Cancel all timers. Never blocks and is safe to call when not running.
    pub fn stop(&mut self) {
        for job in self.jobs.values_mut() {
            if let Some(timer) = job.timer.take() {
                timer.abort();
            }
        }
        if self.running {
            self.running = false;
            info!(in_flight = self.tracker.len(), "scheduler stopped");
        }
    }

    /// Stop, then wait up to `grace` for in-flight runs. Returns whether
    /// every run finished in time.
    pub async fn shutdown(&mut self, grace: Duration) -> bool {
        self.stop();
        self.tracker.close();
        let drained = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();
        if !drained {
            warn!(
                in_flight = self.tracker.len(),
                grace_ms = grace.as_millis() as u64,
                "in-flight runs did not finish before shutdown"
            );
        }
        drained
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Runs currently executing.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    fn spawn_timer(&self, job_id: &str, interval: Duration, task: JobFn) -> JoinHandle<()> {
        let tracker = self.tracker.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                debug!(job_id = %job_id, "job triggered");
                tracker.spawn(task());
            }
        })
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
