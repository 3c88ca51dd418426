//! Background job scheduling
//!
//! Everything that touches the camera, the chat or the filesystem runs as a
//! spawned job so the connection task never waits on it. Recurring timers do
//! not call back into components directly; they send a [`Tick`] into the
//! connection task, which owns all printer state.

use anyhow::Result;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

/// Ticks delivered by recurring timers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Re-issue printer identification while Klippy is not ready
    Reconnect,
    /// Periodic status notification
    Notifier,
    /// Periodic timelapse frame
    Timelapse,
}

pub type TickSender = mpsc::UnboundedSender<Tick>;

/// Spawns one-shot and recurring jobs
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    spawned: Arc<AtomicUsize>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` in the background, logging its error if it fails
    pub fn spawn<F>(&self, name: &'static str, job: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.spawned.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            if let Err(e) = job.await {
                error!("Job {} failed: {:#}", name, e);
            }
        })
    }

    /// Run `job` once after `delay`
    pub fn spawn_after<F>(&self, name: &'static str, delay: Duration, job: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.spawn(name, async move {
            tokio::time::sleep(delay).await;
            job.await
        })
    }

    /// Send `tick` every `period`, first tick one period from now.
    ///
    /// The timer stops when the returned handle is cancelled or dropped.
    pub fn arm_ticker(
        &self,
        name: &'static str,
        period: Duration,
        tick: Tick,
        tx: TickSender,
    ) -> TimerHandle {
        debug!("Arming {} timer every {:?}", name, period);
        // interval_at so the first tick is a full period away (interval() ticks immediately)
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if tx.send(tick).is_err() {
                    break;
                }
            }
        });
        TimerHandle { name, task }
    }

    /// Number of jobs spawned so far
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }
}

/// Handle to a recurring timer; aborts the timer on drop
#[derive(Debug)]
pub struct TimerHandle {
    name: &'static str,
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancel(self) {
        debug!("Cancelling {} timer", self.name);
        // Drop aborts the task
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A job that is never run twice at the same time
#[derive(Debug, Clone, Default)]
pub struct SingletonJob {
    running: Arc<AtomicBool>,
    accepted: Arc<AtomicUsize>,
}

struct RunningFlag(Arc<AtomicBool>);

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SingletonJob {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `job` unless a previous run is still in progress.
    ///
    /// Returns whether the job was accepted.
    pub fn submit<F>(&self, scheduler: &Scheduler, name: &'static str, job: F) -> bool
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Job {} is already running, skipping", name);
            return false;
        }

        self.accepted.fetch_add(1, Ordering::Relaxed);
        let flag = RunningFlag(self.running.clone());
        scheduler.spawn(name, async move {
            let _flag = flag;
            job.await
        });
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of runs accepted so far
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::Relaxed)
    }
}

/// Fixed-size pool for capture jobs
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    in_flight: Arc<watch::Sender<usize>>,
    submitted: Arc<AtomicUsize>,
}

struct InFlight(Arc<watch::Sender<usize>>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let (in_flight, _) = watch::channel(0usize);
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
            in_flight: Arc::new(in_flight),
            submitted: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue `job`; at most `size` jobs run at once
    pub fn submit<F>(&self, name: &'static str, job: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.in_flight.send_modify(|n| *n += 1);

        let guard = InFlight(self.in_flight.clone());
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Err(e) = job.await {
                error!("Job {} failed: {:#}", name, e);
            }
        });
    }

    /// Jobs queued or running
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Jobs submitted over the pool's lifetime
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Wait until every queued job has finished
    pub async fn drain(&self) {
        let mut rx = self.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}
