//! Live scheduling: run a job on a fixed cadence from a background thread.
//!
//! The scheduler wakes once per `resolution`. When the cadence is shorter
//! than the resolution several firings are due per wake, so up to
//! `ceil(resolution / cadence)` instances may run at once. Firings beyond
//! that bound are logged and counted as overflow. The closing callback runs
//! exactly once after the loop stops, whatever stopped it.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LiveError {
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

// ── Shutdown ─────────────────────────────────────────────────────────

/// Cooperative stop flag with a wakeup for sleepers. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

#[derive(Debug, Default)]
struct ShutdownInner {
    flag: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let _guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.wake.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Sleep up to `timeout`. Returns `true` as soon as shutdown is requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        while !self.is_triggered() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = match self.inner.wake.wait_timeout(guard, deadline - now) {
                Ok((g, _)) => g,
                Err(e) => e.into_inner().0,
            };
        }
        true
    }
}

// ── Schedule ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveSchedule {
    cadence: Duration,
    resolution: Duration,
}

impl LiveSchedule {
    pub fn new(cadence: Duration, resolution: Duration) -> Result<Self, LiveError> {
        if cadence.is_zero() {
            return Err(LiveError::ZeroDuration("cadence"));
        }
        if resolution.is_zero() {
            return Err(LiveError::ZeroDuration("resolution"));
        }
        Ok(Self { cadence, resolution })
    }

    pub fn cadence(&self) -> Duration {
        self.cadence
    }

    pub fn resolution(&self) -> Duration {
        self.resolution
    }

    /// `max(1, ceil(resolution / cadence))`.
    pub fn max_instances(&self) -> usize {
        let cadence = self.cadence.as_nanos();
        let n = self.resolution.as_nanos().div_ceil(cadence);
        usize::try_from(n).unwrap_or(usize::MAX).max(1)
    }

    /// Firings due at `elapsed` since start that come after `fired` firings.
    /// The first firing is due immediately.
    fn due(&self, elapsed: Duration, fired: u64) -> u64 {
        let total = elapsed.as_nanos() / self.cadence.as_nanos() + 1;
        u64::try_from(total).unwrap_or(u64::MAX).saturating_sub(fired)
    }
}

// ── Scheduler ────────────────────────────────────────────────────────

/// Totals once the scheduler has stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    /// Instances started.
    pub started: u64,
    /// Due firings skipped because `max_instances` were already running.
    pub overflowed: u64,
    /// Instances that panicked.
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    started: AtomicU64,
    overflowed: AtomicU64,
    failed: AtomicU64,
    running: AtomicUsize,
}

/// A running scheduler thread.
pub struct LiveScheduler {
    schedule: LiveSchedule,
    shutdown: ShutdownSignal,
    counters: Arc<Counters>,
    handle: Option<JoinHandle<()>>,
}

impl LiveScheduler {
    /// Start the scheduler thread.
    ///
    /// `job` receives the firing number and the shutdown signal so a long
    /// iteration can stop early. `on_close` runs once after the loop ends
    /// and every running instance has finished.
    pub fn spawn<J, C>(schedule: LiveSchedule, shutdown: ShutdownSignal, job: J, on_close: C) -> Self
    where
        J: Fn(u64, &ShutdownSignal) + Send + Sync + 'static,
        C: FnOnce() + Send + 'static,
    {
        let counters = Arc::new(Counters::default());
        let handle = {
            let counters = Arc::clone(&counters);
            let shutdown = shutdown.clone();
            thread::spawn(move || run_loop(schedule, shutdown, Arc::new(job), counters, on_close))
        };
        Self {
            schedule,
            shutdown,
            counters,
            handle: Some(handle),
        }
    }

    pub fn schedule(&self) -> LiveSchedule {
        self.schedule
    }

    pub fn running(&self) -> usize {
        self.counters.running.load(Ordering::SeqCst)
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Request shutdown and wait for the thread, including `on_close`.
    pub fn stop(mut self) -> SchedulerReport {
        self.shutdown.trigger();
        self.join()
    }

    fn join(&mut self) -> SchedulerReport {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("scheduler thread panicked");
            }
        }
        SchedulerReport {
            started: self.counters.started.load(Ordering::SeqCst),
            overflowed: self.counters.overflowed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
        }
    }
}

impl Drop for LiveScheduler {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown.trigger();
            self.join();
        }
    }
}

fn run_loop<J, C>(
    schedule: LiveSchedule,
    shutdown: ShutdownSignal,
    job: Arc<J>,
    counters: Arc<Counters>,
    on_close: C,
) where
    J: Fn(u64, &ShutdownSignal) + Send + Sync + 'static,
    C: FnOnce(),
{
    let max_instances = schedule.max_instances();
    let start = Instant::now();
    let mut fired: u64 = 0;
    let mut instances: Vec<JoinHandle<bool>> = Vec::new();
    info!(
        cadence_ms = schedule.cadence.as_millis() as u64,
        resolution_ms = schedule.resolution.as_millis() as u64,
        max_instances,
        "live scheduler started"
    );

    while !shutdown.is_triggered() {
        instances.retain(|h| !h.is_finished());

        for _ in 0..schedule.due(start.elapsed(), fired) {
            let n = fired;
            fired += 1;
            if counters.running.load(Ordering::SeqCst) >= max_instances {
                counters.overflowed.fetch_add(1, Ordering::SeqCst);
                warn!(firing = n, max_instances, "job still running at max instances, firing skipped");
                continue;
            }
            counters.running.fetch_add(1, Ordering::SeqCst);
            counters.started.fetch_add(1, Ordering::SeqCst);
            let job = Arc::clone(&job);
            let counters = Arc::clone(&counters);
            let signal = shutdown.clone();
            instances.push(thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| job(n, &signal)));
                counters.running.fetch_sub(1, Ordering::SeqCst);
                if outcome.is_err() {
                    counters.failed.fetch_add(1, Ordering::SeqCst);
                    error!(firing = n, "job instance panicked");
                }
                outcome.is_ok()
            }));
        }

        if shutdown.wait_timeout(schedule.resolution) {
            break;
        }
    }

    debug!(running = instances.len(), "waiting for job instances");
    for handle in instances {
        let _ = handle.join();
    }
    on_close();
    info!(
        started = counters.started.load(Ordering::SeqCst),
        overflowed = counters.overflowed.load(Ordering::SeqCst),
        "live scheduler stopped"
    );
}
