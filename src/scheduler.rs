//! Recurring background timers.
//!
//! Each [`TimerKind`] owns at most one timer loop. A loop sleeps for its
//! period, runs its tick, and only then starts the next sleep, so periods
//! are measured from completion and a slow tick never piles up behind
//! itself. Ticks of one kind are single-flight: a tick that finds another
//! tick of the same kind still running is skipped, not queued. Different
//! kinds run independently.
//!
//! Every loop belongs to the current session. [`PollScheduler::stop_all`]
//! cancels the session token (which also cancels in-flight ticks) and
//! bumps the epoch, so a loop that wakes up afterwards exits without
//! running.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Upper bound on a single tick unless the timer says otherwise.
pub const DEFAULT_MAX_RUN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    Heartbeat,
    StatsRefresh,
    Subscription,
    UpdateCheck,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Heartbeat => "heartbeat",
            Self::StatsRefresh => "stats-refresh",
            Self::Subscription => "subscription",
            Self::UpdateCheck => "update-check",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerState {
    Stopped,
    Scheduled,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started,
    /// A tick of this kind is already running.
    Skipped,
    /// No timer of this kind is installed.
    NotScheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSpec {
    pub period: Duration,
    /// Run the first tick as soon as the timer is installed.
    pub run_immediately: bool,
    pub max_run: Duration,
}

impl TimerSpec {
    pub fn every(period: Duration) -> Self {
        Self {
            period,
            run_immediately: false,
            max_run: DEFAULT_MAX_RUN,
        }
    }

    pub fn immediately(mut self) -> Self {
        self.run_immediately = true;
        self
    }

    pub fn with_max_run(mut self, max_run: Duration) -> Self {
        self.max_run = max_run;
        self
    }
}

pub type TickFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as a timer tick.
pub fn tick_fn<F, Fut>(f: F) -> TickFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

#[derive(Debug, Default)]
struct Flight {
    busy: AtomicBool,
}

impl Flight {
    fn try_acquire(self: &Arc<Self>) -> Option<FlightGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard(Arc::clone(self)))
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Clears the in-flight flag when dropped, whichever way the tick ended.
struct FlightGuard(Arc<Flight>);

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::Release);
    }
}

struct TimerSlot {
    spec: TimerSpec,
    task: TickFn,
    cancel: CancellationToken,
}

struct SchedulerInner {
    epoch: AtomicU64,
    session: Mutex<CancellationToken>,
    slots: Mutex<HashMap<TimerKind, TimerSlot>>,
    flights: Mutex<HashMap<TimerKind, Arc<Flight>>>,
}

impl SchedulerInner {
    fn flight(&self, kind: TimerKind) -> Arc<Flight> {
        let mut flights = self.flights.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(flights.entry(kind).or_default())
    }

    fn session(&self) -> CancellationToken {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Owns the named timers of one session.
#[derive(Clone)]
pub struct PollScheduler {
    inner: Arc<SchedulerInner>,
}

impl Default for PollScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PollScheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                epoch: AtomicU64::new(0),
                session: Mutex::new(CancellationToken::new()),
                slots: Mutex::new(HashMap::new()),
                flights: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Install (or replace) the timer for `kind`.
    ///
    /// A replaced timer stops before its next sleep ends; a tick it has in
    /// flight is allowed to finish and keeps the single-flight guard until
    /// it does.
    pub fn start(&self, kind: TimerKind, spec: TimerSpec, task: TickFn) {
        let session = self.inner.session();
        let cancel = session.child_token();
        let epoch = self.inner.epoch.load(Ordering::SeqCst);

        let mut slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slots.remove(&kind) {
            old.cancel.cancel();
        }

        tokio::spawn(timer_loop(
            Arc::clone(&self.inner),
            kind,
            spec,
            Arc::clone(&task),
            cancel.clone(),
            session,
            epoch,
        ));

        slots.insert(kind, TimerSlot { spec, task, cancel });
        drop(slots);

        log::info!(
            "Scheduled {} timer every {:?}{}",
            kind,
            spec.period,
            if spec.run_immediately { " (running now)" } else { "" }
        );
    }

    /// Replace the timer for `kind` with one using `period`, keeping its
    /// task. Returns false when no such timer exists or the period is
    /// unchanged.
    pub fn set_period(&self, kind: TimerKind, period: Duration) -> bool {
        let current = {
            let slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots
                .get(&kind)
                .map(|slot| (slot.spec, Arc::clone(&slot.task)))
        };
        let Some((spec, task)) = current else {
            return false;
        };
        if spec.period == period {
            return false;
        }

        let spec = TimerSpec {
            period,
            run_immediately: false,
            max_run: spec.max_run,
        };
        self.start(kind, spec, task);
        true
    }

    /// Tear down every timer and cancel in-flight ticks. Loops from the
    /// old session become no-ops even if they wake up later.
    pub fn stop_all(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);

        let old_session = {
            let mut session = self.inner.session.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *session, CancellationToken::new())
        };
        old_session.cancel();

        let drained: Vec<TimerKind> = {
            let mut slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.drain().map(|(kind, _)| kind).collect()
        };
        log::info!("Stopped all timers ({} active)", drained.len());
    }

    /// Run a tick of `kind` now, outside its schedule, unless one is
    /// already in flight. Does not move the next scheduled tick.
    pub fn trigger_now(&self, kind: TimerKind) -> TriggerOutcome {
        let task = {
            let slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
            match slots.get(&kind) {
                Some(slot) => (Arc::clone(&slot.task), slot.spec.max_run),
                None => return TriggerOutcome::NotScheduled,
            }
        };
        let (task, max_run) = task;

        let flight = self.inner.flight(kind);
        let Some(guard) = flight.try_acquire() else {
            log::debug!("{} already running, trigger skipped", kind);
            return TriggerOutcome::Skipped;
        };

        let session = self.inner.session();
        tokio::spawn(async move {
            execute_tick(kind, guard, &task, max_run, &session).await;
        });
        TriggerOutcome::Started
    }

    pub fn state(&self, kind: TimerKind) -> TimerState {
        if self.inner.flight(kind).is_busy() {
            return TimerState::Running;
        }
        let slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
        if slots.contains_key(&kind) {
            TimerState::Scheduled
        } else {
            TimerState::Stopped
        }
    }

    pub fn period(&self, kind: TimerKind) -> Option<Duration> {
        let slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(&kind).map(|slot| slot.spec.period)
    }

    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }
}

async fn timer_loop(
    inner: Arc<SchedulerInner>,
    kind: TimerKind,
    spec: TimerSpec,
    task: TickFn,
    cancel: CancellationToken,
    session: CancellationToken,
    epoch: u64,
) {
    let mut first = true;
    loop {
        if !(first && spec.run_immediately) {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(spec.period) => {}
            }
        }
        first = false;

        if cancel.is_cancelled() || inner.epoch.load(Ordering::SeqCst) != epoch {
            break;
        }

        let flight = inner.flight(kind);
        match flight.try_acquire() {
            Some(guard) => {
                execute_tick(kind, guard, &task, spec.max_run, &session).await;
            }
            None => log::debug!("{} tick skipped, previous tick still running", kind),
        }
    }
    log::debug!("{} timer loop exited", kind);
}

async fn execute_tick(
    kind: TimerKind,
    _guard: FlightGuard,
    task: &TickFn,
    max_run: Duration,
    session: &CancellationToken,
) -> TickOutcome {
    let outcome = tokio::select! {
        _ = session.cancelled() => TickOutcome::Cancelled,
        result = tokio::time::timeout(max_run, task()) => match result {
            Ok(Ok(())) => TickOutcome::Completed,
            Ok(Err(e)) => {
                log::warn!("{} tick failed: {}", kind, e);
                TickOutcome::Failed
            }
            Err(_) => {
                log::warn!("{} tick exceeded {:?}, abandoned", kind, max_run);
                TickOutcome::TimedOut
            }
        },
    };
    if outcome == TickOutcome::Cancelled {
        log::info!("{} tick cancelled", kind);
    }
    outcome
}
