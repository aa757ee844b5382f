//! Cooperative dispatch of due-time-ordered work on a worker pool.
//!
//! Work items carry a virtual due time and a [`SchedulerContext`] scoping
//! them to one (sub)pipeline. Items ready to run sit in a priority queue
//! keyed by `(due, sequence)`; when replay-clock enforcement is on,
//! future-due items wait in a timer queue and are promoted once the
//! virtual clock reaches them. With enforcement off, items dispatch as
//! soon as a worker can claim them, still in due-time order.
//!
//! Quiescence is per context: pausing a context stops timer promotion for
//! it and waits until every charged (ready or running) item has
//! completed, including cascade work those items schedule. Future-due
//! timer items do not count against quiescence.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::trace;

use tempo_time::{Clock, Time};

use crate::error::{Error, PipelineError};

type ErrorSink = Box<dyn Fn(PipelineError) + Send + Sync>;

/// A scoped group of work items, owned by one (sub)pipeline.
///
/// Items of a context are dispatched only between `start_scheduling` and
/// `stop_scheduling`; pausing gates promotion of future-due items while
/// in-flight work drains.
pub struct SchedulerContext {
    name: String,
    started: AtomicBool,
    paused: AtomicBool,
    stopped: AtomicBool,
    charged: Mutex<usize>,
    quiesce: Condvar,
    /// Charged items claimed before the context started.
    deferred_ready: Mutex<Vec<QueuedItem>>,
    /// Uncharged future-due items held while the context is paused.
    deferred_timers: Mutex<Vec<QueuedItem>>,
    error_sink: Mutex<Option<ErrorSink>>,
}

impl SchedulerContext {
    /// Creates a context named for diagnostics.
    pub fn new(name: &str) -> Arc<SchedulerContext> {
        Arc::new(SchedulerContext {
            name: name.to_string(),
            started: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            charged: Mutex::new(0),
            quiesce: Condvar::new(),
            deferred_ready: Mutex::new(Vec::new()),
            deferred_timers: Mutex::new(Vec::new()),
            error_sink: Mutex::new(None),
        })
    }

    /// The context name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once `start_scheduling` ran.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// True while paused for quiescence.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// True once `stop_scheduling` ran.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Routes captured component failures; set by the owning pipeline.
    pub fn set_error_sink(&self, sink: impl Fn(PipelineError) + Send + Sync + 'static) {
        *self.error_sink.lock().expect("context poisoned") = Some(Box::new(sink));
    }

    /// Number of charged (ready or running) items.
    pub fn charged_items(&self) -> usize {
        *self.charged.lock().expect("context poisoned")
    }

    fn charge(&self) {
        *self.charged.lock().expect("context poisoned") += 1;
    }

    fn discharge(&self) {
        let mut charged = self.charged.lock().expect("context poisoned");
        *charged -= 1;
        if *charged == 0 {
            self.quiesce.notify_all();
        }
    }

    /// Forwards a captured component failure to the owning pipeline.
    pub(crate) fn report_error(&self, error: PipelineError) {
        self.report(error);
    }

    fn report(&self, error: PipelineError) {
        if let Some(sink) = self.error_sink.lock().expect("context poisoned").as_ref() {
            sink(error);
        } else {
            log::error!("unobserved failure in {}: {error}", self.name);
        }
    }
}

/// A unit of scheduled work.
struct QueuedItem {
    due: Time,
    sequence: u64,
    context: Arc<SchedulerContext>,
    action: Box<dyn FnOnce() + Send>,
}

impl PartialEq for QueuedItem {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.sequence == other.sequence
    }
}
impl Eq for QueuedItem {}
impl PartialOrd for QueuedItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.sequence).cmp(&(other.due, other.sequence))
    }
}

#[derive(Default)]
struct QueueState {
    ready: BinaryHeap<Reverse<QueuedItem>>,
    timers: BinaryHeap<Reverse<QueuedItem>>,
}

struct SchedulerInner {
    state: Mutex<QueueState>,
    work_available: Condvar,
    clock: RwLock<Clock>,
    enforce_replay_clock: AtomicBool,
    shutdown: AtomicBool,
    next_sequence: AtomicU64,
}

/// A bounded worker pool dispatching due-time-ordered work items.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Clone for Scheduler {
    fn clone(&self) -> Self {
        Scheduler { inner: Arc::clone(&self.inner), workers: Arc::clone(&self.workers) }
    }
}

impl Scheduler {
    /// Creates a scheduler with `max_threads` workers (at least one).
    pub fn new(max_threads: usize) -> Scheduler {
        let inner = Arc::new(SchedulerInner {
            state: Mutex::new(QueueState::default()),
            work_available: Condvar::new(),
            clock: RwLock::new(Clock::real_time()),
            enforce_replay_clock: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            next_sequence: AtomicU64::new(0),
        });
        let workers = (0..max_threads.max(1))
            .map(|index| {
                let inner = Arc::clone(&inner);
                std::thread::Builder::new()
                    .name(format!("tempo-worker-{index}"))
                    .spawn(move || worker_loop(inner))
                    .expect("worker thread")
            })
            .collect();
        Scheduler { inner, workers: Arc::new(Mutex::new(workers)) }
    }

    /// Replaces the virtual clock; done once at pipeline start.
    pub fn set_clock(&self, clock: Clock) {
        *self.inner.clock.write().expect("scheduler poisoned") = clock;
    }

    /// The current virtual clock.
    pub fn clock(&self) -> Clock {
        *self.inner.clock.read().expect("scheduler poisoned")
    }

    /// Turns replay-clock enforcement on or off.
    pub fn set_enforce_replay_clock(&self, enforce: bool) {
        self.inner.enforce_replay_clock.store(enforce, Ordering::Release);
        self.inner.work_available.notify_all();
    }

    /// Whether future-due items are held until the clock reaches them.
    pub fn enforces_replay_clock(&self) -> bool {
        self.inner.enforce_replay_clock.load(Ordering::Acquire)
    }

    /// Enqueues `action` to run at virtual time `due` within `context`.
    pub fn schedule(
        &self,
        context: &Arc<SchedulerContext>,
        due: Time,
        action: impl FnOnce() + Send + 'static,
    ) {
        if context.is_stopped() {
            return;
        }
        let item = QueuedItem {
            due,
            sequence: self.inner.next_sequence.fetch_add(1, Ordering::Relaxed),
            context: Arc::clone(context),
            action: Box::new(action),
        };
        let mut state = self.inner.state.lock().expect("scheduler poisoned");
        let now = self.clock().now();
        if self.enforces_replay_clock() && due > now {
            state.timers.push(Reverse(item));
        } else {
            item.context.charge();
            state.ready.push(Reverse(item));
        }
        drop(state);
        self.inner.work_available.notify_one();
    }

    /// Opens `context` for dispatch, releasing any work deferred while it
    /// was not yet started.
    pub fn start_scheduling(&self, context: &Arc<SchedulerContext>) {
        context.started.store(true, Ordering::Release);
        let deferred_ready: Vec<QueuedItem> =
            context.deferred_ready.lock().expect("context poisoned").drain(..).collect();
        let deferred_timers: Vec<QueuedItem> =
            context.deferred_timers.lock().expect("context poisoned").drain(..).collect();
        let mut state = self.inner.state.lock().expect("scheduler poisoned");
        for item in deferred_ready {
            // Still charged from before.
            state.ready.push(Reverse(item));
        }
        for item in deferred_timers {
            state.timers.push(Reverse(item));
        }
        drop(state);
        self.inner.work_available.notify_all();
    }

    /// Blocks until every item of `context` due at or before the current
    /// virtual time has completed, including cascade work. Fails with
    /// [`Error::Timeout`] if quiescence is not reached within `timeout`.
    pub fn pause_for_quiescence(
        &self,
        context: &Arc<SchedulerContext>,
        timeout: Duration,
    ) -> Result<(), Error> {
        // Promote everything already due before gating further promotion,
        // so "due at or before now" really does run.
        {
            let mut state = self.inner.state.lock().expect("scheduler poisoned");
            let now = self.clock().now();
            let enforce = self.enforces_replay_clock();
            let mut rest = Vec::new();
            while let Some(Reverse(item)) = state.timers.pop() {
                if Arc::ptr_eq(&item.context, context) && (!enforce || item.due <= now) {
                    item.context.charge();
                    state.ready.push(Reverse(item));
                } else {
                    rest.push(item);
                }
            }
            for item in rest {
                state.timers.push(Reverse(item));
            }
        }
        context.paused.store(true, Ordering::Release);
        self.inner.work_available.notify_all();

        let deadline = Instant::now() + timeout;
        let mut charged = context.charged.lock().expect("context poisoned");
        while *charged > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                context.paused.store(false, Ordering::Release);
                return Err(Error::Timeout(format!("quiescence of context `{}`", context.name)));
            }
            let (guard, wait) = context
                .quiesce
                .wait_timeout(charged, remaining)
                .expect("context poisoned");
            charged = guard;
            if wait.timed_out() && *charged > 0 {
                context.paused.store(false, Ordering::Release);
                return Err(Error::Timeout(format!("quiescence of context `{}`", context.name)));
            }
        }
        Ok(())
    }

    /// Lifts a pause, releasing future-due items held meanwhile.
    pub fn resume_after_quiescence(&self, context: &Arc<SchedulerContext>) {
        context.paused.store(false, Ordering::Release);
        let deferred: Vec<QueuedItem> =
            context.deferred_timers.lock().expect("context poisoned").drain(..).collect();
        let mut state = self.inner.state.lock().expect("scheduler poisoned");
        for item in deferred {
            state.timers.push(Reverse(item));
        }
        drop(state);
        self.inner.work_available.notify_all();
    }

    /// Closes `context`: future-due items are discarded, new work is
    /// rejected, and already-ready work is dropped. In-flight items run
    /// to completion.
    pub fn stop_scheduling(&self, context: &Arc<SchedulerContext>) {
        context.stopped.store(true, Ordering::Release);
        context.deferred_timers.lock().expect("context poisoned").clear();
        for item in context.deferred_ready.lock().expect("context poisoned").drain(..) {
            item.context.discharge();
            drop(item);
        }
        let mut state = self.inner.state.lock().expect("scheduler poisoned");
        let mut keep = Vec::new();
        while let Some(Reverse(item)) = state.ready.pop() {
            if Arc::ptr_eq(&item.context, context) {
                item.context.discharge();
            } else {
                keep.push(item);
            }
        }
        for item in keep {
            state.ready.push(Reverse(item));
        }
        let mut keep = Vec::new();
        while let Some(Reverse(item)) = state.timers.pop() {
            if !Arc::ptr_eq(&item.context, context) {
                keep.push(item);
            }
        }
        for item in keep {
            state.timers.push(Reverse(item));
        }
        drop(state);
        self.inner.work_available.notify_all();
    }

    /// Stops the workers after the ready queue drains.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.work_available.notify_all();
        let workers: Vec<JoinHandle<()>> =
            self.workers.lock().expect("scheduler poisoned").drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
    }
}

fn worker_loop(inner: Arc<SchedulerInner>) {
    loop {
        let mut state = inner.state.lock().expect("scheduler poisoned");
        let claimed = loop {
            let enforce = inner.enforce_replay_clock.load(Ordering::Acquire);
            let now = inner.clock.read().expect("scheduler poisoned").now();

            // Promote due timers into the ready queue.
            loop {
                let due = match state.timers.peek() {
                    Some(Reverse(item)) => !enforce || item.due <= now,
                    None => false,
                };
                if !due {
                    break;
                }
                let Reverse(item) = state.timers.pop().expect("peeked");
                if item.context.is_stopped() {
                    continue;
                }
                if item.context.is_paused() {
                    let context = Arc::clone(&item.context);
                    context.deferred_timers.lock().expect("context poisoned").push(item);
                    continue;
                }
                item.context.charge();
                state.ready.push(Reverse(item));
            }

            // Claim the earliest dispatchable ready item.
            let mut claimed = None;
            while let Some(Reverse(item)) = state.ready.pop() {
                if item.context.is_stopped() {
                    item.context.discharge();
                    continue;
                }
                if !item.context.is_started() {
                    // Charged, but held back until the context opens.
                    let context = Arc::clone(&item.context);
                    context.deferred_ready.lock().expect("context poisoned").push(item);
                    continue;
                }
                claimed = Some(item);
                break;
            }
            if let Some(item) = claimed {
                break Some(item);
            }

            if inner.shutdown.load(Ordering::Acquire) {
                break None;
            }

            // Sleep until new work arrives, or until the next timer is due
            // under replay-clock enforcement.
            let next_due = state.timers.peek().map(|Reverse(item)| item.due);
            match next_due {
                Some(due) if enforce => {
                    let delay = inner
                        .clock
                        .read()
                        .expect("scheduler poisoned")
                        .real_delay_until(due)
                        .min(Duration::from_millis(50));
                    let (guard, _) = inner
                        .work_available
                        .wait_timeout(state, delay.max(Duration::from_micros(100)))
                        .expect("scheduler poisoned");
                    state = guard;
                }
                _ => {
                    let (guard, _) = inner
                        .work_available
                        .wait_timeout(state, Duration::from_millis(50))
                        .expect("scheduler poisoned");
                    state = guard;
                }
            }
        };

        let Some(item) = claimed else { return };
        drop(state);

        let QueuedItem { due, context, action, .. } = item;
        trace!("dispatch in `{}` due {due}", context.name());
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(action));
        if let Err(payload) = outcome {
            context.report(PipelineError {
                component: context.name().to_string(),
                message: panic_message(payload),
            });
        }
        context.discharge();
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("receiver action panicked")
    }
}
