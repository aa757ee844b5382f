//! Pipeline lifecycle: construction, start/stop ordering, completion,
//! and error propagation.
//!
//! A pipeline moves Initializing → Starting → Running → Stopping →
//! Final. The topology is frozen at start. Every source starts (and
//! receives its completion notifier) before any message is delivered in
//! the pipeline's context; subpipelines repeat the same contract within
//! their own context. On stop, sources are signaled first, pending
//! deliveries drain, emitters close, and the context drains again before
//! scheduling stops.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use log::{debug, warn};

use tempo_time::{Clock, Time};

use crate::error::{Error, PipelineError};
use crate::message::Message;
use crate::scheduling::{Scheduler, SchedulerContext};
use crate::streams::{DeliveryPolicy, Emitter, Receiver};

/// How long stop waits for in-flight work before giving up.
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Pipeline-wide configuration.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Scheduler worker count.
    pub max_threads: usize,
    /// Policy applied to edges that do not specify one.
    pub default_delivery_policy: DeliveryPolicy,
    /// How often `run` reports progress, when the replay is bounded.
    pub progress_report_interval: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            max_threads: std::thread::available_parallelism().map_or(4, |n| n.get()),
            default_delivery_policy: DeliveryPolicy::Unlimited,
            progress_report_interval: None,
        }
    }
}

/// How virtual time relates to real time for one run.
#[derive(Clone, Copy, Debug)]
pub struct ReplayDescriptor {
    /// Virtual time at which the run begins.
    pub start: Time,
    /// Virtual time at which replayed data ends, when known.
    pub end: Option<Time>,
    /// Virtual ticks per real tick; must be positive and finite.
    pub speed: f64,
    /// Hold future-due work until the virtual clock reaches it.
    pub enforce_replay_clock: bool,
}

impl ReplayDescriptor {
    /// A live run: virtual time is wall time, no enforcement.
    pub fn live() -> ReplayDescriptor {
        ReplayDescriptor {
            start: Time::now(),
            end: None,
            speed: 1.0,
            enforce_replay_clock: false,
        }
    }

    /// A replay over `[start, end]` at real-time speed with enforcement.
    pub fn replay(start: Time, end: Time) -> ReplayDescriptor {
        ReplayDescriptor { start, end: Some(end), speed: 1.0, enforce_replay_clock: true }
    }

    /// Scales replay speed.
    pub fn with_speed(mut self, speed: f64) -> ReplayDescriptor {
        self.speed = speed;
        self
    }

    /// Disables replay-clock enforcement (best-effort replay).
    pub fn best_effort(mut self) -> ReplayDescriptor {
        self.enforce_replay_clock = false;
        self
    }

    fn validate(&self) -> Result<(), Error> {
        if !(self.speed.is_finite() && self.speed > 0.0) {
            return Err(Error::InvalidArgument(format!(
                "replay speed must be positive, got {}",
                self.speed
            )));
        }
        if let Some(end) = self.end {
            if end < self.start {
                return Err(Error::InvalidArgument(String::from(
                    "replay end precedes replay start",
                )));
            }
        }
        Ok(())
    }
}

/// A component that generates messages on its own initiative.
///
/// `start` hands the component a [`CompletionNotifier`]; the component
/// invokes it with the originating time of its final message, or reports
/// indefinite operation for always-on sources. `stop` asks the component
/// to cease posting.
pub trait SourceComponent: Send {
    /// Begin producing; called before any message is delivered in the
    /// pipeline.
    fn start(&mut self, notifier: CompletionNotifier);
    /// Cease producing; called during the stop protocol.
    fn stop(&mut self, final_time: Time);
}

/// The channel through which a source reports its completion.
pub struct CompletionNotifier {
    shared: Weak<PipelineShared>,
    source_index: usize,
    fired: Arc<AtomicBool>,
}

impl CompletionNotifier {
    /// Reports that the source has produced its final message, at
    /// `final_time`.
    pub fn completed(&self, final_time: Time) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.source_completed(self.source_index, Some(final_time));
        }
    }

    /// Reports that the source runs until the pipeline is stopped.
    pub fn indefinite(&self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.source_completed(self.source_index, None);
        }
    }
}

/// Lifecycle states of a pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    /// Components may be created and wired.
    Initializing,
    /// Sources are being started; no deliveries yet.
    Starting,
    /// Messages flow.
    Running,
    /// Sources signaled; work draining.
    Stopping,
    /// All work complete; endpoints dead.
    Final,
}

/// Type-erased control surface over emitters of any payload type.
trait EmitterControl: Send + Sync {
    fn freeze(&self);
    fn close_if_open(&self, time: Time);
    fn last_time(&self) -> Option<Time>;
}

impl<T: Clone + Send + 'static> EmitterControl for Emitter<T> {
    fn freeze(&self) {
        Emitter::freeze(self);
    }
    fn close_if_open(&self, time: Time) {
        // Operator outputs close by cascade from their inputs; forcing
        // them here would race with their final posts.
        if !self.is_auto_close() {
            return;
        }
        let at = self.last_originating_time().map_or(time, |last| last.max(time));
        self.close(at);
    }
    fn last_time(&self) -> Option<Time> {
        self.last_originating_time()
    }
}

struct SourceEntry {
    name: String,
    component: Box<dyn SourceComponent>,
}

#[derive(Default)]
struct CompletionState {
    total: usize,
    finite: usize,
    indefinite: usize,
    max_final: Time,
}

impl CompletionState {
    fn all_finite_done(&self) -> bool {
        self.total > 0 && self.finite == self.total
    }
}

struct PipelineShared {
    name: String,
    scheduler: Scheduler,
    context: Arc<SchedulerContext>,
    parent: Option<Weak<PipelineShared>>,
    config: PipelineConfig,
    state: Mutex<PipelineState>,
    state_changed: Condvar,
    sources: Mutex<Vec<SourceEntry>>,
    emitters: Mutex<Vec<Box<dyn EmitterControl>>>,
    children: Mutex<Vec<Pipeline>>,
    next_emitter_id: AtomicU32,
    next_receiver_id: AtomicU64,
    completion: Mutex<CompletionState>,
    completion_changed: Condvar,
    unhandled_errors: Mutex<Vec<PipelineError>>,
    error_handlers: Mutex<Vec<Box<dyn Fn(&PipelineError) + Send + Sync>>>,
    progress_handlers: Mutex<Vec<Box<dyn Fn(f64) + Send + Sync>>>,
    descriptor: Mutex<Option<ReplayDescriptor>>,
    cancelled: AtomicBool,
}

impl PipelineShared {
    fn state(&self) -> PipelineState {
        *self.state.lock().expect("pipeline poisoned")
    }

    fn set_state(&self, state: PipelineState) {
        *self.state.lock().expect("pipeline poisoned") = state;
        self.state_changed.notify_all();
    }

    fn handle_error(&self, error: PipelineError) {
        // Subpipelines surface failures to their parent's channel.
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.handle_error(error);
            return;
        }
        let handlers = self.error_handlers.lock().expect("pipeline poisoned");
        if handlers.is_empty() {
            drop(handlers);
            self.unhandled_errors.lock().expect("pipeline poisoned").push(error);
        } else {
            for handler in handlers.iter() {
                handler(&error);
            }
        }
    }

    fn source_completed(&self, _index: usize, final_time: Option<Time>) {
        let mut completion = self.completion.lock().expect("pipeline poisoned");
        match final_time {
            Some(time) => {
                completion.finite += 1;
                completion.max_final = completion.max_final.max(time);
            }
            None => completion.indefinite += 1,
        }
        self.completion_changed.notify_all();
    }
}

/// A lifecycle-scoped execution context for a graph of components.
///
/// `Pipeline` is a cheap-clone handle; clones refer to the same
/// pipeline.
pub struct Pipeline {
    shared: Arc<PipelineShared>,
}

impl Clone for Pipeline {
    fn clone(&self) -> Self {
        Pipeline { shared: Arc::clone(&self.shared) }
    }
}

impl Pipeline {
    /// Creates a root pipeline with its own scheduler.
    pub fn new(name: &str, config: PipelineConfig) -> Pipeline {
        let scheduler = Scheduler::new(config.max_threads);
        Self::with_scheduler(name, config, scheduler, None)
    }

    /// Creates a root pipeline with default configuration.
    pub fn with_defaults(name: &str) -> Pipeline {
        Self::new(name, PipelineConfig::default())
    }

    fn with_scheduler(
        name: &str,
        config: PipelineConfig,
        scheduler: Scheduler,
        parent: Option<Weak<PipelineShared>>,
    ) -> Pipeline {
        let shared = Arc::new(PipelineShared {
            name: name.to_string(),
            scheduler,
            context: SchedulerContext::new(name),
            parent,
            config,
            state: Mutex::new(PipelineState::Initializing),
            state_changed: Condvar::new(),
            sources: Mutex::new(Vec::new()),
            emitters: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            next_emitter_id: AtomicU32::new(0),
            next_receiver_id: AtomicU64::new(0),
            completion: Mutex::new(CompletionState::default()),
            completion_changed: Condvar::new(),
            unhandled_errors: Mutex::new(Vec::new()),
            error_handlers: Mutex::new(Vec::new()),
            progress_handlers: Mutex::new(Vec::new()),
            descriptor: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        });
        let sink_target = Arc::downgrade(&shared);
        shared.context.set_error_sink(move |error| {
            if let Some(shared) = sink_target.upgrade() {
                shared.handle_error(error);
            }
        });
        Pipeline { shared }
    }

    /// The pipeline name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The current lifecycle state.
    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    /// The virtual clock of the current run.
    pub fn clock(&self) -> Clock {
        self.shared.scheduler.clock()
    }

    /// The current virtual time.
    pub fn now(&self) -> Time {
        self.clock().now()
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.shared.scheduler
    }

    pub(crate) fn context(&self) -> &Arc<SchedulerContext> {
        &self.shared.context
    }

    /// The configured default delivery policy.
    pub fn default_delivery_policy(&self) -> DeliveryPolicy {
        self.shared.config.default_delivery_policy
    }

    /// Creates a typed output endpoint owned by this pipeline.
    pub fn create_emitter<T: Clone + Send + 'static>(&self, name: &str) -> Emitter<T> {
        assert!(
            self.state() == PipelineState::Initializing,
            "emitters must be created before the pipeline starts"
        );
        let id = self.shared.next_emitter_id.fetch_add(1, Ordering::Relaxed);
        let emitter = Emitter::new(id, name, self.shared.scheduler.clone());
        self.shared
            .emitters
            .lock()
            .expect("pipeline poisoned")
            .push(Box::new(emitter.clone()));
        emitter
    }

    /// Creates a typed input endpoint running `action` for each message.
    pub fn create_receiver<T: Clone + Send + 'static>(
        &self,
        name: &str,
        action: impl FnMut(Message<T>) + Send + 'static,
    ) -> Receiver<T> {
        assert!(
            self.state() == PipelineState::Initializing,
            "receivers must be created before the pipeline starts"
        );
        let id = self.shared.next_receiver_id.fetch_add(1, Ordering::Relaxed);
        Receiver::new(
            id,
            name,
            Arc::clone(&self.shared.context),
            self.shared.scheduler.clone(),
            self.shared.config.default_delivery_policy,
            action,
        )
    }

    /// Registers a source component.
    pub fn add_source(&self, name: &str, component: impl SourceComponent + 'static) {
        assert!(
            self.state() == PipelineState::Initializing,
            "sources must be registered before the pipeline starts"
        );
        let mut sources = self.shared.sources.lock().expect("pipeline poisoned");
        sources.push(SourceEntry { name: name.to_string(), component: Box::new(component) });
        self.shared.completion.lock().expect("pipeline poisoned").total = sources.len();
    }

    /// Creates a nested pipeline sharing this pipeline's scheduler and
    /// clock but owning its own scheduling context and lifecycle.
    pub fn create_subpipeline(&self, name: &str) -> Pipeline {
        assert!(
            self.state() == PipelineState::Initializing,
            "subpipelines must be created before the pipeline starts"
        );
        let child = Pipeline::with_scheduler(
            name,
            self.shared.config.clone(),
            self.shared.scheduler.clone(),
            Some(Arc::downgrade(&self.shared)),
        );
        self.shared.children.lock().expect("pipeline poisoned").push(child.clone());
        child
    }

    /// The descriptor of the current (or last) run.
    pub fn replay_descriptor(&self) -> Option<ReplayDescriptor> {
        *self.shared.descriptor.lock().expect("pipeline poisoned")
    }

    /// Subscribes to component failures. With at least one subscriber,
    /// failures are reported and the pipeline keeps running; without
    /// any, `run` fails with an aggregate of every captured failure.
    pub fn on_error(&self, handler: impl Fn(&PipelineError) + Send + Sync + 'static) {
        self.shared.error_handlers.lock().expect("pipeline poisoned").push(Box::new(handler));
    }

    /// Subscribes to progress values in `[0, 1]`, reported at the
    /// configured interval while a bounded replay runs.
    pub fn on_progress(&self, handler: impl Fn(f64) + Send + Sync + 'static) {
        self.shared.progress_handlers.lock().expect("pipeline poisoned").push(Box::new(handler));
    }

    /// Requests cancellation of a blocking [`Pipeline::run`]; the stop
    /// protocol runs as usual.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        self.shared.completion_changed.notify_all();
    }

    /// Starts, waits for completion (all finite sources done, or
    /// cancellation), and stops. Fails with
    /// [`Error::AggregateFailure`] if component failures were captured
    /// and no error subscriber was attached.
    pub fn run(&self, descriptor: ReplayDescriptor) -> Result<(), Error> {
        self.start(descriptor)?;
        let progress_thread = self.spawn_progress_reporter(descriptor);
        let final_time = self.wait_for_completion();
        let stopped = self.stop_internal(final_time);
        if let Some(handle) = progress_thread {
            let _ = handle.join();
        }
        stopped?;
        let errors: Vec<PipelineError> =
            self.shared.unhandled_errors.lock().expect("pipeline poisoned").drain(..).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::AggregateFailure { failures: errors })
        }
    }

    /// Starts the pipeline and returns immediately; completion is
    /// observed through the returned handle.
    pub fn run_async(&self, descriptor: ReplayDescriptor) -> RunHandle {
        let pipeline = self.clone();
        let (sender, receiver) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name(format!("tempo-run-{}", self.shared.name))
            .spawn(move || {
                let _ = sender.send(pipeline.run(descriptor));
            })
            .expect("run thread");
        RunHandle { pipeline: self.clone(), receiver, _thread: thread }
    }

    /// Starts the pipeline: installs the clock, freezes the topology,
    /// starts sources (parents before children), then opens the
    /// scheduling contexts so deliveries may begin.
    pub fn start(&self, descriptor: ReplayDescriptor) -> Result<(), Error> {
        assert!(
            self.shared.parent.is_none(),
            "subpipelines are started by their parent"
        );
        descriptor.validate()?;
        let clock = Clock::with_origins(descriptor.start, Time::now(), descriptor.speed);
        self.shared.scheduler.set_clock(clock);
        self.shared.scheduler.set_enforce_replay_clock(descriptor.enforce_replay_clock);
        self.start_within(descriptor)
    }

    fn start_within(&self, descriptor: ReplayDescriptor) -> Result<(), Error> {
        {
            let state = self.shared.state.lock().expect("pipeline poisoned");
            if *state != PipelineState::Initializing {
                return Err(Error::InvalidArgument(format!(
                    "pipeline `{}` has already run",
                    self.shared.name
                )));
            }
        }
        self.shared.set_state(PipelineState::Starting);
        *self.shared.descriptor.lock().expect("pipeline poisoned") = Some(descriptor);
        debug!("starting pipeline `{}`", self.shared.name);

        for emitter in self.shared.emitters.lock().expect("pipeline poisoned").iter() {
            emitter.freeze();
        }

        // Every source starts, and receives its notifier, before the
        // context opens for delivery.
        {
            let mut sources = self.shared.sources.lock().expect("pipeline poisoned");
            for (index, entry) in sources.iter_mut().enumerate() {
                let notifier = CompletionNotifier {
                    shared: Arc::downgrade(&self.shared),
                    source_index: index,
                    fired: Arc::new(AtomicBool::new(false)),
                };
                debug!("starting source `{}`", entry.name);
                entry.component.start(notifier);
            }
        }

        // Children observe the same contract within their own context.
        for child in self.shared.children.lock().expect("pipeline poisoned").iter() {
            child.start_within(descriptor)?;
        }

        self.shared.scheduler.start_scheduling(&self.shared.context);
        self.shared.set_state(PipelineState::Running);
        Ok(())
    }

    /// Blocks until all finite sources — including those of
    /// subpipelines — have completed, or `cancel` was called, returning
    /// the final originating time to stop at.
    fn wait_for_completion(&self) -> Time {
        loop {
            if self.shared.cancelled.load(Ordering::Acquire) {
                return self.now();
            }
            if let Some(final_time) = self.completion_status() {
                return if final_time == Time::MIN { self.now() } else { final_time };
            }
            let completion = self.shared.completion.lock().expect("pipeline poisoned");
            let _ = self
                .shared
                .completion_changed
                .wait_timeout(completion, Duration::from_millis(50))
                .expect("pipeline poisoned");
        }
    }

    /// The final originating time if this pipeline and all of its
    /// children have completed, `None` otherwise. `Time::MIN` stands in
    /// for "no source ever produced".
    fn completion_status(&self) -> Option<Time> {
        let own = {
            let completion = self.shared.completion.lock().expect("pipeline poisoned");
            if completion.total == 0 {
                Some(Time::MIN)
            } else if completion.all_finite_done() && completion.indefinite == 0 {
                Some(completion.max_final)
            } else {
                None
            }
        }?;
        let mut final_time = own;
        for child in self.shared.children.lock().expect("pipeline poisoned").iter() {
            final_time = final_time.max(child.completion_status()?);
        }
        Some(final_time)
    }

    /// Public stop: runs the full protocol at the current virtual time.
    pub fn stop(&self) -> Result<(), Error> {
        self.stop_internal(self.now())
    }

    fn stop_internal(&self, final_time: Time) -> Result<(), Error> {
        {
            let state = self.shared.state.lock().expect("pipeline poisoned");
            if matches!(*state, PipelineState::Final | PipelineState::Stopping) {
                return Ok(());
            }
        }
        self.shared.set_state(PipelineState::Stopping);
        debug!("stopping pipeline `{}` at {final_time}", self.shared.name);

        // Sources first.
        for entry in self.shared.sources.lock().expect("pipeline poisoned").iter_mut() {
            entry.component.stop(final_time);
        }
        let mut outcome = Ok(());
        for child in self.shared.children.lock().expect("pipeline poisoned").iter() {
            let result = child.stop_internal(final_time);
            if outcome.is_ok() {
                outcome = result;
            }
        }

        // Drain deliveries already in flight, close endpoints so
        // downstream components observe completion, then drain the close
        // notifications and any last cascades. A drain timeout is
        // reported, but the protocol still runs to Final so waiting
        // observers are released.
        let drained = self.drain(STOP_DRAIN_TIMEOUT);
        if outcome.is_ok() {
            outcome = drained;
        }
        for emitter in self.shared.emitters.lock().expect("pipeline poisoned").iter() {
            emitter.close_if_open(final_time);
        }
        let drained = self.drain(STOP_DRAIN_TIMEOUT);
        if outcome.is_ok() {
            outcome = drained;
        }

        self.shared.scheduler.stop_scheduling(&self.shared.context);
        self.shared.set_state(PipelineState::Final);
        outcome
    }

    fn drain(&self, timeout: Duration) -> Result<(), Error> {
        let result = self.shared.scheduler.pause_for_quiescence(&self.shared.context, timeout);
        self.shared.scheduler.resume_after_quiescence(&self.shared.context);
        if let Err(error) = &result {
            warn!("pipeline `{}`: {error}", self.shared.name);
        }
        result
    }

    /// Blocks until every item in this pipeline's context due at or
    /// before the current virtual time has completed.
    pub fn pause_for_quiescence(&self, timeout: Duration) -> Result<(), Error> {
        self.shared.scheduler.pause_for_quiescence(&self.shared.context, timeout)
    }

    /// Resumes dispatch after [`Pipeline::pause_for_quiescence`].
    pub fn resume_after_quiescence(&self) {
        self.shared.scheduler.resume_after_quiescence(&self.shared.context);
    }

    /// Shuts down the root scheduler; call after the final run when the
    /// process wants its worker threads back.
    pub fn shutdown(&self) {
        assert!(self.shared.parent.is_none(), "only the root owns the scheduler");
        self.shared.scheduler.shutdown();
    }

    fn spawn_progress_reporter(
        &self,
        descriptor: ReplayDescriptor,
    ) -> Option<std::thread::JoinHandle<()>> {
        let interval = self.shared.config.progress_report_interval?;
        let end = descriptor.end?;
        let shared = Arc::clone(&self.shared);
        let span = (end - descriptor.start).ticks().max(1) as f64;
        let handle = std::thread::spawn(move || loop {
            let progress = {
                let now = shared.scheduler.clock().now();
                (((now - descriptor.start).ticks() as f64) / span).clamp(0.0, 1.0)
            };
            for handler in shared.progress_handlers.lock().expect("pipeline poisoned").iter() {
                handler(progress);
            }
            if *shared.state.lock().expect("pipeline poisoned") == PipelineState::Final {
                return;
            }
            std::thread::sleep(interval);
        });
        Some(handle)
    }
}

/// Handle over a pipeline started with [`Pipeline::run_async`].
pub struct RunHandle {
    pipeline: Pipeline,
    receiver: mpsc::Receiver<Result<(), Error>>,
    _thread: std::thread::JoinHandle<()>,
}

impl RunHandle {
    /// The running pipeline.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Waits up to `timeout` for the run to finish; `None` on timeout.
    pub fn wait(&self, timeout: Duration) -> Option<Result<(), Error>> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Requests cancellation; the run completes through the normal stop
    /// protocol.
    pub fn cancel(&self) {
        self.pipeline.cancel();
    }
}
