//! Typed input endpoints.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tempo_time::Time;

use crate::message::Message;
use crate::scheduling::{Scheduler, SchedulerContext};
use crate::streams::policy::DeliveryPolicy;

type Action<T> = Box<dyn FnMut(Message<T>) + Send>;
type ClosedHandler = Box<dyn FnMut(Time) + Send>;

/// A typed input endpoint bound to one component action.
///
/// Each receiver is dispatched on at most one worker at a time, and the
/// originating times it observes are non-decreasing. A receiver whose
/// emitter closes drains its queue per policy and then transitions to a
/// terminal Closed state, invoking its close handler once.
pub struct Receiver<T: Clone + Send + 'static> {
    pub(crate) inner: Arc<ReceiverInner<T>>,
}

impl<T: Clone + Send + 'static> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Receiver { inner: Arc::clone(&self.inner) }
    }
}

pub(crate) struct ReceiverInner<T: Clone + Send + 'static> {
    id: u64,
    name: String,
    context: Arc<SchedulerContext>,
    scheduler: Scheduler,
    policy: Mutex<DeliveryPolicy>,
    state: Mutex<ReceiverState<T>>,
    action: Mutex<Action<T>>,
    closed_handler: Mutex<Option<ClosedHandler>>,
    subscribed: AtomicBool,
    /// Queue depth mirror for the emitter's throttle check.
    depth: AtomicUsize,
}

struct ReceiverState<T> {
    queue: VecDeque<Message<T>>,
    scheduled: bool,
    pending_close: Option<Time>,
    close_delivered: bool,
    last_delivered: Option<Time>,
    dropped: u64,
}

impl<T: Clone + Send + 'static> Receiver<T> {
    pub(crate) fn new(
        id: u64,
        name: &str,
        context: Arc<SchedulerContext>,
        scheduler: Scheduler,
        policy: DeliveryPolicy,
        action: impl FnMut(Message<T>) + Send + 'static,
    ) -> Receiver<T> {
        Receiver {
            inner: Arc::new(ReceiverInner {
                id,
                name: name.to_string(),
                context,
                scheduler,
                policy: Mutex::new(policy),
                state: Mutex::new(ReceiverState {
                    queue: VecDeque::new(),
                    scheduled: false,
                    pending_close: None,
                    close_delivered: false,
                    last_delivered: None,
                    dropped: 0,
                }),
                action: Mutex::new(Box::new(action)),
                closed_handler: Mutex::new(None),
                subscribed: AtomicBool::new(false),
                depth: AtomicUsize::new(0),
            }),
        }
    }

    /// The receiver name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The receiver identity.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Registers a handler invoked once, with the closing time, after the
    /// queue has drained following the emitter's close.
    pub fn on_closed(&self, handler: impl FnMut(Time) + Send + 'static) {
        *self.inner.closed_handler.lock().expect("receiver poisoned") = Some(Box::new(handler));
    }

    /// Messages dropped by a lossy policy so far.
    pub fn dropped_count(&self) -> u64 {
        self.inner.state.lock().expect("receiver poisoned").dropped
    }

    /// Last delivered originating time, if any.
    pub fn last_delivered(&self) -> Option<Time> {
        self.inner.state.lock().expect("receiver poisoned").last_delivered
    }
}

impl<T: Clone + Send + 'static> ReceiverInner<T> {
    pub(crate) fn policy(&self) -> DeliveryPolicy {
        *self.policy.lock().expect("receiver poisoned")
    }

    pub(crate) fn set_policy(&self, policy: DeliveryPolicy) {
        *self.policy.lock().expect("receiver poisoned") = policy;
    }

    pub(crate) fn mark_subscribed(&self) {
        assert!(
            !self.subscribed.swap(true, Ordering::AcqRel),
            "receiver `{}` is already subscribed to an emitter",
            self.name
        );
    }

    pub(crate) fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Queues a message per policy and schedules a drain if none is
    /// pending. Called by the emitter with its post lock held, which is
    /// what keeps the arrival order identical across subscribers.
    pub(crate) fn enqueue(this: &Arc<Self>, message: Message<T>) {
        let due = message.creation_time();
        let mut state = this.state.lock().expect("receiver poisoned");
        if state.close_delivered {
            return;
        }
        match this.policy() {
            DeliveryPolicy::Unlimited | DeliveryPolicy::Throttled(_) => {
                state.queue.push_back(message);
            }
            DeliveryPolicy::LatestMessage => {
                state.dropped += state.queue.len() as u64;
                state.queue.clear();
                state.queue.push_back(message);
            }
            DeliveryPolicy::QueueSize(limit) => {
                if state.queue.len() >= limit.max(1) {
                    state.queue.pop_front();
                    state.dropped += 1;
                }
                state.queue.push_back(message);
            }
            DeliveryPolicy::SynchronousOrThrottle => {
                // The emitter delivers inline; nothing ever queues here.
                drop(state);
                this.note_sync_delivery(message.originating_time());
                this.deliver(message);
                return;
            }
        }
        this.depth.store(state.queue.len(), Ordering::Release);
        Self::schedule_drain(this, &mut state, due);
    }

    /// Signals that the emitter will post nothing further.
    pub(crate) fn close(this: &Arc<Self>, at: Time) {
        let mut state = this.state.lock().expect("receiver poisoned");
        if state.pending_close.is_some() || state.close_delivered {
            return;
        }
        state.pending_close = Some(at);
        Self::schedule_drain(this, &mut state, at);
    }

    fn schedule_drain(this: &Arc<Self>, state: &mut ReceiverState<T>, due: Time) {
        if !state.scheduled {
            state.scheduled = true;
            let receiver = Arc::clone(this);
            this.scheduler.schedule(&this.context, due, move || Self::drain(receiver));
        }
    }

    /// Runs queued deliveries to completion. At most one drain runs at a
    /// time per receiver; this is the single-writer guarantee.
    fn drain(this: Arc<Self>) {
        loop {
            let next = {
                let mut state = this.state.lock().expect("receiver poisoned");
                match state.queue.pop_front() {
                    Some(message) => {
                        this.depth.store(state.queue.len(), Ordering::Release);
                        debug_assert!(
                            state
                                .last_delivered
                                .is_none_or(|last| last <= message.originating_time()),
                            "delivery order regression on `{}`",
                            this.name
                        );
                        state.last_delivered = Some(message.originating_time());
                        Some(message)
                    }
                    None => {
                        if let Some(at) = state.pending_close.take() {
                            state.close_delivered = true;
                            drop(state);
                            if let Some(handler) =
                                this.closed_handler.lock().expect("receiver poisoned").as_mut()
                            {
                                handler(at);
                            }
                            let mut state = this.state.lock().expect("receiver poisoned");
                            state.scheduled = false;
                            // Messages racing with the close notification
                            // were already refused in enqueue.
                            return;
                        }
                        state.scheduled = false;
                        None
                    }
                }
            };
            match next {
                Some(message) => this.deliver(message),
                None => return,
            }
        }
    }

    /// Invokes the component action for one message. A panicking action
    /// is captured into the pipeline's error channel; the receiver keeps
    /// delivering subsequent messages.
    fn deliver(&self, message: Message<T>) {
        let mut action = self.action.lock().expect("receiver poisoned");
        let outcome =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (action)(message)));
        if let Err(payload) = outcome {
            let message = if let Some(text) = payload.downcast_ref::<&str>() {
                (*text).to_string()
            } else if let Some(text) = payload.downcast_ref::<String>() {
                text.clone()
            } else {
                String::from("receiver action panicked")
            };
            self.context.report_error(crate::error::PipelineError {
                component: self.name.clone(),
                message,
            });
        }
    }

    /// Synchronous-path ordering bookkeeping, used by the emitter.
    pub(crate) fn note_sync_delivery(&self, originating: Time) {
        let mut state = self.state.lock().expect("receiver poisoned");
        debug_assert!(state.last_delivered.is_none_or(|last| last <= originating));
        state.last_delivered = Some(originating);
    }
}
