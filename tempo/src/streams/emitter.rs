//! Typed output endpoints with policy-shaped fan-out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use smallvec::SmallVec;

use tempo_time::{Envelope, Time};

use crate::error::Error;
use crate::message::Message;
use crate::scheduling::Scheduler;
use crate::streams::policy::DeliveryPolicy;
use crate::streams::receiver::{Receiver, ReceiverInner};

/// A typed output endpoint.
///
/// Posting stamps an envelope (strictly monotonic sequence ids,
/// non-decreasing originating times, creation time from the pipeline
/// clock) and fans the message out to every subscriber under the edge's
/// delivery policy. `post` never suspends the caller; back-pressure is
/// exerted on the source's scheduled work through
/// [`Emitter::has_capacity`].
pub struct Emitter<T: Clone + Send + 'static> {
    inner: Arc<EmitterInner<T>>,
}

impl<T: Clone + Send + 'static> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Emitter { inner: Arc::clone(&self.inner) }
    }
}

struct EmitterInner<T: Clone + Send + 'static> {
    id: u32,
    name: String,
    scheduler: Scheduler,
    frozen: AtomicBool,
    /// False for operator-owned outputs, which close by cascade when
    /// their inputs close; the pipeline force-closes only the rest.
    auto_close: AtomicBool,
    state: Mutex<EmitterState<T>>,
}

struct EmitterState<T: Clone + Send + 'static> {
    subscriptions: SmallVec<[Subscription<T>; 2]>,
    last_originating: Option<Time>,
    next_sequence: u64,
    closed_at: Option<Time>,
}

struct Subscription<T: Clone + Send + 'static> {
    receiver: Arc<ReceiverInner<T>>,
}

impl<T: Clone + Send + 'static> Emitter<T> {
    pub(crate) fn new(id: u32, name: &str, scheduler: Scheduler) -> Emitter<T> {
        Emitter {
            inner: Arc::new(EmitterInner {
                id,
                name: name.to_string(),
                scheduler,
                frozen: AtomicBool::new(false),
                auto_close: AtomicBool::new(true),
                state: Mutex::new(EmitterState {
                    subscriptions: SmallVec::new(),
                    last_originating: None,
                    next_sequence: 0,
                    closed_at: None,
                }),
            }),
        }
    }

    /// The emitter name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The emitter identity, used as the envelope source id.
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Connects this emitter to `receiver` under `policy`.
    ///
    /// Topology mutation is only allowed before the pipeline starts.
    pub fn pipe_to(&self, receiver: &Receiver<T>, policy: DeliveryPolicy) {
        assert!(
            !self.inner.frozen.load(Ordering::Acquire),
            "emitter `{}`: topology is frozen once the pipeline starts",
            self.inner.name
        );
        receiver.inner.mark_subscribed();
        receiver.inner.set_policy(policy);
        let mut state = self.inner.state.lock().expect("emitter poisoned");
        state.subscriptions.push(Subscription { receiver: Arc::clone(&receiver.inner) });
    }

    pub(crate) fn freeze(&self) {
        self.inner.frozen.store(true, Ordering::Release);
    }

    /// Marks this emitter as closed-by-cascade: the owning operator
    /// closes it when its inputs close, and the pipeline leaves it
    /// alone during stop.
    pub(crate) fn set_cascade_closed(&self) {
        self.inner.auto_close.store(false, Ordering::Release);
    }

    pub(crate) fn is_auto_close(&self) -> bool {
        self.inner.auto_close.load(Ordering::Acquire)
    }

    /// Posts a value observed at `originating_time`.
    ///
    /// Fails with [`Error::Ordering`] if the time regresses relative to
    /// the previous post, and with [`Error::InvalidArgument`] after the
    /// emitter closed. Returns the stamped envelope.
    pub fn post(&self, data: T, originating_time: Time) -> Result<Envelope, Error> {
        // The state lock is held across the fan-out so that concurrent
        // posters cannot interleave enqueues differently across
        // subscribers; synchronous receivers therefore must not post
        // back to their own emitter.
        let mut state = self.inner.state.lock().expect("emitter poisoned");
        if state.closed_at.is_some() {
            return Err(Error::InvalidArgument(format!(
                "emitter `{}` is closed",
                self.inner.name
            )));
        }
        if let Some(last) = state.last_originating {
            if originating_time < last {
                return Err(Error::Ordering {
                    emitter: self.inner.name.clone(),
                    last,
                    attempted: originating_time,
                });
            }
        }
        state.last_originating = Some(originating_time);
        let sequence_id = state.next_sequence;
        state.next_sequence += 1;

        let creation_time = self.inner.scheduler.clock().now().max(originating_time);
        let envelope =
            Envelope::new(self.inner.id, sequence_id, originating_time, creation_time);

        for subscription in &state.subscriptions {
            ReceiverInner::enqueue(&subscription.receiver, Message::new(data.clone(), envelope));
        }
        Ok(envelope)
    }

    /// True when no throttled subscriber is at or beyond its queue bound;
    /// sources consult this before scheduling their next post.
    pub fn has_capacity(&self) -> bool {
        let state = self.inner.state.lock().expect("emitter poisoned");
        state.subscriptions.iter().all(|subscription| {
            match subscription.receiver.policy() {
                DeliveryPolicy::Throttled(limit) => {
                    subscription.receiver.queue_depth() < limit.max(1)
                }
                _ => true,
            }
        })
    }

    /// Number of connected receivers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().expect("emitter poisoned").subscriptions.len()
    }

    /// Last posted originating time.
    pub fn last_originating_time(&self) -> Option<Time> {
        self.inner.state.lock().expect("emitter poisoned").last_originating
    }

    /// Closes the stream at `time`; subscribers drain and then observe
    /// the close. Closing twice is a no-op.
    pub fn close(&self, time: Time) {
        let mut state = self.inner.state.lock().expect("emitter poisoned");
        if state.closed_at.is_some() {
            return;
        }
        state.closed_at = Some(time);
        for subscription in &state.subscriptions {
            ReceiverInner::close(&subscription.receiver, time);
        }
    }

    /// The close time, if closed.
    pub fn closed_at(&self) -> Option<Time> {
        self.inner.state.lock().expect("emitter poisoned").closed_at
    }
}
