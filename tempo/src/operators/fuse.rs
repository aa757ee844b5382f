//! Stream fusion: the primitive that time-aligns a primary stream with
//! a buffered secondary through an interpolator, and the combinators
//! built on it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tempo_time::{Envelope, Time, TimeSpan};

use crate::interpolators::{InterpolationResult, Interpolator, Lerp};
use crate::message::Message;
use crate::stream::Stream;
use crate::streams::{DeliveryPolicy, Emitter};

struct FuseState<P, S> {
    pending: VecDeque<Message<P>>,
    buffer: VecDeque<Message<S>>,
    primary_closed: Option<Time>,
    secondary_closed: Option<Time>,
    output_closed: bool,
}

struct FuseCore<P, S, O>
where
    P: Clone + Send + 'static,
    S: Clone + Send + Sync + 'static,
    O: Clone + Send + 'static,
{
    state: Mutex<FuseState<P, S>>,
    interpolator: Interpolator<S>,
    selector: Mutex<Box<dyn FnMut(&Message<P>, S) -> O + Send>>,
    output: Emitter<O>,
}

impl<P, S, O> FuseCore<P, S, O>
where
    P: Clone + Send + 'static,
    S: Clone + Send + Sync + 'static,
    O: Clone + Send + 'static,
{
    /// Matches queued primaries against the secondary buffer, in
    /// primary-time order, emitting or dropping resolved queries and
    /// pruning obsolete secondaries.
    fn process(&self) {
        let mut state = self.state.lock().expect("fuse state poisoned");
        loop {
            let Some(front) = state.pending.front() else { break };
            let query_time = front.originating_time();
            let result =
                self.interpolator
                    .interpolate(query_time, &state.buffer, state.secondary_closed);
            match result {
                InterpolationResult::Created { value, obsolete_time } => {
                    let primary = state.pending.pop_front().expect("peeked");
                    prune(&mut state.buffer, obsolete_time);
                    let output = {
                        let mut selector = self.selector.lock().expect("fuse selector poisoned");
                        selector(&primary, value)
                    };
                    self.output
                        .post(output, query_time)
                        .expect("fused posts follow primary order");
                }
                InterpolationResult::DoesNotExist { obsolete_time } => {
                    state.pending.pop_front();
                    prune(&mut state.buffer, obsolete_time);
                }
                InterpolationResult::InsufficientData => break,
            }
        }
        // The output closes once the primary has closed and every
        // queued query has resolved.
        if !state.output_closed && state.pending.is_empty() {
            if let Some(at) = state.primary_closed {
                state.output_closed = true;
                self.output.close(at);
            }
        }
    }
}

fn prune<S>(buffer: &mut VecDeque<Message<S>>, obsolete: Time) {
    while buffer
        .front()
        .is_some_and(|message| message.originating_time() <= obsolete)
    {
        buffer.pop_front();
    }
}

impl<P: Clone + Send + 'static> Stream<P> {
    /// The fusion primitive: for each primary message, queries
    /// `interpolator` against the buffered secondary and emits
    /// `selector(primary, value)` at the primary's originating time.
    /// Queries wait while the interpolator reports insufficient data,
    /// and are dropped when it reports that no value exists.
    pub fn fuse_select<S, O>(
        &self,
        secondary: &Stream<S>,
        interpolator: Interpolator<S>,
        selector: impl FnMut(&Message<P>, S) -> O + Send + 'static,
    ) -> Stream<O>
    where
        S: Clone + Send + Sync + 'static,
        O: Clone + Send + 'static,
    {
        self.fuse_core(secondary, interpolator, selector, None)
    }

    fn fuse_core<S, O>(
        &self,
        secondary: &Stream<S>,
        interpolator: Interpolator<S>,
        selector: impl FnMut(&Message<P>, S) -> O + Send + 'static,
        seed: Option<S>,
    ) -> Stream<O>
    where
        S: Clone + Send + Sync + 'static,
        O: Clone + Send + 'static,
    {
        let pipeline = self.pipeline().clone();
        let output = pipeline.create_emitter::<O>("Fuse");
        output.set_cascade_closed();

        let mut buffer = VecDeque::new();
        if let Some(value) = seed {
            // A synthetic secondary at the dawn of time, so primaries
            // arriving before any real secondary still resolve.
            buffer.push_back(Message::new(
                value,
                Envelope::new(secondary.emitter().id(), 0, Time::MIN, Time::MIN),
            ));
        }

        let core = Arc::new(FuseCore {
            state: Mutex::new(FuseState {
                pending: VecDeque::new(),
                buffer,
                primary_closed: None,
                secondary_closed: None,
                output_closed: false,
            }),
            interpolator,
            selector: Mutex::new(Box::new(selector)),
            output: output.clone(),
        });

        let primary_core = Arc::clone(&core);
        let primary_receiver = pipeline.create_receiver::<P>("Fuse.Primary", move |message| {
            primary_core.state.lock().expect("fuse state poisoned").pending.push_back(message);
            primary_core.process();
        });
        let primary_close = Arc::clone(&core);
        primary_receiver.on_closed(move |time| {
            primary_close.state.lock().expect("fuse state poisoned").primary_closed = Some(time);
            primary_close.process();
        });
        self.emitter().pipe_to(&primary_receiver, DeliveryPolicy::Unlimited);

        let secondary_core = Arc::clone(&core);
        let secondary_receiver =
            pipeline.create_receiver::<S>("Fuse.Secondary", move |message| {
                secondary_core
                    .state
                    .lock()
                    .expect("fuse state poisoned")
                    .buffer
                    .push_back(message);
                secondary_core.process();
            });
        let secondary_close = Arc::clone(&core);
        secondary_receiver.on_closed(move |time| {
            secondary_close.state.lock().expect("fuse state poisoned").secondary_closed =
                Some(time);
            secondary_close.process();
        });
        secondary.emitter().pipe_to(&secondary_receiver, DeliveryPolicy::Unlimited);

        Stream::from_emitter(output, pipeline)
    }

    /// Fuses with `secondary`, emitting `(primary, secondary)` pairs.
    pub fn fuse<S: Clone + Send + Sync + 'static>(
        &self,
        secondary: &Stream<S>,
        interpolator: Interpolator<S>,
    ) -> Stream<(P, S)> {
        self.fuse_select(secondary, interpolator, |primary, value| {
            (primary.data.clone(), value)
        })
    }

    /// Joins on exactly matching originating times. Reproducible: the
    /// result is deterministic across replays regardless of arrival
    /// order or replay speed.
    pub fn join<S: Clone + Send + Sync + 'static>(&self, secondary: &Stream<S>) -> Stream<(P, S)> {
        self.fuse(secondary, Interpolator::reproducible_exact())
    }

    /// Joins each primary with the nearest secondary within
    /// `tolerance`, deterministically.
    pub fn join_within<S: Clone + Send + Sync + 'static>(
        &self,
        secondary: &Stream<S>,
        tolerance: TimeSpan,
    ) -> Stream<(P, S)> {
        self.fuse(
            secondary,
            Interpolator::reproducible_nearest(tempo_time::RelativeTimeInterval::within(
                tolerance,
            )),
        )
    }

    /// Pairs each primary with the most recent secondary known when the
    /// primary is processed. Not reproducible by design: results depend
    /// on arrival order. `initial` seeds the pairing so primaries that
    /// precede the first real secondary still emit.
    pub fn pair<S: Clone + Send + Sync + 'static>(
        &self,
        secondary: &Stream<S>,
        initial: Option<S>,
    ) -> Stream<(P, S)> {
        self.fuse_core(
            secondary,
            Interpolator::available_last(),
            |primary, value| (primary.data.clone(), value),
            initial,
        )
    }

    /// Emits, at each primary time, the value linearly interpolated
    /// between the secondary anchors straddling that time.
    pub fn interpolate<S: Lerp + Send + Sync + 'static>(&self, secondary: &Stream<S>) -> Stream<S> {
        self.fuse_select(secondary, Interpolator::reproducible_linear(), |_, value| value)
    }

    /// Fuses with an arbitrary interpolator, emitting only the
    /// interpolated secondary value at each primary time.
    pub fn interpolate_with<S: Clone + Send + Sync + 'static>(
        &self,
        secondary: &Stream<S>,
        interpolator: Interpolator<S>,
    ) -> Stream<S> {
        self.fuse_select(secondary, interpolator, |_, value| value)
    }
}
